use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(
        "time slot {time_slot_id} is full: requested {requested_minutes} min, {remaining_minutes} min remaining"
    )]
    TimeSlotFull {
        time_slot_id: Ulid,
        requested_minutes: i64,
        remaining_minutes: i64,
    },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Wrap with the slot/block/appointment the failure relates to.
    pub fn context(self, context: impl Into<String>) -> Self {
        EngineError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers removed.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Only a full slot can be fixed by the caller retrying with overbook.
    pub fn is_retryable_with_overbook(&self) -> bool {
        matches!(self.root(), EngineError::TimeSlotFull { .. })
    }
}
