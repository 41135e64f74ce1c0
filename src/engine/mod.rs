mod capacity;
mod error;
mod lifecycle;
mod mutations;
mod overlap;
mod queries;
mod reports;
mod schedule;
mod status;

pub use capacity::{check_capacity, estimated_minutes, now_ms, remaining_minutes};
pub use error::EngineError;
pub use lifecycle::ReconcileReport;
pub use overlap::{blocks_overlap, find_overlaps};
pub use reports::{average_durations, history_count, HistorySample};
pub use schedule::{build_scheduled_block, daily_candidates, day_span, list_daily_scheduled_blocks};
pub use status::{initial_history, is_past_due, reconcile_target, record_transition, transition_instant};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::warn;
use ulid::Ulid;

use crate::locations::{LocationDirectory, LocationTree};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then flush
/// and fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes don't leak into the
    // next batch; the whole batch is reported failed.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Log and count data-quality warnings found while sizing a slot.
fn report_data_quality(slot_id: Ulid, warnings: &[DataQualityWarning]) {
    for w in warnings {
        warn!(time_slot = %slot_id, "{w}");
    }
    metrics::counter!(observability::DATA_QUALITY_WARNINGS_TOTAL).increment(warnings.len() as u64);
}

/// The booking and lifecycle engine. Each time slot sits behind its own
/// `RwLock`, so every mutation of a slot's appointments is serialized.
///
/// Lock order: compaction gate, then block lock, then slot locks (sorted by
/// id when more than one is held).
pub struct Engine {
    slots: DashMap<Ulid, SharedSlotState>,
    blocks: DashMap<Ulid, AppointmentBlock>,
    /// Block → slot ids, in creation order.
    block_slots: DashMap<Ulid, Vec<Ulid>>,
    appointment_types: DashMap<Ulid, AppointmentType>,
    /// Reverse lookup: appointment id → time slot id
    appointment_to_slot: DashMap<Ulid, Ulid>,
    /// Serializes slot creation against void and purge of the owning block.
    block_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Held shared by every mutation from its checks through apply, and
    /// exclusively by `compact_wal` while it snapshots and swaps the log.
    compaction_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    locations: Arc<dyn LocationDirectory>,
}

/// Apply a slot-scoped event (caller holds the slot lock).
fn apply_to_slot(ss: &mut SlotState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::TimeSlotVoided { reason, .. } => ss.slot.void_reason = Some(reason.clone()),
        Event::TimeSlotUnvoided { .. } => ss.slot.void_reason = None,
        Event::AppointmentBooked { appointment } => {
            index.insert(appointment.id, ss.slot.id);
            ss.insert_appointment(appointment.clone());
        }
        Event::AppointmentStatusChanged { id, status, at, .. } => {
            if let Some(a) = ss.appointment_mut(id) {
                record_transition(a, *status, *at);
            }
        }
        Event::AppointmentVoided { id, reason, .. } => {
            if let Some(a) = ss.appointment_mut(id) {
                a.void_reason = Some(reason.clone());
            }
        }
        Event::AppointmentUnvoided { id, .. } => {
            if let Some(a) = ss.appointment_mut(id) {
                a.void_reason = None;
            }
        }
        Event::AppointmentPurged { id, .. } => {
            ss.remove_appointment(*id);
            index.remove(id);
        }
        // Catalog events are applied at the DashMap level, not here
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_locations(wal_path, notify, Arc::new(LocationTree::new()))
    }

    /// Like [`Engine::new`], resolving location hierarchies through `locations`.
    pub fn with_locations(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        locations: Arc<dyn LocationDirectory>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            blocks: DashMap::new(),
            block_slots: DashMap::new(),
            appointment_types: DashMap::new(),
            appointment_to_slot: DashMap::new(),
            block_locks: DashMap::new(),
            compaction_gate: RwLock::new(()),
            wal_tx,
            notify,
            locations,
        };

        // We're the sole owner of every slot lock during replay, so try_write
        // always succeeds. Never block here: this may run inside a runtime.
        for event in &events {
            match event.time_slot_id() {
                Some(slot_id) => {
                    let Some(ss) = engine.get_slot(&slot_id) else {
                        continue;
                    };
                    let mut guard = ss
                        .try_write()
                        .map_err(|_| io::Error::other("replay: slot lock contended"))?;
                    apply_to_slot(&mut guard, event, &engine.appointment_to_slot);
                }
                None => engine.apply_catalog(event),
            }
        }
        metrics::gauge!(observability::TIME_SLOTS_ACTIVE).set(engine.slots.len() as f64);
        tracing::info!(
            events = events.len(),
            slots = engine.slots.len(),
            appointments = engine.appointment_to_slot.len(),
            "engine state replayed"
        );

        Ok(engine)
    }

    /// Apply an event that touches reference data, blocks, or the slot set.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::AppointmentTypeSaved { appointment_type } => {
                self.appointment_types
                    .insert(appointment_type.id, appointment_type.clone());
            }
            Event::AppointmentTypeRetired { id, reason } => {
                if let Some(mut t) = self.appointment_types.get_mut(id) {
                    t.retire_reason = Some(reason.clone());
                }
            }
            Event::AppointmentTypeUnretired { id } => {
                if let Some(mut t) = self.appointment_types.get_mut(id) {
                    t.retire_reason = None;
                }
            }
            Event::AppointmentTypePurged { id } => {
                self.appointment_types.remove(id);
            }
            Event::BlockSaved { block } => {
                self.blocks.insert(block.id, block.clone());
            }
            Event::BlockVoided { id, reason } => {
                if let Some(mut b) = self.blocks.get_mut(id) {
                    b.void_reason = Some(reason.clone());
                }
            }
            Event::BlockUnvoided { id } => {
                if let Some(mut b) = self.blocks.get_mut(id) {
                    b.void_reason = None;
                }
            }
            Event::BlockPurged { id } => {
                self.blocks.remove(id);
                self.block_slots.remove(id);
            }
            Event::TimeSlotCreated { slot } => {
                self.block_slots.entry(slot.block_id).or_default().push(slot.id);
                self.slots
                    .insert(slot.id, Arc::new(RwLock::new(SlotState::new(slot.clone()))));
            }
            Event::TimeSlotPurged { id, block_id } => {
                self.slots.remove(id);
                if let Some(mut ids) = self.block_slots.get_mut(block_id) {
                    ids.retain(|s| s != id);
                }
                self.notify.remove(id);
            }
            // Slot-scoped events go through apply_to_slot under the slot lock
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_slot
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// Default duration of an appointment type, if it has one.
    fn type_minutes(&self, appointment_type_id: &Ulid) -> Option<i64> {
        self.appointment_types
            .get(appointment_type_id)
            .and_then(|t| t.duration_minutes)
    }

    /// Shared hold on the compaction gate. Take it once per operation, before
    /// any block or slot lock.
    async fn mutation_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction_gate.read().await
    }

    async fn lock_block(&self, block_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.block_locks.entry(block_id).or_default().clone();
        lock.lock_owned().await
    }

    /// WAL-append + apply + notify for a slot-scoped event.
    async fn persist_and_apply(
        &self,
        slot_id: Ulid,
        ss: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(ss, event, &self.appointment_to_slot);
        self.notify.send(slot_id, event);
        Ok(())
    }

    /// WAL-append + apply for a catalog event.
    async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    /// Lookup appointment → slot, acquire the slot's write lock, and confirm
    /// the appointment is still there.
    async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<SlotState>), EngineError> {
        let slot_id = self
            .slot_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let ss = self
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = ss.write_owned().await;
        if guard.appointment(appointment_id).is_none() {
            return Err(EngineError::NotFound(*appointment_id));
        }
        Ok((slot_id, guard))
    }
}
