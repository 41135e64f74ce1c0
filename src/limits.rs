use crate::model::{DAY_MS, Ms};

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Widest block a scheduler may create.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Widest window accepted by range queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 3 * 366 * DAY_MS;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_APPOINTMENT_TYPES_PER_BLOCK: usize = 256;

pub const MAX_SLOTS_PER_BLOCK: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_SLOT: usize = 10_000;

/// Longest booking an appointment (or type default) may declare.
pub const MAX_APPOINTMENT_MINUTES: i64 = 24 * 60;

pub const MAX_LOCATION_DEPTH: usize = 64;
