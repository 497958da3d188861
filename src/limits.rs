use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single booking may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_HOLDER_ID_LEN: usize = 128;
pub const MAX_UNITS_PER_INVENTORY: u32 = 1_000_000;
pub const MAX_BOOKINGS_PER_VENUE: usize = 100_000;

/// Largest encoded WAL record. A longer length prefix is read as corruption.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Overdue claims released concurrently by one sweep.
pub const SWEEP_CONCURRENCY: usize = 16;
