//! Epoch-second clock, day arithmetic and ULID run ids.

use ulid::Ulid;

pub const SECS_PER_DAY: u64 = 86_400;

/// Unix-epoch seconds. Record ids and signature timestamps use this unit.
pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

/// Fractional days between two epoch-second instants, zero when `later` precedes `earlier`.
pub fn days_between(earlier: u64, later: u64) -> f64 {
    later.saturating_sub(earlier) as f64 / SECS_PER_DAY as f64
}
