//! Timestamps
//!
//! Every persisted timestamp (heartbeats, transitions, registrations) is
//! Unix milliseconds in a `u64`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Now, in Unix milliseconds; 0 if the clock reads before the epoch
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(as_millis)
        .unwrap_or(0)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
