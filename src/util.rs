//! Time helpers shared by the recorder, detector and persister.
//!
//! Wall-clock timestamps are `chrono::DateTime<Utc>`; intervals coming from
//! configuration are `std::time::Duration`.  These helpers bridge the two
//! without panicking on out-of-range values.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Convert a std duration, saturating at roughly a century.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Start of a trailing window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Milliseconds elapsed since `start`, saturating.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_subtracts() {
        let now = Utc::now();
        let start = window_start(now, Duration::from_secs(3600));
        assert_eq!((now - start).num_seconds(), 3600);
    }

    #[test]
    fn huge_windows_saturate() {
        let now = Utc::now();
        let start = window_start(now, Duration::from_secs(u64::MAX));
        assert!(start < now);
    }
}
