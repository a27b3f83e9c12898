//! Utility module

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds per second, for timestamp folding.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Fold seconds and nanoseconds into one nanosecond timestamp.
#[must_use]
pub fn fold_timestamp(sec: i64, nsec: i64) -> i64 {
    sec.saturating_mul(NANOS_PER_SEC).saturating_add(nsec)
}

/// Wall-clock nanoseconds since the epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_timestamp() {
        assert_eq!(fold_timestamp(1, 5), 1_000_000_005);
        assert_eq!(fold_timestamp(0, 0), 0);
    }

    #[test]
    fn test_now_nanos_is_positive() {
        assert!(now_nanos() > 0);
    }
}
