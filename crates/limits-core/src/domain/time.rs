//! Conversions between wall-clock instants and store representations.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Whole seconds handed to the store as a TTL.
///
/// Rounds up so a key never expires before its window does, and never
/// returns zero since `EXPIRE key 0` deletes the key outright.
pub fn expiry_seconds(expiry: Duration) -> u64 {
    let secs = expiry.as_secs() + u64::from(expiry.subsec_nanos() > 0);
    secs.max(1)
}

/// Fractional Unix seconds, the timestamp format of window-log entries.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_unix_seconds(secs: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_seconds_rounds_up() {
        assert_eq!(expiry_seconds(Duration::from_secs(10)), 10);
        assert_eq!(expiry_seconds(Duration::from_millis(10_001)), 11);
        assert_eq!(expiry_seconds(Duration::from_millis(250)), 1);
        assert_eq!(expiry_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn test_unix_seconds_conversion() {
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let secs = unix_seconds(at);
        assert!((secs - 1_700_000_000.25).abs() < 1e-6);
        assert_eq!(from_unix_seconds(secs), at);
    }
}
