//! Wall clock timestamps attached to task lifecycle events.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall clock timestamp with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub seconds: u64,
    /// Sub-second nanoseconds
    pub nanos: u32,
}

impl Timestamp {
    /// Maximum nanoseconds per second
    pub const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// Create a new timestamp
    #[must_use]
    pub fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Current wall clock time
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert from a chrono datetime; instants before the epoch clamp to zero
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let seconds = u64::try_from(dt.timestamp()).unwrap_or(0);
        Self {
            seconds,
            nanos: dt.timestamp_subsec_nanos(),
        }
    }

    /// Convert to a chrono datetime
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let seconds = i64::try_from(self.seconds).ok()?;
        Utc.timestamp_opt(seconds, self.nanos).single()
    }

    /// Convert to milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u128 {
        self.seconds as u128 * 1_000 + self.nanos as u128 / 1_000_000
    }

    /// Elapsed time since an earlier timestamp; zero if `earlier` is later
    #[must_use]
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        let this = Duration::new(self.seconds, self.nanos);
        let other = Duration::new(earlier.seconds, earlier.nanos);
        this.saturating_sub(other)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}.{:09}", self.seconds, self.nanos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_now_is_after_epoch() {
        let t = Timestamp::now();
        assert!(t.seconds > 1_600_000_000);
        assert!(t.nanos < Timestamp::NANOS_PER_SEC);
    }

    #[test]
    fn test_duration_since() {
        let t1 = Timestamp::new(100, 500_000_000);
        let t2 = Timestamp::new(102, 200_000_000);

        assert_eq!(t2.duration_since(&t1), Duration::from_millis(1_700));
        assert_eq!(t1.duration_since(&t2), Duration::ZERO);
    }

    #[test]
    fn test_datetime_roundtrip() {
        let t = Timestamp::new(1_700_000_000, 123_000_000);
        let dt = t.to_datetime().unwrap();
        assert_eq!(Timestamp::from_datetime(dt), t);
        assert_eq!(t.as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_display_is_rfc3339() {
        let t = Timestamp::new(0, 0);
        assert_eq!(format!("{}", t), "1970-01-01T00:00:00+00:00");
    }
}
