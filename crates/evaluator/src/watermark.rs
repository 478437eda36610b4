//! Watermark timestamps
//!
//! A watermark states that no more input with an earlier event time is
//! expected. Timer services report the current input watermark so functions
//! can decide whether event-time timers are already due.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a watermark timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, saturating at the representable range
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or(if self.timestamp < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Returns the maximum possible watermark (end of time)
    pub fn max() -> Self {
        Self { timestamp: i64::MAX }
    }

    /// Checks if this watermark is before the given timestamp
    pub fn is_before(&self, timestamp: DateTime<Utc>) -> bool {
        self.timestamp < timestamp.timestamp_millis()
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            return write!(f, "Watermark(min)");
        }
        write!(f, "Watermark({})", self.to_datetime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_watermark_ordering() {
        assert!(Watermark::min() < Watermark::new(0));
        assert!(Watermark::new(0) < Watermark::max());
        assert_eq!(Watermark::default(), Watermark::min());
    }

    #[test]
    fn test_watermark_datetime_roundtrip() {
        let dt = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let wm = Watermark::from_datetime(dt);
        assert_eq!(wm.to_datetime(), dt);
        assert!(wm.is_before(dt + chrono::Duration::milliseconds(1)));
        assert!(!wm.is_before(dt));
    }

    #[test]
    fn test_extreme_watermarks_saturate() {
        assert_eq!(Watermark::min().to_datetime(), DateTime::<Utc>::MIN_UTC);
        assert_eq!(Watermark::max().to_datetime(), DateTime::<Utc>::MAX_UTC);
    }
}
