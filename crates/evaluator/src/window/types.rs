//! Window types and bounds
//!
//! Windows are resolved upstream; this module only carries them alongside
//! values so output metadata can be forwarded unchanged.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const GLOBAL_WINDOW_ID: &str = "global";

/// Half-open time span `[start, end)` covered by a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Bounds spanning all representable time
    pub fn unbounded() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        (self.start..self.end).contains(&timestamp)
    }

    /// The latest timestamp an element of this window may carry
    pub fn max_timestamp(&self) -> DateTime<Utc> {
        self.end - Duration::milliseconds(1)
    }

    fn span_millis(&self) -> (i64, i64) {
        (self.start.timestamp_millis(), self.end.timestamp_millis())
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = self.span_millis();
        write!(f, "[{}ms, {}ms)", start, end)
    }
}

/// A window an element belongs to
///
/// The id doubles as the state namespace for values scoped to the window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub bounds: WindowBounds,
    pub id: String,
}

impl Window {
    pub fn new(bounds: WindowBounds) -> Self {
        let (start, end) = bounds.span_millis();
        Self {
            bounds,
            id: format!("{}_{}", start, end),
        }
    }

    /// The single window covering all time
    pub fn global() -> Self {
        Self {
            bounds: WindowBounds::unbounded(),
            id: GLOBAL_WINDOW_ID.to_string(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_WINDOW_ID
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.bounds.contains(timestamp)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            f.write_str("Window[global]")
        } else {
            write!(f, "Window{}", self.bounds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_bounds_are_half_open() {
        let bounds = WindowBounds::new(at(1000), at(2000));

        assert!(!bounds.contains(at(999)));
        assert!(bounds.contains(at(1000)));
        assert!(bounds.contains(at(1999)));
        assert!(!bounds.contains(at(2000)));
        assert_eq!(bounds.max_timestamp(), at(1999));
    }

    #[test]
    #[should_panic(expected = "Window start must be before end")]
    fn test_inverted_bounds_rejected() {
        WindowBounds::new(at(2000), at(1000));
    }

    #[test]
    fn test_window_id_and_display() {
        let window = Window::new(WindowBounds::new(at(1000), at(2000)));

        assert_eq!(window.id, "1000_2000");
        assert!(!window.is_global());
        assert_eq!(window.to_string(), "Window[1000ms, 2000ms)");
    }

    #[test]
    fn test_global_window() {
        let window = Window::global();

        assert!(window.is_global());
        assert!(window.contains(at(0)));
        assert!(window.contains(Utc::now()));
        assert_eq!(window.to_string(), "Window[global]");
    }
}
