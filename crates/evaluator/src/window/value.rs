//! Values carrying their windowing metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PaneInfo, Window};

/// A value together with its event timestamp, windows and pane
///
/// One input element may belong to several windows; outputs carry whatever
/// window set the producing function attached to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedValue<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
    pub windows: Vec<Window>,
    pub pane: PaneInfo,
}

impl<T> WindowedValue<T> {
    /// Create a windowed value
    pub fn of(value: T, timestamp: DateTime<Utc>, windows: Vec<Window>, pane: PaneInfo) -> Self {
        Self {
            value,
            timestamp,
            windows,
            pane,
        }
    }

    /// A value in the global window with no firing
    pub fn in_global_window(value: T, timestamp: DateTime<Utc>) -> Self {
        Self::of(value, timestamp, vec![Window::global()], PaneInfo::no_firing())
    }

    /// Replace the value, keeping timestamp, windows and pane
    pub fn with_value<U>(&self, value: U) -> WindowedValue<U> {
        WindowedValue {
            value,
            timestamp: self.timestamp,
            windows: self.windows.clone(),
            pane: self.pane,
        }
    }

    /// Map the value, keeping the windowing metadata
    pub fn map<U, F>(self, f: F) -> WindowedValue<U>
    where
        F: FnOnce(T) -> U,
    {
        WindowedValue {
            value: f(self.value),
            timestamp: self.timestamp,
            windows: self.windows,
            pane: self.pane,
        }
    }
}
