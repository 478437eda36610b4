//! Pane metadata
//!
//! A pane identifies which firing of a window an output belongs to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timing of a pane relative to the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneTiming {
    /// Fired before the watermark passed the end of the window
    Early,
    /// Fired when the watermark passed the end of the window
    OnTime,
    /// Fired after the watermark passed the end of the window
    Late,
    /// Timing is not known, e.g. for values never grouped by a trigger
    Unknown,
}

/// Describes one firing of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneInfo {
    pub timing: PaneTiming,
    /// Zero-based index of this firing within its window
    pub index: u64,
    pub is_first: bool,
    pub is_last: bool,
}

impl PaneInfo {
    /// The pane of a value that was never triggered: the first and only firing
    pub fn no_firing() -> Self {
        Self {
            timing: PaneTiming::Unknown,
            index: 0,
            is_first: true,
            is_last: true,
        }
    }

    /// Create a pane with explicit timing and index
    pub fn new(timing: PaneTiming, index: u64, is_last: bool) -> Self {
        Self {
            timing,
            index,
            is_first: index == 0,
            is_last,
        }
    }
}

impl Default for PaneInfo {
    fn default() -> Self {
        Self::no_firing()
    }
}

impl fmt::Display for PaneInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pane({:?}, #{}", self.timing, self.index)?;
        if self.is_last {
            write!(f, ", last")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_firing_pane() {
        let pane = PaneInfo::default();
        assert_eq!(pane.timing, PaneTiming::Unknown);
        assert!(pane.is_first);
        assert!(pane.is_last);
    }

    #[test]
    fn test_pane_first_is_derived_from_index() {
        assert!(PaneInfo::new(PaneTiming::Early, 0, false).is_first);
        assert!(!PaneInfo::new(PaneTiming::Late, 2, true).is_first);
    }
}
