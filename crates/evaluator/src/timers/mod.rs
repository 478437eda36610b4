//! Per-key timers
//!
//! [`TimerInternals`] is the timer-service contract bound to each
//! (step, key) pair. Setting a timer with an id that already exists in the
//! same namespace replaces it.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watermark::Watermark;

pub use memory::InMemoryTimerInternals;

/// Time domain a timer fires in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDomain {
    /// Fires when the input watermark passes the timestamp
    EventTime,
    /// Fires when the wall clock passes the timestamp
    ProcessingTime,
}

/// A timer scheduled by a function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerData {
    pub id: String,
    /// State namespace the timer belongs to, usually a window id
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
    pub domain: TimeDomain,
}

impl TimerData {
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        timestamp: DateTime<Utc>,
        domain: TimeDomain,
    ) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            timestamp,
            domain,
        }
    }
}

/// Timers set and deleted since the last update was taken
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerUpdate {
    pub set: Vec<TimerData>,
    pub deleted: Vec<TimerData>,
}

impl TimerUpdate {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.deleted.is_empty()
    }
}

/// Timer service bound to exactly one (step, key) pair
pub trait TimerInternals: Send + Sync {
    /// Schedule a timer, replacing one with the same namespace and id
    fn set_timer(&self, timer: TimerData);

    /// Delete a timer. Returns the removed timer if it existed.
    fn delete_timer(&self, namespace: &str, id: &str) -> Option<TimerData>;

    /// Every timer currently scheduled, ordered by timestamp
    fn timers(&self) -> Vec<TimerData>;

    /// The input watermark seen by this key
    fn current_input_watermark(&self) -> Watermark;

    /// Current processing time
    fn current_processing_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Drain the timers set and deleted since the previous call
    fn take_update(&self) -> TimerUpdate;
}
