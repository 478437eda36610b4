//! In-memory timer service

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use super::{TimeDomain, TimerData, TimerInternals, TimerUpdate};
use crate::watermark::Watermark;

#[derive(Debug, Default)]
struct TimerState {
    // (namespace, id) -> timer
    timers: BTreeMap<(String, String), TimerData>,
    pending: TimerUpdate,
}

/// In-memory timer service for one (step, key) pair
///
/// Cloning yields another handle to the same service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTimerInternals {
    state: Arc<Mutex<TimerState>>,
    input_watermark: Arc<RwLock<Watermark>>,
}

impl InMemoryTimerInternals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether two handles point at the same underlying service
    pub fn same_service(&self, other: &InMemoryTimerInternals) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Advance the input watermark. Watermarks never move backwards; an
    /// older value is ignored.
    pub fn advance_input_watermark(&self, watermark: Watermark) {
        let mut current = self.input_watermark.write();
        if watermark > *current {
            *current = watermark;
        }
    }

    /// Event-time timers at or before the current input watermark
    pub fn eligible_event_timers(&self) -> Vec<TimerData> {
        let watermark = *self.input_watermark.read();
        self.timers()
            .into_iter()
            .filter(|t| t.domain == TimeDomain::EventTime && !watermark.is_before(t.timestamp))
            .collect()
    }

    /// Processing-time timers at or before `now`
    pub fn eligible_processing_timers(&self, now: DateTime<Utc>) -> Vec<TimerData> {
        self.timers()
            .into_iter()
            .filter(|t| t.domain == TimeDomain::ProcessingTime && t.timestamp <= now)
            .collect()
    }
}

impl TimerInternals for InMemoryTimerInternals {
    fn set_timer(&self, timer: TimerData) {
        trace!(namespace = %timer.namespace, id = %timer.id, at = %timer.timestamp, "Setting timer");
        let mut state = self.state.lock();
        state
            .timers
            .insert((timer.namespace.clone(), timer.id.clone()), timer.clone());
        state.pending.set.push(timer);
    }

    fn delete_timer(&self, namespace: &str, id: &str) -> Option<TimerData> {
        let mut state = self.state.lock();
        let removed = state
            .timers
            .remove(&(namespace.to_string(), id.to_string()));
        if let Some(timer) = &removed {
            trace!(namespace, id, "Deleted timer");
            state.pending.deleted.push(timer.clone());
        }
        removed
    }

    fn timers(&self) -> Vec<TimerData> {
        let mut timers: Vec<TimerData> = self.state.lock().timers.values().cloned().collect();
        timers.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        timers
    }

    fn current_input_watermark(&self) -> Watermark {
        *self.input_watermark.read()
    }

    fn take_update(&self) -> TimerUpdate {
        std::mem::take(&mut self.state.lock().pending)
    }
}
