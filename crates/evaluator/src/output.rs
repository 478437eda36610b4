//! Output routing
//!
//! An [`OutputRouter`] forwards every value a function emits to the bundle's
//! [`OutputManager`] under the tag it was emitted to. Values are forwarded
//! as soon as they are emitted; nothing is buffered or reordered here.
//!
//! Every tag a step declares is checked against the sink once, when the
//! router is built. Emitting to a tag the step never declared fails.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::core::{OutputTag, RoutingKey, StepId};
use crate::error::{RoutingError, RoutingResult};
use crate::window::{PaneInfo, Window, WindowedValue};

/// Destination for a bundle's outputs
pub trait OutputManager<O>: Send + Sync {
    /// Whether the sink has a destination for `tag`
    fn accepts(&self, tag: &OutputTag) -> bool;

    /// Deliver one value to the destination for `tag`
    fn output(&self, tag: &OutputTag, value: WindowedValue<O>) -> RoutingResult<()>;
}

/// Supplies the output sink for an evaluation of (step, key)
pub trait OutputSinkProvider<O>: Send + Sync {
    fn sink_for(&self, step: &StepId, key: &RoutingKey) -> RoutingResult<Arc<dyn OutputManager<O>>>;
}

/// In-memory sink recording every delivered value in arrival order
pub struct InMemoryOutputManager<O> {
    tags: HashSet<OutputTag>,
    closed: DashMap<OutputTag, String>,
    delivered: Mutex<Vec<(OutputTag, WindowedValue<O>)>>,
}

impl<O> InMemoryOutputManager<O> {
    /// Create a sink with destinations for `tags`
    pub fn new(tags: impl IntoIterator<Item = OutputTag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            closed: DashMap::new(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Reject every later value for `tag`
    pub fn close(&self, tag: &OutputTag, reason: impl Into<String>) {
        self.closed.insert(tag.clone(), reason.into());
    }

    /// Number of values delivered across all tags
    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O: Clone> InMemoryOutputManager<O> {
    /// Every delivery in arrival order
    pub fn deliveries(&self) -> Vec<(OutputTag, WindowedValue<O>)> {
        self.delivered.lock().clone()
    }

    /// Values delivered to `tag`, in arrival order
    pub fn outputs_for(&self, tag: &OutputTag) -> Vec<WindowedValue<O>> {
        self.delivered
            .lock()
            .iter()
            .filter(|(t, _)| t == tag)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Bare values delivered to `tag`, in arrival order
    pub fn values_for(&self, tag: &OutputTag) -> Vec<O> {
        self.outputs_for(tag).into_iter().map(|v| v.value).collect()
    }
}

impl<O: Send + Sync> OutputManager<O> for InMemoryOutputManager<O> {
    fn accepts(&self, tag: &OutputTag) -> bool {
        self.tags.contains(tag)
    }

    fn output(&self, tag: &OutputTag, value: WindowedValue<O>) -> RoutingResult<()> {
        if let Some(reason) = self.closed.get(tag) {
            return Err(RoutingError::SinkRejected {
                tag: tag.to_string(),
                reason: reason.value().clone(),
            });
        }
        self.delivered.lock().push((tag.clone(), value));
        Ok(())
    }
}

/// Every evaluation shares one sink
impl<O: Send + Sync + 'static> OutputSinkProvider<O> for Arc<InMemoryOutputManager<O>> {
    fn sink_for(&self, _step: &StepId, _key: &RoutingKey) -> RoutingResult<Arc<dyn OutputManager<O>>> {
        let sink: Arc<dyn OutputManager<O>> = self.clone();
        Ok(sink)
    }
}

/// Routes emitted values to the sink under their declared tag
pub struct OutputRouter<O> {
    step: StepId,
    main_tag: OutputTag,
    declared: HashSet<OutputTag>,
    sink: Arc<dyn OutputManager<O>>,
    counts: DashMap<OutputTag, u64>,
    // First failed emit, kept even if the function discards the error
    first_failure: Mutex<Option<RoutingError>>,
}

impl<O> OutputRouter<O> {
    /// Build a router for a step's main and side outputs.
    ///
    /// Fails if the sink has no destination for one of the declared tags.
    pub fn new(
        step: StepId,
        main_tag: OutputTag,
        side_tags: impl IntoIterator<Item = OutputTag>,
        sink: Arc<dyn OutputManager<O>>,
    ) -> RoutingResult<Self> {
        let mut declared: HashSet<OutputTag> = side_tags.into_iter().collect();
        declared.insert(main_tag.clone());

        if let Some(tag) = declared.iter().find(|tag| !sink.accepts(tag)) {
            debug!(step = %step, tag = %tag, "Sink has no destination for declared output");
            return Err(RoutingError::UnsupportedDestination {
                step: step.to_string(),
                tag: tag.to_string(),
            });
        }

        let counts = declared.iter().map(|tag| (tag.clone(), 0)).collect();
        Ok(Self {
            step,
            main_tag,
            declared,
            sink,
            counts,
            first_failure: Mutex::new(None),
        })
    }

    pub fn main_tag(&self) -> &OutputTag {
        &self.main_tag
    }

    pub fn is_declared(&self, tag: &OutputTag) -> bool {
        self.declared.contains(tag)
    }

    /// Forward one value to the sink under `tag`
    pub fn route(
        &self,
        tag: &OutputTag,
        value: O,
        timestamp: DateTime<Utc>,
        windows: Vec<Window>,
        pane: PaneInfo,
    ) -> RoutingResult<()> {
        if !self.declared.contains(tag) {
            return Err(self.record(RoutingError::UndeclaredTag {
                step: self.step.to_string(),
                tag: tag.to_string(),
            }));
        }

        self.sink
            .output(tag, WindowedValue::of(value, timestamp, windows, pane))
            .map_err(|err| self.record(err))?;

        if let Some(mut count) = self.counts.get_mut(tag) {
            *count += 1;
        }
        trace!(step = %self.step, tag = %tag, "Routed output");
        Ok(())
    }

    /// Take the first routing failure since the last call, if any
    pub fn take_failure(&self) -> Option<RoutingError> {
        self.first_failure.lock().take()
    }

    fn record(&self, err: RoutingError) -> RoutingError {
        debug!(step = %self.step, error = %err, "Routing failed");
        let mut first = self.first_failure.lock();
        if first.is_none() {
            *first = Some(err.clone());
        }
        err
    }

    /// Values routed so far, per declared tag
    pub fn output_counts(&self) -> BTreeMap<OutputTag, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> Arc<InMemoryOutputManager<String>> {
        Arc::new(InMemoryOutputManager::new([
            OutputTag::from("main"),
            OutputTag::from("late"),
        ]))
    }

    fn router(sink: Arc<InMemoryOutputManager<String>>) -> OutputRouter<String> {
        OutputRouter::new("parse".into(), "main".into(), vec!["late".into()], sink).unwrap()
    }

    #[test]
    fn test_route_preserves_value_and_metadata() {
        let sink = sink();
        let router = router(sink.clone());
        let ts = Utc::now();
        let window = Window::new(crate::window::WindowBounds::new(ts, ts + chrono::Duration::minutes(1)));
        let pane = PaneInfo::new(crate::window::PaneTiming::OnTime, 2, true);

        router
            .route(&"late".into(), "x".to_string(), ts, vec![window.clone()], pane)
            .unwrap();

        let delivered = sink.outputs_for(&"late".into());
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].value, "x");
        assert_eq!(delivered[0].timestamp, ts);
        assert_eq!(delivered[0].windows, vec![window]);
        assert_eq!(delivered[0].pane, pane);
    }

    #[test]
    fn test_route_keeps_emission_order_across_tags() {
        let sink = sink();
        let router = router(sink.clone());
        let ts = Utc::now();

        for (tag, value) in [("main", "a"), ("late", "b"), ("main", "c")] {
            router
                .route(&tag.into(), value.to_string(), ts, vec![Window::global()], PaneInfo::no_firing())
                .unwrap();
        }

        let order: Vec<(String, String)> = sink
            .deliveries()
            .into_iter()
            .map(|(tag, v)| (tag.to_string(), v.value))
            .collect();
        assert_eq!(
            order,
            vec![
                ("main".to_string(), "a".to_string()),
                ("late".to_string(), "b".to_string()),
                ("main".to_string(), "c".to_string()),
            ]
        );

        let counts = router.output_counts();
        assert_eq!(counts[&OutputTag::from("main")], 2);
        assert_eq!(counts[&OutputTag::from("late")], 1);
    }

    #[test]
    fn test_undeclared_tag_rejected() {
        let sink = sink();
        let router = router(sink.clone());

        let err = router
            .route(&"audit".into(), "x".to_string(), Utc::now(), vec![], PaneInfo::no_firing())
            .unwrap_err();
        assert!(matches!(err, RoutingError::UndeclaredTag { .. }));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_declared_tag_without_destination_fails_construction() {
        let sink: Arc<InMemoryOutputManager<String>> =
            Arc::new(InMemoryOutputManager::new([OutputTag::from("main")]));

        let err = OutputRouter::<String>::new("parse".into(), "main".into(), vec!["late".into()], sink)
            .err()
            .unwrap();
        assert!(matches!(err, RoutingError::UnsupportedDestination { ref tag, .. } if tag == "late"));
    }

    #[test]
    fn test_sink_rejection_is_not_counted() {
        let sink = sink();
        let router = router(sink.clone());
        sink.close(&"main".into(), "downstream closed");

        let err = router
            .route(&"main".into(), "x".to_string(), Utc::now(), vec![], PaneInfo::no_firing())
            .unwrap_err();
        assert!(matches!(err, RoutingError::SinkRejected { .. }));
        assert_eq!(router.output_counts()[&OutputTag::from("main")], 0);
    }

    #[test]
    fn test_first_failure_is_kept_until_taken() {
        let sink = sink();
        let router = router(sink.clone());
        sink.close(&"main".into(), "downstream closed");

        let _ = router.route(&"main".into(), "x".to_string(), Utc::now(), vec![], PaneInfo::no_firing());
        let _ = router.route(&"audit".into(), "y".to_string(), Utc::now(), vec![], PaneInfo::no_firing());

        assert!(matches!(router.take_failure(), Some(RoutingError::SinkRejected { .. })));
        assert!(router.take_failure().is_none());

        router
            .route(&"late".into(), "z".to_string(), Utc::now(), vec![], PaneInfo::no_firing())
            .unwrap();
        assert!(router.take_failure().is_none());
    }
}
