//! Core identities and work item structures
//!
//! This module provides the fundamental types the evaluator works with:
//! - RoutingKey: opaque identity that binds work to per-key state and timers
//! - StepId: identity of one applied step in the pipeline graph
//! - OutputTag: name of an output destination of a step
//! - KeyedWorkItem: one element plus the restriction still to be processed
//! - CommittedBundle: the immutable batch of work items handed to an evaluator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::window::WindowedValue;

/// Opaque identity used to resolve per-key state and timers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Identity of an applied step
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(String);

impl StepId {
    pub fn new(step: impl Into<String>) -> Self {
        Self(step.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(step: &str) -> Self {
        Self::new(step)
    }
}

/// Name of an output destination
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputTag(String);

impl OutputTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OutputTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// One element together with the restriction still to be processed for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedWorkItem<I, R> {
    /// Key binding this item to per-key state and timers
    pub key: RoutingKey,
    /// The input element with its already-resolved windows
    pub element: WindowedValue<I>,
    /// Description of the work left for this element
    pub restriction: R,
}

impl<I, R> KeyedWorkItem<I, R> {
    /// Create a new work item
    pub fn new(key: impl Into<RoutingKey>, element: WindowedValue<I>, restriction: R) -> Self {
        Self {
            key: key.into(),
            element,
            restriction,
        }
    }

    /// A follow-up item for the same element covering a residual restriction
    pub fn resume_with(&self, residual: R) -> Self
    where
        I: Clone,
    {
        Self {
            key: self.key.clone(),
            element: self.element.clone(),
            restriction: residual,
        }
    }
}

/// An immutable batch of work items that share one routing key
#[derive(Debug, Clone)]
pub struct CommittedBundle<I, R> {
    id: Uuid,
    key: RoutingKey,
    items: Vec<KeyedWorkItem<I, R>>,
    committed_at: DateTime<Utc>,
}

impl<I, R> CommittedBundle<I, R> {
    /// Commit a bundle of items for the given key
    pub fn new(key: impl Into<RoutingKey>, items: Vec<KeyedWorkItem<I, R>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            items,
            committed_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn items(&self) -> &[KeyedWorkItem<I, R>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    /// Consume the bundle, yielding its items in commit order
    pub fn into_items(self) -> Vec<KeyedWorkItem<I, R>> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_display() {
        assert_eq!(RoutingKey::new("user-1").to_string(), "user-1");
        assert_eq!(StepId::from("read").as_str(), "read");
        assert_eq!(OutputTag::from("main").to_string(), "main");
    }

    #[test]
    fn test_resume_with_keeps_element() {
        let element = WindowedValue::in_global_window("file.txt".to_string(), Utc::now());
        let item = KeyedWorkItem::new("k", element, 0u64..100);

        let resumed = item.resume_with(40..100);
        assert_eq!(resumed.key, item.key);
        assert_eq!(resumed.element, item.element);
        assert_eq!(resumed.restriction, 40..100);
    }

    #[test]
    fn test_bundle_preserves_item_order() {
        let now = Utc::now();
        let items = (0..3)
            .map(|i| KeyedWorkItem::new("k", WindowedValue::in_global_window(i, now), ()))
            .collect();
        let bundle = CommittedBundle::new("k", items);

        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.key().as_str(), "k");
        let values: Vec<i32> = bundle.into_items().into_iter().map(|i| i.element.value).collect();
        assert_eq!(values, vec![0, 1, 2]);
    }
}
