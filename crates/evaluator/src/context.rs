//! Per-key context resolution
//!
//! Every (step, key) pair owns exactly one state store and one timer service
//! for the lifetime of the step. [`KeyedContextRegistry`] creates those
//! bindings lazily through a [`ContextBackend`] and hands out cheap clones of
//! the same binding on every later lookup.
//!
//! Creation happens under the map's entry lock, so two evaluations racing to
//! resolve the same key always end up with the same binding.

use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::core::{RoutingKey, StepId};
use crate::error::{ContextError, ContextResult};
use crate::state::{InMemoryStateInternals, StateInternals};
use crate::timers::{InMemoryTimerInternals, TimerInternals};

/// Identifier of one created binding, unique per registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

/// State and timers bound to one (step, key) pair
#[derive(Clone)]
pub struct PerKeyContext {
    binding: BindingId,
    step: StepId,
    key: RoutingKey,
    state: Arc<dyn StateInternals>,
    timers: Arc<dyn TimerInternals>,
}

impl PerKeyContext {
    pub fn new(
        binding: BindingId,
        step: StepId,
        key: RoutingKey,
        state: Arc<dyn StateInternals>,
        timers: Arc<dyn TimerInternals>,
    ) -> Self {
        Self {
            binding,
            step,
            key,
            state,
            timers,
        }
    }

    pub fn binding(&self) -> BindingId {
        self.binding
    }

    pub fn step(&self) -> &StepId {
        &self.step
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn state_internals(&self) -> Arc<dyn StateInternals> {
        Arc::clone(&self.state)
    }

    pub fn timer_internals(&self) -> Arc<dyn TimerInternals> {
        Arc::clone(&self.timers)
    }

    /// Whether both contexts are bound to the same underlying state store and
    /// timer service
    pub fn same_binding(&self, other: &PerKeyContext) -> bool {
        Arc::as_ptr(&self.state) as *const () == Arc::as_ptr(&other.state) as *const ()
            && Arc::as_ptr(&self.timers) as *const () == Arc::as_ptr(&other.timers) as *const ()
    }
}

impl fmt::Debug for PerKeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerKeyContext")
            .field("binding", &self.binding)
            .field("step", &self.step)
            .field("key", &self.key)
            .finish()
    }
}

/// Creates the state store and timer service for a new (step, key) pair
pub trait ContextBackend: Send + Sync {
    fn create(
        &self,
        step: &StepId,
        key: &RoutingKey,
    ) -> ContextResult<(Arc<dyn StateInternals>, Arc<dyn TimerInternals>)>;
}

/// Backend creating in-memory state and timers
#[derive(Debug, Clone, Default)]
pub struct InMemoryContextBackend {
    state_ttl: Option<Duration>,
}

impl InMemoryContextBackend {
    pub fn new(state_ttl: Option<Duration>) -> Self {
        Self { state_ttl }
    }
}

impl ContextBackend for InMemoryContextBackend {
    fn create(
        &self,
        _step: &StepId,
        _key: &RoutingKey,
    ) -> ContextResult<(Arc<dyn StateInternals>, Arc<dyn TimerInternals>)> {
        Ok((
            Arc::new(InMemoryStateInternals::new(self.state_ttl)),
            Arc::new(InMemoryTimerInternals::new()),
        ))
    }
}

/// Resolves the per-key context for a (step, key) pair
pub trait ContextResolver: Send + Sync {
    /// Return the binding for `(step, key)`, creating it on first use.
    /// Repeated calls return the same underlying state and timers.
    fn resolve(&self, step: &StepId, key: &RoutingKey) -> ContextResult<PerKeyContext>;
}

/// Registry of per-key contexts for every live step
pub struct KeyedContextRegistry {
    contexts: DashMap<(StepId, RoutingKey), PerKeyContext>,
    retired: DashSet<StepId>,
    backend: Arc<dyn ContextBackend>,
    next_binding: AtomicU64,
}

impl KeyedContextRegistry {
    /// Create a registry on top of the given backend
    pub fn new(backend: Arc<dyn ContextBackend>) -> Self {
        Self {
            contexts: DashMap::new(),
            retired: DashSet::new(),
            backend,
            next_binding: AtomicU64::new(1),
        }
    }

    /// Registry creating in-memory state and timers
    pub fn in_memory(state_ttl: Option<Duration>) -> Self {
        Self::new(Arc::new(InMemoryContextBackend::new(state_ttl)))
    }

    /// Drop every context of a retired step. Later resolves for the step fail.
    pub fn retire_step(&self, step: &StepId) -> usize {
        self.retired.insert(step.clone());
        let before = self.contexts.len();
        self.contexts.retain(|(s, _), _| s != step);
        let removed = before.saturating_sub(self.contexts.len());
        debug!(step = %step, removed, "Retired step contexts");
        removed
    }

    /// Number of live bindings
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Number of live bindings for one step
    pub fn step_context_count(&self, step: &StepId) -> usize {
        self.contexts.iter().filter(|e| &e.key().0 == step).count()
    }
}

impl Default for KeyedContextRegistry {
    fn default() -> Self {
        Self::in_memory(None)
    }
}

impl ContextResolver for KeyedContextRegistry {
    fn resolve(&self, step: &StepId, key: &RoutingKey) -> ContextResult<PerKeyContext> {
        if self.retired.contains(step) {
            return Err(ContextError::StepRetired {
                step: step.to_string(),
            });
        }

        let entry = self
            .contexts
            .entry((step.clone(), key.clone()))
            .or_try_insert_with(|| {
                let (state, timers) = self.backend.create(step, key)?;
                let binding = BindingId(self.next_binding.fetch_add(1, Ordering::Relaxed));
                debug!(step = %step, key = %key, %binding, "Created per-key context");
                Ok::<_, ContextError>(PerKeyContext::new(
                    binding,
                    step.clone(),
                    key.clone(),
                    state,
                    timers,
                ))
            })?;

        trace!(step = %step, key = %key, binding = %entry.binding, "Resolved per-key context");
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateInternalsExt;

    struct FailingBackend;

    impl ContextBackend for FailingBackend {
        fn create(
            &self,
            step: &StepId,
            key: &RoutingKey,
        ) -> ContextResult<(Arc<dyn StateInternals>, Arc<dyn TimerInternals>)> {
            Err(ContextError::BindingFailed {
                step: step.to_string(),
                key: key.to_string(),
                reason: "store unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_resolve_is_stable() {
        let registry = KeyedContextRegistry::default();
        let step = StepId::from("read");
        let key = RoutingKey::from("user-1");

        let first = registry.resolve(&step, &key).unwrap();
        first.state_internals().write_value(b"offset", &7u64).await.unwrap();

        let second = registry.resolve(&step, &key).unwrap();
        assert!(first.same_binding(&second));
        assert_eq!(first.binding(), second.binding());
        let offset: Option<u64> = second.state_internals().read_value(b"offset").await.unwrap();
        assert_eq!(offset, Some(7));
        assert_eq!(registry.context_count(), 1);
    }

    #[test]
    fn test_distinct_keys_and_steps_get_distinct_bindings() {
        let registry = KeyedContextRegistry::default();
        let a = registry.resolve(&"read".into(), &"user-1".into()).unwrap();
        let b = registry.resolve(&"read".into(), &"user-2".into()).unwrap();
        let c = registry.resolve(&"write".into(), &"user-1".into()).unwrap();

        assert!(!a.same_binding(&b));
        assert!(!a.same_binding(&c));
        assert_eq!(registry.context_count(), 3);
        assert_eq!(registry.step_context_count(&"read".into()), 2);
    }

    #[test]
    fn test_backend_failure_creates_nothing() {
        let registry = KeyedContextRegistry::new(Arc::new(FailingBackend));
        let err = registry.resolve(&"read".into(), &"user-1".into()).unwrap_err();

        assert!(matches!(err, ContextError::BindingFailed { .. }));
        assert_eq!(registry.context_count(), 0);
    }

    #[test]
    fn test_retire_step() {
        let registry = KeyedContextRegistry::default();
        let step = StepId::from("read");
        registry.resolve(&step, &"user-1".into()).unwrap();
        registry.resolve(&step, &"user-2".into()).unwrap();
        registry.resolve(&"write".into(), &"user-1".into()).unwrap();

        assert_eq!(registry.retire_step(&step), 2);
        assert_eq!(registry.context_count(), 1);
        assert!(matches!(
            registry.resolve(&step, &"user-1".into()),
            Err(ContextError::StepRetired { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_creates_one_binding() {
        let registry = Arc::new(KeyedContextRegistry::default());
        let mut handles = vec![];

        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.resolve(&"read".into(), &"hot-key".into()).unwrap()
            }));
        }

        let mut contexts = vec![];
        for handle in handles {
            contexts.push(handle.await.unwrap());
        }

        assert_eq!(registry.context_count(), 1);
        assert!(contexts.windows(2).all(|w| w[0].same_binding(&w[1])));
    }
}
