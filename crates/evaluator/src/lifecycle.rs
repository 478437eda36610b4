//! Function instance lifecycle
//!
//! A [`FunctionLifecycleManager`] owns every instance created from one
//! function template. Instances are handed out through [`CheckedOutFn`]
//! guards; at most one evaluation holds a given instance at a time.
//!
//! Returning an instance with [`ReleaseOutcome::Success`] parks it in the idle
//! pool for reuse. [`ReleaseOutcome::Failure`] tears it down. A guard that is
//! dropped without an explicit release counts as a failure, so an evaluation
//! that is cancelled or panics never puts a half-used instance back.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::function::SplittableFn;

/// Identity of one function instance, unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// How an evaluation ended for the instance it used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The instance finished cleanly and may be reused
    Success,
    /// The instance may be in an unknown state and must be torn down
    Failure,
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances created and set up from the template
    pub created: u64,
    /// Acquisitions served from the idle pool
    pub reused: u64,
    /// Instances torn down after a failed evaluation
    pub discarded: u64,
    /// Healthy instances torn down because the pool was full or retired
    pub evicted: u64,
    /// Instances currently idle
    pub idle: usize,
    /// Instances currently checked out
    pub checked_out: usize,
}

struct PooledFn<F> {
    id: InstanceId,
    instance: F,
}

struct PoolState<F> {
    idle: Vec<PooledFn<F>>,
    checked_out: usize,
    retired: bool,
}

struct PoolShared<F: SplittableFn> {
    name: String,
    template: F,
    config: PoolConfig,
    state: Mutex<PoolState<F>>,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
}

impl<F: SplittableFn> PoolShared<F> {
    fn give_back(&self, id: InstanceId, mut instance: F, outcome: ReleaseOutcome) {
        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);

        if outcome == ReleaseOutcome::Success
            && !state.retired
            && state.idle.len() < self.config.max_idle_instances
        {
            state.idle.push(PooledFn { id, instance });
            trace!(function = %self.name, %id, idle = state.idle.len(), "Instance returned to pool");
            return;
        }

        let retired = state.retired;
        drop(state);

        instance.teardown();
        match outcome {
            ReleaseOutcome::Failure => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(function = %self.name, %id, "Discarded instance after failed evaluation");
            }
            ReleaseOutcome::Success => {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(function = %self.name, %id, retired, "Evicted healthy instance");
            }
        }
    }
}

impl<F: SplittableFn> Drop for PoolShared<F> {
    fn drop(&mut self) {
        let idle = std::mem::take(&mut self.state.get_mut().idle);
        for mut pooled in idle {
            pooled.instance.teardown();
        }
    }
}

/// Checkout slot taken for an instance that is still being set up.
/// Dropping it while held gives the slot back, including when setup panics.
struct ReservedSlot<'a, F: SplittableFn> {
    pool: &'a PoolShared<F>,
    held: bool,
}

impl<F: SplittableFn> Drop for ReservedSlot<'_, F> {
    fn drop(&mut self) {
        if self.held {
            self.pool.state.lock().checked_out -= 1;
        }
    }
}

/// Pool of reusable instances of one function template
pub struct FunctionLifecycleManager<F: SplittableFn> {
    shared: Arc<PoolShared<F>>,
}

impl<F: SplittableFn> Clone for FunctionLifecycleManager<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SplittableFn> FunctionLifecycleManager<F> {
    /// Create a manager for `template`. Nothing is instantiated until the
    /// first [`acquire`](Self::acquire).
    pub fn new(template: F, config: PoolConfig) -> Self {
        let name = template.name().to_string();
        Self {
            shared: Arc::new(PoolShared {
                name,
                template,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    checked_out: 0,
                    retired: false,
                }),
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Name of the managed function
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Check out an instance, reusing an idle one when available.
    ///
    /// A fresh instance is cloned from the template and set up outside the
    /// pool lock. If setup fails nothing stays checked out.
    pub fn acquire(&self) -> LifecycleResult<CheckedOutFn<F>> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if state.retired {
            return Err(LifecycleError::Retired {
                function: shared.name.clone(),
            });
        }

        if let Some(max) = shared.config.max_checked_out {
            if state.checked_out >= max {
                return Err(LifecycleError::Exhausted {
                    function: shared.name.clone(),
                    checked_out: state.checked_out,
                    max,
                });
            }
        }

        state.checked_out += 1;
        let pooled = state.idle.pop();
        drop(state);

        if let Some(PooledFn { id, instance }) = pooled {
            shared.reused.fetch_add(1, Ordering::Relaxed);
            trace!(function = %shared.name, %id, "Reusing pooled instance");
            return Ok(CheckedOutFn::new(id, instance, Arc::clone(shared)));
        }

        let mut slot = ReservedSlot {
            pool: &**shared,
            held: true,
        };
        let id = InstanceId(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut instance = shared.template.clone();
        if let Err(e) = instance.setup() {
            warn!(function = %shared.name, %id, error = %e, "Function setup failed");
            return Err(LifecycleError::SetupFailed {
                function: shared.name.clone(),
                reason: e.to_string(),
            });
        }
        slot.held = false;

        shared.created.fetch_add(1, Ordering::Relaxed);
        debug!(function = %shared.name, %id, "Created function instance");
        Ok(CheckedOutFn::new(id, instance, Arc::clone(shared)))
    }

    /// Return an instance to the pool
    pub fn release(&self, checked_out: CheckedOutFn<F>, outcome: ReleaseOutcome) {
        checked_out.release(outcome);
    }

    /// Tear down every idle instance and retire the pool.
    ///
    /// Later acquisitions fail with [`LifecycleError::Retired`]; instances
    /// still checked out are torn down when they come back. Calling this more
    /// than once is harmless.
    pub fn teardown_all(&self) -> usize {
        let idle = {
            let mut state = self.shared.state.lock();
            state.retired = true;
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        for mut pooled in idle {
            pooled.instance.teardown();
            trace!(function = %self.shared.name, id = %pooled.id, "Tore down idle instance");
        }

        if count > 0 {
            debug!(function = %self.shared.name, count, "Tore down function pool");
        }
        count
    }

    pub fn is_retired(&self) -> bool {
        self.shared.state.lock().retired
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, checked_out) = {
            let state = self.shared.state.lock();
            (state.idle.len(), state.checked_out)
        };

        PoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
            idle,
            checked_out,
        }
    }
}

/// Exclusive handle to a checked-out function instance
///
/// Dereferences to the instance. Dropping the handle without calling
/// [`release`](Self::release) returns the instance as a failure.
pub struct CheckedOutFn<F: SplittableFn> {
    id: InstanceId,
    instance: Option<F>,
    pool: Arc<PoolShared<F>>,
}

impl<F: SplittableFn> CheckedOutFn<F> {
    fn new(id: InstanceId, instance: F, pool: Arc<PoolShared<F>>) -> Self {
        Self {
            id,
            instance: Some(instance),
            pool,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Hand the instance back to its pool
    pub fn release(mut self, outcome: ReleaseOutcome) {
        if let Some(instance) = self.instance.take() {
            self.pool.give_back(self.id, instance, outcome);
        }
    }
}

impl<F: SplittableFn> Deref for CheckedOutFn<F> {
    type Target = F;

    fn deref(&self) -> &F {
        // Only `release` and `drop` take the instance, and both consume the guard.
        match self.instance.as_ref() {
            Some(instance) => instance,
            None => unreachable!("checked-out instance already released"),
        }
    }
}

impl<F: SplittableFn> DerefMut for CheckedOutFn<F> {
    fn deref_mut(&mut self) -> &mut F {
        match self.instance.as_mut() {
            Some(instance) => instance,
            None => unreachable!("checked-out instance already released"),
        }
    }
}

impl<F: SplittableFn> Drop for CheckedOutFn<F> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            warn!(function = %self.pool.name, id = %self.id, "Instance dropped without release, discarding");
            self.pool.give_back(self.id, instance, ReleaseOutcome::Failure);
        }
    }
}

impl<F: SplittableFn> fmt::Debug for CheckedOutFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedOutFn")
            .field("function", &self.pool.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::function::{FnError, ProcessContext, ProcessContinuation};
    use crate::window::WindowedValue;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Counts setup and teardown calls across every clone
    #[derive(Clone, Default)]
    pub(crate) struct CountingFn {
        pub setups: Arc<AtomicUsize>,
        pub teardowns: Arc<AtomicUsize>,
        pub fail_setup: bool,
        pub panic_setup: bool,
    }

    #[async_trait]
    impl SplittableFn for CountingFn {
        type Input = u32;
        type Output = u32;
        type Restriction = u32;

        fn name(&self) -> &str {
            "counting"
        }

        fn setup(&mut self) -> std::result::Result<(), FnError> {
            if self.fail_setup {
                return Err("no connection".into());
            }
            if self.panic_setup {
                panic!("setup blew up");
            }
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }

        async fn process_element(
            &mut self,
            _ctx: &ProcessContext<u32>,
            _element: &WindowedValue<u32>,
            _restriction: u32,
        ) -> std::result::Result<ProcessContinuation<u32>, FnError> {
            Ok(ProcessContinuation::Stop)
        }
    }

    fn manager(config: PoolConfig) -> (FunctionLifecycleManager<CountingFn>, CountingFn) {
        let template = CountingFn::default();
        (FunctionLifecycleManager::new(template.clone(), config), template)
    }

    #[test]
    fn test_success_release_is_reused() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(4));

        let first = manager.acquire().unwrap();
        let id = first.id();
        first.release(ReleaseOutcome::Success);

        let second = manager.acquire().unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(template.setups.load(Ordering::SeqCst), 1);

        let stats = manager.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.checked_out, 1);
    }

    #[test]
    fn test_failure_release_tears_down() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(4));

        let first = manager.acquire().unwrap();
        let id = first.id();
        manager.release(first, ReleaseOutcome::Failure);
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 1);

        let second = manager.acquire().unwrap();
        assert_ne!(second.id(), id);
        assert_eq!(template.setups.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().discarded, 1);
    }

    #[test]
    fn test_dropped_guard_counts_as_failure() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(4));

        let guard = manager.acquire().unwrap();
        drop(guard);

        let stats = manager.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_checkouts_get_distinct_instances() {
        let (manager, _) = manager(PoolConfig::default().with_max_idle(4));

        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.stats().checked_out, 2);

        a.release(ReleaseOutcome::Success);
        b.release(ReleaseOutcome::Success);
        assert_eq!(manager.stats().idle, 2);
    }

    #[test]
    fn test_setup_failure_leaves_nothing_checked_out() {
        let template = CountingFn {
            fail_setup: true,
            ..Default::default()
        };
        let manager = FunctionLifecycleManager::new(template, PoolConfig::default().with_max_idle(4));

        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, LifecycleError::SetupFailed { .. }));
        assert!(err.to_string().contains("no connection"));

        let stats = manager.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.created, 0);
    }

    #[test]
    fn test_setup_panic_gives_back_checkout_slot() {
        let template = CountingFn {
            panic_setup: true,
            ..Default::default()
        };
        let manager = FunctionLifecycleManager::new(
            template,
            PoolConfig::default().with_max_idle(4).with_max_checked_out(1),
        );

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.acquire()));
        assert!(outcome.is_err());

        let stats = manager.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.created, 0);
    }

    #[test]
    fn test_idle_pool_is_bounded() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(1));

        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        a.release(ReleaseOutcome::Success);
        b.release(ReleaseOutcome::Success);

        let stats = manager.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.evicted, 1);
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checkout_limit() {
        let (manager, _) = manager(PoolConfig::default().with_max_checked_out(1));

        let held = manager.acquire().unwrap();
        let err = manager.acquire().unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Exhausted {
                checked_out: 1,
                max: 1,
                ..
            }
        ));

        held.release(ReleaseOutcome::Success);
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn test_teardown_all_is_idempotent() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(4));

        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        let late = manager.acquire().unwrap();
        a.release(ReleaseOutcome::Success);
        b.release(ReleaseOutcome::Success);

        assert_eq!(manager.teardown_all(), 2);
        assert_eq!(manager.teardown_all(), 0);
        assert!(manager.is_retired());
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 2);

        assert!(matches!(
            manager.acquire(),
            Err(LifecycleError::Retired { .. })
        ));

        // Instances outstanding at retirement are torn down on return
        late.release(ReleaseOutcome::Success);
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().idle, 0);
    }

    #[test]
    fn test_dropping_manager_tears_down_idle() {
        let (manager, template) = manager(PoolConfig::default().with_max_idle(4));
        manager.acquire().unwrap().release(ReleaseOutcome::Success);

        drop(manager);
        assert_eq!(template.teardowns.load(Ordering::SeqCst), 1);
    }
}
