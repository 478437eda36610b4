//! User processing function contract
//!
//! A [`SplittableFn`] processes one element against a restriction describing
//! the work left for it. It either finishes the restriction or hands back a
//! residual to be resumed later. The evaluator never interprets the residual.
//!
//! Functions are templates: the lifecycle pool clones the template, runs
//! [`SplittableFn::setup`] on the clone and lends it to exactly one
//! evaluation at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{OutputTag, RoutingKey, StepId};
use crate::error::{EvaluatorError, Result};
use crate::output::OutputRouter;
use crate::state::StateInternals;
use crate::timers::TimerInternals;
use crate::window::{PaneInfo, Window, WindowedValue};

/// Error type user functions return
pub type FnError = Box<dyn std::error::Error + Send + Sync>;

/// What the function reports after processing an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessContinuation<R> {
    /// The restriction is fully processed
    Stop,
    /// Part of the restriction is left; `residual` describes it
    Resume {
        residual: R,
        /// Suggested delay before the residual is processed
        delay: Option<Duration>,
    },
}

impl<R> ProcessContinuation<R> {
    /// Resume the residual as soon as possible
    pub fn resume(residual: R) -> Self {
        ProcessContinuation::Resume {
            residual,
            delay: None,
        }
    }

    /// Resume the residual after a delay
    pub fn resume_after(residual: R, delay: Duration) -> Self {
        ProcessContinuation::Resume {
            residual,
            delay: Some(delay),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, ProcessContinuation::Stop)
    }

    pub fn residual(&self) -> Option<&R> {
        match self {
            ProcessContinuation::Stop => None,
            ProcessContinuation::Resume { residual, .. } => Some(residual),
        }
    }
}

/// User-supplied splittable processing logic
///
/// Instances are mutable and never shared between concurrent evaluations.
/// An instance that returned an error is torn down and never reused.
#[async_trait]
pub trait SplittableFn: Clone + Send + Sync + 'static {
    type Input: Clone + Send + Sync + 'static;
    type Output: Send + Sync + 'static;
    type Restriction: Clone + Send + Sync + Debug + 'static;

    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Called once on a fresh clone before its first use
    fn setup(&mut self) -> std::result::Result<(), FnError> {
        Ok(())
    }

    /// Called once before the instance is dropped
    fn teardown(&mut self) {}

    /// Called before the first element of a bundle
    async fn start_bundle(
        &mut self,
        _ctx: &ProcessContext<Self::Output>,
    ) -> std::result::Result<(), FnError> {
        Ok(())
    }

    /// Process `element` against `restriction`
    async fn process_element(
        &mut self,
        ctx: &ProcessContext<Self::Output>,
        element: &WindowedValue<Self::Input>,
        restriction: Self::Restriction,
    ) -> std::result::Result<ProcessContinuation<Self::Restriction>, FnError>;

    /// Called after the last element of a bundle
    async fn finish_bundle(
        &mut self,
        _ctx: &ProcessContext<Self::Output>,
    ) -> std::result::Result<(), FnError> {
        Ok(())
    }
}

/// Facilities bound for one evaluation: per-key state, per-key timers and
/// output routing
///
/// Built once per evaluator and passed to every call of the function. State
/// and timer lookups only ever resolve to the evaluator's own key.
pub struct ProcessContext<O> {
    step: StepId,
    key: RoutingKey,
    state: Arc<dyn StateInternals>,
    timers: Arc<dyn TimerInternals>,
    router: Arc<OutputRouter<O>>,
}

impl<O> ProcessContext<O> {
    pub fn new(
        step: StepId,
        key: RoutingKey,
        state: Arc<dyn StateInternals>,
        timers: Arc<dyn TimerInternals>,
        router: Arc<OutputRouter<O>>,
    ) -> Self {
        Self {
            step,
            key,
            state,
            timers,
            router,
        }
    }

    pub fn step(&self) -> &StepId {
        &self.step
    }

    /// The key this evaluation is bound to
    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    /// State of the bound key
    pub fn state(&self) -> &dyn StateInternals {
        self.state.as_ref()
    }

    /// Timers of the bound key
    pub fn timers(&self) -> &dyn TimerInternals {
        self.timers.as_ref()
    }

    /// State lookup by key. Only the bound key resolves.
    pub fn state_for_key(&self, key: &RoutingKey) -> Result<Arc<dyn StateInternals>> {
        self.check_key(key)?;
        Ok(Arc::clone(&self.state))
    }

    /// Timer lookup by key. Only the bound key resolves.
    pub fn timers_for_key(&self, key: &RoutingKey) -> Result<Arc<dyn TimerInternals>> {
        self.check_key(key)?;
        Ok(Arc::clone(&self.timers))
    }

    /// Emit to the step's main output
    pub fn output(
        &self,
        value: O,
        timestamp: DateTime<Utc>,
        windows: Vec<Window>,
        pane: PaneInfo,
    ) -> Result<()> {
        let tag = self.router.main_tag().clone();
        self.output_to(&tag, value, timestamp, windows, pane)
    }

    /// Emit to a declared output
    pub fn output_to(
        &self,
        tag: &OutputTag,
        value: O,
        timestamp: DateTime<Utc>,
        windows: Vec<Window>,
        pane: PaneInfo,
    ) -> Result<()> {
        self.router.route(tag, value, timestamp, windows, pane)?;
        Ok(())
    }

    /// Emit an already windowed value to the main output
    pub fn output_windowed(&self, value: WindowedValue<O>) -> Result<()> {
        let WindowedValue {
            value,
            timestamp,
            windows,
            pane,
        } = value;
        self.output(value, timestamp, windows, pane)
    }

    fn check_key(&self, key: &RoutingKey) -> Result<()> {
        if key != &self.key {
            return Err(EvaluatorError::KeyMismatch {
                step: self.step.to_string(),
                bound: self.key.to_string(),
                actual: key.to_string(),
            });
        }
        Ok(())
    }
}
