//! Keyed splittable evaluator
//!
//! A [`SplittableEvaluator`] runs one bundle of work items for one
//! (step, key) pair. It holds a checked-out function instance, the per-key
//! context and the output router for the whole bundle.
//!
//! Phases:
//! - `Bound`: built by the factory, nothing has run yet
//! - `Running`: the bundle has started and elements are being processed
//! - `Completed`: the bundle finished and the instance went back to the pool
//! - `Failed`: something failed and the instance was torn down
//!
//! Each evaluator releases its instance exactly once. A failure at any point
//! releases it as a failure; a clean finish releases it as a success. An
//! evaluator dropped before finishing, or a call cancelled while the function
//! was running, also counts as a failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::context::{BindingId, PerKeyContext};
use crate::core::{KeyedWorkItem, OutputTag, RoutingKey, StepId};
use crate::error::{EvaluatorError, Result};
use crate::function::{FnError, ProcessContext, ProcessContinuation, SplittableFn};
use crate::lifecycle::{CheckedOutFn, InstanceId, ReleaseOutcome};
use crate::output::OutputRouter;
use crate::timers::{TimerInternals, TimerUpdate};

/// Evaluator lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorPhase {
    Bound,
    Running,
    Completed,
    Failed,
}

impl EvaluatorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluatorPhase::Completed | EvaluatorPhase::Failed)
    }
}

impl fmt::Display for EvaluatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            EvaluatorPhase::Bound => "bound",
            EvaluatorPhase::Running => "running",
            EvaluatorPhase::Completed => "completed",
            EvaluatorPhase::Failed => "failed",
        };
        f.write_str(phase)
    }
}

/// Unfinished work handed back by the function
#[derive(Debug, Clone, PartialEq)]
pub struct Residual<I, R> {
    /// The input element paired with the residual restriction
    pub item: KeyedWorkItem<I, R>,
    /// Delay the function asked for before resuming
    pub resume_delay: Option<Duration>,
}

/// Everything a finished bundle reports to the engine
#[derive(Debug)]
pub struct TransformResult<I, R> {
    pub step: StepId,
    pub key: RoutingKey,
    pub binding: BindingId,
    pub instance: InstanceId,
    pub elements_processed: usize,
    /// Values routed per declared output tag
    pub output_counts: BTreeMap<OutputTag, u64>,
    /// Residual restrictions to be scheduled again, in processing order
    pub residuals: Vec<Residual<I, R>>,
    /// Timers set and deleted during the bundle
    pub timer_update: TimerUpdate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<I, R> TransformResult<I, R> {
    /// Total values routed across every tag
    pub fn total_outputs(&self) -> u64 {
        self.output_counts.values().sum()
    }

    pub fn has_residuals(&self) -> bool {
        !self.residuals.is_empty()
    }
}

/// Counters shared by every evaluator a factory builds
#[derive(Debug, Default)]
pub struct EvaluationCounters {
    evaluators_created: AtomicU64,
    elements_processed: AtomicU64,
    residuals_produced: AtomicU64,
    bundles_completed: AtomicU64,
    bundles_failed: AtomicU64,
}

impl EvaluationCounters {
    pub fn snapshot(&self) -> EvaluationStats {
        EvaluationStats {
            evaluators_created: self.evaluators_created.load(Ordering::Relaxed),
            elements_processed: self.elements_processed.load(Ordering::Relaxed),
            residuals_produced: self.residuals_produced.load(Ordering::Relaxed),
            bundles_completed: self.bundles_completed.load(Ordering::Relaxed),
            bundles_failed: self.bundles_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`EvaluationCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    pub evaluators_created: u64,
    pub elements_processed: u64,
    pub residuals_produced: u64,
    pub bundles_completed: u64,
    pub bundles_failed: u64,
}

/// Engine-facing evaluator contract
#[async_trait]
pub trait TransformEvaluator<I, R>: Send {
    /// Process one work item of the bundle
    async fn process_element(&mut self, item: KeyedWorkItem<I, R>) -> Result<()>;

    /// Finish the bundle and report its result
    async fn finish_bundle(self: Box<Self>) -> Result<TransformResult<I, R>>;
}

/// Evaluator for one bundle of a keyed splittable step
pub struct SplittableEvaluator<F: SplittableFn> {
    step: StepId,
    key: RoutingKey,
    binding: BindingId,
    phase: EvaluatorPhase,
    instance: InstanceId,
    function: Option<CheckedOutFn<F>>,
    ctx: ProcessContext<F::Output>,
    router: Arc<OutputRouter<F::Output>>,
    timers: Arc<dyn TimerInternals>,
    residuals: Vec<Residual<F::Input, F::Restriction>>,
    elements_processed: usize,
    bundle_started: bool,
    in_call: bool,
    started_at: DateTime<Utc>,
    counters: Arc<EvaluationCounters>,
}

impl<F: SplittableFn> SplittableEvaluator<F> {
    pub(crate) fn new(
        context: PerKeyContext,
        function: CheckedOutFn<F>,
        router: OutputRouter<F::Output>,
        counters: Arc<EvaluationCounters>,
    ) -> Self {
        let step = context.step().clone();
        let key = context.key().clone();
        let timers = context.timer_internals();
        let router = Arc::new(router);
        let ctx = ProcessContext::new(
            step.clone(),
            key.clone(),
            context.state_internals(),
            Arc::clone(&timers),
            Arc::clone(&router),
        );

        counters.evaluators_created.fetch_add(1, Ordering::Relaxed);
        debug!(step = %step, key = %key, instance = %function.id(), "Bound evaluator");

        Self {
            step,
            key,
            binding: context.binding(),
            phase: EvaluatorPhase::Bound,
            instance: function.id(),
            function: Some(function),
            ctx,
            router,
            timers,
            residuals: Vec::new(),
            elements_processed: 0,
            bundle_started: false,
            in_call: false,
            started_at: Utc::now(),
            counters,
        }
    }

    pub fn step(&self) -> &StepId {
        &self.step
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn phase(&self) -> EvaluatorPhase {
        self.phase
    }

    /// Function instance this evaluator holds
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn elements_processed(&self) -> usize {
        self.elements_processed
    }

    /// Process one item and return what the function reported for it.
    ///
    /// A residual is also recorded for the bundle's result.
    pub async fn process_item(
        &mut self,
        item: KeyedWorkItem<F::Input, F::Restriction>,
    ) -> Result<ProcessContinuation<F::Restriction>> {
        self.ensure_usable("process element")?;

        if item.key != self.key {
            let err = EvaluatorError::KeyMismatch {
                step: self.step.to_string(),
                bound: self.key.to_string(),
                actual: item.key.to_string(),
            };
            return Err(self.fail(err));
        }

        self.ensure_started().await?;

        let KeyedWorkItem {
            key,
            element,
            restriction,
        } = item;
        trace!(step = %self.step, key = %key, ?restriction, "Processing element");

        let Some(function) = self.function.as_mut() else {
            return Err(self.invalid_phase("process element"));
        };
        self.in_call = true;
        let outcome = function.process_element(&self.ctx, &element, restriction).await;
        self.in_call = false;

        let continuation = self.settle(outcome)?;

        self.elements_processed += 1;
        self.counters.elements_processed.fetch_add(1, Ordering::Relaxed);

        if let ProcessContinuation::Resume { residual, delay } = &continuation {
            trace!(step = %self.step, key = %key, ?residual, "Element left a residual");
            self.residuals.push(Residual {
                item: KeyedWorkItem {
                    key,
                    element,
                    restriction: residual.clone(),
                },
                resume_delay: *delay,
            });
            self.counters.residuals_produced.fetch_add(1, Ordering::Relaxed);
        }

        Ok(continuation)
    }

    /// Finish the bundle, return the instance to its pool and report the
    /// result
    pub async fn finish(mut self) -> Result<TransformResult<F::Input, F::Restriction>> {
        self.ensure_usable("finish bundle")?;
        self.ensure_started().await?;

        let Some(function) = self.function.as_mut() else {
            return Err(self.invalid_phase("finish bundle"));
        };
        self.in_call = true;
        let outcome = function.finish_bundle(&self.ctx).await;
        self.in_call = false;

        self.settle(outcome)?;

        if let Some(function) = self.function.take() {
            function.release(ReleaseOutcome::Success);
        }
        self.phase = EvaluatorPhase::Completed;
        self.counters.bundles_completed.fetch_add(1, Ordering::Relaxed);

        let result = TransformResult {
            step: self.step.clone(),
            key: self.key.clone(),
            binding: self.binding,
            instance: self.instance,
            elements_processed: self.elements_processed,
            output_counts: self.router.output_counts(),
            residuals: std::mem::take(&mut self.residuals),
            timer_update: self.timers.take_update(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        debug!(
            step = %result.step,
            key = %result.key,
            elements = result.elements_processed,
            outputs = result.total_outputs(),
            residuals = result.residuals.len(),
            "Finished bundle"
        );
        Ok(result)
    }

    async fn ensure_started(&mut self) -> Result<()> {
        if self.bundle_started {
            return Ok(());
        }

        let Some(function) = self.function.as_mut() else {
            return Err(self.invalid_phase("start bundle"));
        };
        self.phase = EvaluatorPhase::Running;
        self.in_call = true;
        let outcome = function.start_bundle(&self.ctx).await;
        self.in_call = false;

        self.settle(outcome)?;
        self.bundle_started = true;
        Ok(())
    }

    /// Turn a function call's outcome into the evaluator's result. A routing
    /// failure the function ignored still fails the evaluation.
    fn settle<T>(&mut self, outcome: std::result::Result<T, FnError>) -> Result<T> {
        let ignored = self.router.take_failure();
        match (outcome, ignored) {
            (Err(e), _) => {
                let err = self.user_error(e);
                Err(self.fail(err))
            }
            (Ok(_), Some(routing)) => Err(self.fail(routing.into())),
            (Ok(value), None) => Ok(value),
        }
    }

    fn ensure_usable(&mut self, operation: &str) -> Result<()> {
        if self.in_call {
            // A previous call was dropped while the function was mid-flight
            self.in_call = false;
            let err = EvaluatorError::Abandoned {
                step: self.step.to_string(),
                key: self.key.to_string(),
            };
            return Err(self.fail(err));
        }

        if self.phase.is_terminal() {
            return Err(self.invalid_phase(operation));
        }
        Ok(())
    }

    fn invalid_phase(&self, operation: &str) -> EvaluatorError {
        EvaluatorError::InvalidPhase {
            step: self.step.to_string(),
            phase: self.phase.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Errors raised by the evaluator's own facilities keep their kind
    fn user_error(&self, err: FnError) -> EvaluatorError {
        match err.downcast::<EvaluatorError>() {
            Ok(inner) => *inner,
            Err(err) => EvaluatorError::processing(self.step.as_str(), self.key.as_str(), err),
        }
    }

    fn fail(&mut self, err: EvaluatorError) -> EvaluatorError {
        if let Some(function) = self.function.take() {
            function.release(ReleaseOutcome::Failure);
        }
        if self.phase != EvaluatorPhase::Failed {
            self.phase = EvaluatorPhase::Failed;
            self.counters.bundles_failed.fetch_add(1, Ordering::Relaxed);
        }
        // Timer changes of a failed attempt are never reported
        let dropped = self.timers.take_update();
        if !dropped.is_empty() {
            debug!(
                step = %self.step,
                key = %self.key,
                set = dropped.set.len(),
                deleted = dropped.deleted.len(),
                "Dropped timer update of failed evaluation"
            );
        }
        warn!(step = %self.step, key = %self.key, error = %err, "Evaluation failed");
        err
    }
}

#[async_trait]
impl<F: SplittableFn> TransformEvaluator<F::Input, F::Restriction> for SplittableEvaluator<F> {
    async fn process_element(&mut self, item: KeyedWorkItem<F::Input, F::Restriction>) -> Result<()> {
        self.process_item(item).await.map(|_| ())
    }

    async fn finish_bundle(self: Box<Self>) -> Result<TransformResult<F::Input, F::Restriction>> {
        (*self).finish().await
    }
}

impl<F: SplittableFn> fmt::Debug for SplittableEvaluator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplittableEvaluator")
            .field("step", &self.step)
            .field("key", &self.key)
            .field("phase", &self.phase)
            .field("instance", &self.instance)
            .field("elements_processed", &self.elements_processed)
            .finish()
    }
}
