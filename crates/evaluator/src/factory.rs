//! Evaluator factory
//!
//! [`SplittableEvaluatorFactory`] builds one [`SplittableEvaluator`] per
//! committed bundle. Construction binds three things to the bundle's key:
//! the per-key context, a function instance checked out of the step's pool
//! and an output router over the bundle's sink. If any of them cannot be
//! obtained nothing stays checked out.
//!
//! The factory is shared by every worker of the engine. Pools are created
//! lazily, one per applied step.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EvaluatorConfig;
use crate::context::{ContextResolver, KeyedContextRegistry};
use crate::core::{CommittedBundle, OutputTag, RoutingKey, StepId};
use crate::error::{EvaluatorError, LifecycleError, Result};
use crate::evaluator::{EvaluationCounters, EvaluationStats, SplittableEvaluator, TransformResult};
use crate::function::SplittableFn;
use crate::lifecycle::{FunctionLifecycleManager, PoolStats};
use crate::output::{OutputRouter, OutputSinkProvider};

/// A splittable step as applied in the pipeline graph
#[derive(Debug, Clone)]
pub struct AppliedSplittableStep<F> {
    step: StepId,
    function: F,
    main_output: OutputTag,
    side_outputs: Vec<OutputTag>,
}

impl<F: SplittableFn> AppliedSplittableStep<F> {
    pub fn new(step: impl Into<StepId>, function: F, main_output: impl Into<OutputTag>) -> Self {
        Self {
            step: step.into(),
            function,
            main_output: main_output.into(),
            side_outputs: Vec::new(),
        }
    }

    /// Declare an additional output
    pub fn with_side_output(mut self, tag: impl Into<OutputTag>) -> Self {
        self.side_outputs.push(tag.into());
        self
    }

    pub fn step(&self) -> &StepId {
        &self.step
    }

    /// The function template instances are cloned from
    pub fn function(&self) -> &F {
        &self.function
    }

    pub fn main_output(&self) -> &OutputTag {
        &self.main_output
    }

    pub fn side_outputs(&self) -> &[OutputTag] {
        &self.side_outputs
    }
}

/// Builds evaluators for bundles of a keyed splittable step
pub struct SplittableEvaluatorFactory<F: SplittableFn> {
    config: EvaluatorConfig,
    resolver: Arc<dyn ContextResolver>,
    sinks: Arc<dyn OutputSinkProvider<F::Output>>,
    pools: DashMap<StepId, FunctionLifecycleManager<F>>,
    counters: Arc<EvaluationCounters>,
    cleaned_up: AtomicBool,
}

impl<F: SplittableFn> SplittableEvaluatorFactory<F> {
    /// Create a factory. Fails if the configuration is invalid.
    pub fn new(
        config: EvaluatorConfig,
        resolver: Arc<dyn ContextResolver>,
        sinks: Arc<dyn OutputSinkProvider<F::Output>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resolver,
            sinks,
            pools: DashMap::new(),
            counters: Arc::new(EvaluationCounters::default()),
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Factory resolving contexts from an in-memory registry built from
    /// `config.state`
    pub fn in_memory(
        config: EvaluatorConfig,
        sinks: Arc<dyn OutputSinkProvider<F::Output>>,
    ) -> Result<Self> {
        let registry = KeyedContextRegistry::in_memory(config.state.ttl());
        Self::new(config, Arc::new(registry), sinks)
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Build the evaluator for `bundle` of `application`.
    ///
    /// Fails without side effects on the pool when the context cannot be
    /// resolved, the sink cannot serve a declared output, or no instance can
    /// be checked out.
    pub fn for_application(
        &self,
        application: &AppliedSplittableStep<F>,
        bundle: &CommittedBundle<F::Input, F::Restriction>,
    ) -> Result<SplittableEvaluator<F>> {
        let step = application.step();
        let key = bundle.key();

        let context = self.resolver.resolve(step, key)?;

        let sink = self.sinks.sink_for(step, key)?;
        let router = OutputRouter::new(
            step.clone(),
            application.main_output().clone(),
            application.side_outputs().iter().cloned(),
            sink,
        )?;

        let function = self.pool_for(application)?.acquire()?;

        debug!(
            step = %step,
            key = %key,
            bundle = %bundle.id(),
            items = bundle.len(),
            "Built evaluator for bundle"
        );
        Ok(SplittableEvaluator::new(
            context,
            function,
            router,
            Arc::clone(&self.counters),
        ))
    }

    /// Build an evaluator, feed it every item of `bundle` in order and
    /// finish it
    pub async fn evaluate_bundle(
        &self,
        application: &AppliedSplittableStep<F>,
        bundle: CommittedBundle<F::Input, F::Restriction>,
    ) -> Result<TransformResult<F::Input, F::Restriction>> {
        let mut evaluator = self.for_application(application, &bundle)?;
        for item in bundle.into_items() {
            evaluator.process_item(item).await?;
        }
        evaluator.finish().await
    }

    /// Evaluate many bundles, one task per routing key.
    ///
    /// Bundles of the same key run one after another in the given order;
    /// bundles of different keys run concurrently. Results are returned in
    /// input order.
    pub async fn evaluate_concurrently(
        self: Arc<Self>,
        application: &AppliedSplittableStep<F>,
        bundles: Vec<CommittedBundle<F::Input, F::Restriction>>,
    ) -> Vec<Result<TransformResult<F::Input, F::Restriction>>> {
        let total = bundles.len();
        let mut by_key: BTreeMap<RoutingKey, Vec<(usize, CommittedBundle<F::Input, F::Restriction>)>> =
            BTreeMap::new();
        for (index, bundle) in bundles.into_iter().enumerate() {
            by_key.entry(bundle.key().clone()).or_default().push((index, bundle));
        }

        debug!(step = %application.step(), bundles = total, keys = by_key.len(), "Evaluating bundles concurrently");

        let mut tasks: Vec<(RoutingKey, Vec<usize>, JoinHandle<Vec<(usize, _)>>)> = Vec::with_capacity(by_key.len());
        for (key, keyed) in by_key {
            let indices = keyed.iter().map(|(index, _)| *index).collect();
            let factory = Arc::clone(&self);
            let application = application.clone();
            let handle = tokio::spawn(async move {
                let mut results = Vec::with_capacity(keyed.len());
                for (index, bundle) in keyed {
                    results.push((index, factory.evaluate_bundle(&application, bundle).await));
                }
                results
            });
            tasks.push((key, indices, handle));
        }

        let mut slots: Vec<Option<Result<TransformResult<F::Input, F::Restriction>>>> =
            (0..total).map(|_| None).collect();
        for (key, indices, handle) in tasks {
            match handle.await {
                Ok(results) => {
                    for (index, result) in results {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => {
                    warn!(step = %application.step(), key = %key, error = %e, "Key task did not complete");
                    let reason = e.to_string();
                    for index in indices {
                        slots[index] = Some(Err(EvaluatorError::processing(
                            application.step().as_str(),
                            key.as_str(),
                            reason.clone(),
                        )));
                    }
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(EvaluatorError::processing(
                        application.step().as_str(),
                        "",
                        "bundle produced no result",
                    ))
                })
            })
            .collect()
    }

    /// Tear down every pooled instance of every step.
    ///
    /// Later calls to [`for_application`](Self::for_application) fail.
    /// Calling this more than once is harmless.
    pub fn cleanup(&self) {
        self.cleaned_up.store(true, Ordering::SeqCst);

        let mut torn_down = 0;
        for pool in self.pools.iter() {
            torn_down += pool.value().teardown_all();
        }
        info!(steps = self.pools.len(), torn_down, "Cleaned up evaluator factory");
    }

    /// Pool counters for one step, if it has been used
    pub fn pool_stats(&self, step: &StepId) -> Option<PoolStats> {
        self.pools.get(step).map(|pool| pool.stats())
    }

    pub fn stats(&self) -> EvaluationStats {
        self.counters.snapshot()
    }

    fn pool_for(&self, application: &AppliedSplittableStep<F>) -> Result<FunctionLifecycleManager<F>> {
        let retired = || -> EvaluatorError {
            LifecycleError::Retired {
                function: application.function().name().to_string(),
            }
            .into()
        };

        if self.cleaned_up.load(Ordering::SeqCst) {
            return Err(retired());
        }

        // The flag is checked again under the entry lock so a pool created
        // while cleanup runs is either seen by it or never created
        let pool = match self.pools.entry(application.step().clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if self.cleaned_up.load(Ordering::SeqCst) {
                    return Err(retired());
                }
                debug!(step = %application.step(), function = application.function().name(), "Created function pool");
                entry
                    .insert(FunctionLifecycleManager::new(
                        application.function().clone(),
                        self.config.pool.clone(),
                    ))
                    .clone()
            }
        };
        Ok(pool)
    }
}
