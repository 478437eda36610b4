//! Keyed evaluator for splittable processing steps
//!
//! This crate binds a splittable processing function to the routing key of a
//! committed bundle: per-key state and timers, a pooled function instance and
//! output routing to the bundle's sink. It makes sure function instances are
//! reused only after clean finishes and are torn down after failures.

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod evaluator;
pub mod factory;
pub mod function;
pub mod lifecycle;
pub mod output;
pub mod state;
pub mod timers;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use config::{EvaluatorConfig, PoolConfig, StateConfig};

pub use context::{
    BindingId, ContextBackend, ContextResolver, InMemoryContextBackend, KeyedContextRegistry,
    PerKeyContext,
};

pub use self::core::{CommittedBundle, KeyedWorkItem, OutputTag, RoutingKey, StepId};

pub use error::{
    ContextError, EvaluatorError, LifecycleError, Result as EvaluatorResult, RoutingError,
    StateError,
};

pub use evaluator::{
    EvaluationStats, EvaluatorPhase, Residual, SplittableEvaluator, TransformEvaluator,
    TransformResult,
};

pub use factory::{AppliedSplittableStep, SplittableEvaluatorFactory};

pub use function::{FnError, ProcessContext, ProcessContinuation, SplittableFn};

pub use lifecycle::{CheckedOutFn, FunctionLifecycleManager, InstanceId, PoolStats, ReleaseOutcome};

pub use output::{InMemoryOutputManager, OutputManager, OutputRouter, OutputSinkProvider};

pub use state::{InMemoryStateInternals, StateInternals, StateInternalsExt};

pub use timers::{InMemoryTimerInternals, TimeDomain, TimerData, TimerInternals, TimerUpdate};

pub use watermark::Watermark;

pub use window::{PaneInfo, PaneTiming, Window, WindowBounds, WindowedValue};
