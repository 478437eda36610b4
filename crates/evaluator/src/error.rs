//! Error types for the keyed evaluator
//!
//! Errors are grouped by the component that raises them: the function
//! lifecycle pool, the per-key context resolver, the output router and the
//! in-memory state store. [`EvaluatorError`] wraps all of them and adds the
//! construction and processing failures surfaced to the engine.

use thiserror::Error;

/// Main evaluator error type
#[derive(Error, Debug)]
pub enum EvaluatorError {
    /// Function instance pool errors
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Per-key context resolution errors
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// Output routing errors
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// State store errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The user function failed while processing an element
    #[error("processing failed in step '{step}' for key '{key}': {source}")]
    Processing {
        step: String,
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A work item was routed to an evaluator bound to another key
    #[error("key mismatch in step '{step}': evaluator bound to '{bound}', item keyed '{actual}'")]
    KeyMismatch {
        step: String,
        bound: String,
        actual: String,
    },

    /// An earlier call was abandoned while the function was running
    #[error("evaluation of step '{step}' for key '{key}' was abandoned mid-call")]
    Abandoned { step: String, key: String },

    /// The evaluator was used after it completed or failed
    #[error("evaluator for step '{step}' is {phase}, cannot {operation}")]
    InvalidPhase {
        step: String,
        phase: String,
        operation: String,
    },

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EvaluatorError {
    /// Wrap a user function error
    pub fn processing<E>(step: impl Into<String>, key: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        EvaluatorError::Processing {
            step: step.into(),
            key: key.into(),
            source: source.into(),
        }
    }

    /// Whether this error happened while assembling an evaluator rather than
    /// while running one
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            EvaluatorError::Context(_)
                | EvaluatorError::Configuration { .. }
                | EvaluatorError::Lifecycle(LifecycleError::SetupFailed { .. })
                | EvaluatorError::Lifecycle(LifecycleError::Retired { .. })
                | EvaluatorError::Lifecycle(LifecycleError::Exhausted { .. })
                | EvaluatorError::Routing(RoutingError::UnsupportedDestination { .. })
        )
    }
}

/// Function instance pool errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Creating a fresh instance from the template failed
    #[error("setup of '{function}' failed: {reason}")]
    SetupFailed { function: String, reason: String },

    /// The pool was torn down and no longer hands out instances
    #[error("function pool for '{function}' has been retired")]
    Retired { function: String },

    /// Every permitted instance is already checked out
    #[error("function pool for '{function}' exhausted: {checked_out} of {max} instances checked out")]
    Exhausted {
        function: String,
        checked_out: usize,
        max: usize,
    },
}

/// Per-key context resolution errors
#[derive(Error, Debug)]
pub enum ContextError {
    /// The backing store could not create a binding
    #[error("failed to bind context for step '{step}', key '{key}': {reason}")]
    BindingFailed {
        step: String,
        key: String,
        reason: String,
    },

    /// The step has been retired
    #[error("step '{step}' has been retired")]
    StepRetired { step: String },
}

/// Output routing errors
#[derive(Error, Debug, Clone)]
pub enum RoutingError {
    /// A value was emitted to a tag the step never declared
    #[error("undeclared output tag '{tag}' in step '{step}'")]
    UndeclaredTag { step: String, tag: String },

    /// The sink does not accept a declared tag
    #[error("output sink has no destination for tag '{tag}' in step '{step}'")]
    UnsupportedDestination { step: String, tag: String },

    /// The sink rejected a value
    #[error("output sink rejected value for tag '{tag}': {reason}")]
    SinkRejected { tag: String, reason: String },
}

/// State store operation errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// State backend storage error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },
}

/// Result type alias for evaluator operations
pub type Result<T> = std::result::Result<T, EvaluatorError>;

/// Result type alias for lifecycle operations
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Result type alias for context operations
pub type ContextResult<T> = std::result::Result<T, ContextError>;

/// Result type alias for routing operations
pub type RoutingResult<T> = std::result::Result<T, RoutingError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_display() {
        let err = LifecycleError::Exhausted {
            function: "reader".to_string(),
            checked_out: 4,
            max: 4,
        };
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::UndeclaredTag {
            step: "read".to_string(),
            tag: "errors".to_string(),
        };
        assert!(err.to_string().contains("undeclared output tag 'errors'"));
    }

    #[test]
    fn test_processing_error_keeps_source() {
        let err = EvaluatorError::processing("read", "user-1", "boom");
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("user-1"));
        assert!(!err.is_construction_failure());
    }

    #[test]
    fn test_construction_failure_classification() {
        let err: EvaluatorError = ContextError::StepRetired {
            step: "read".to_string(),
        }
        .into();
        assert!(err.is_construction_failure());

        let err: EvaluatorError = RoutingError::SinkRejected {
            tag: "main".to_string(),
            reason: "closed".to_string(),
        }
        .into();
        assert!(!err.is_construction_failure());
    }

    #[test]
    fn test_evaluator_error_from_state_error() {
        let state_err = StateError::StorageError {
            backend_type: "memory".to_string(),
            details: "full".to_string(),
        };
        let err: EvaluatorError = state_err.into();
        assert!(matches!(err, EvaluatorError::State(_)));
    }
}
