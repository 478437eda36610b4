//! Configuration types for the evaluator
//!
//! This module provides configuration structures for the function instance
//! pool and the in-memory per-key state created by the default context
//! backend.

use crate::error::{EvaluatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main evaluator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Function instance pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-key state configuration
    #[serde(default)]
    pub state: StateConfig,
}

impl EvaluatorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.state.validate()?;
        Ok(())
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| EvaluatorError::Configuration {
            source: Box::new(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EvaluatorError::Configuration {
                source: format!("cannot read {}: {}", path.as_ref().display(), e).into(),
            }
        })?;
        Self::from_json_str(&raw)
    }
}

/// Function instance pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of idle instances kept for reuse; extra released
    /// instances are torn down
    #[serde(default = "default_max_idle_instances")]
    pub max_idle_instances: usize,

    /// Maximum number of instances checked out at once. `None` is unbounded.
    #[serde(default)]
    pub max_checked_out: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_instances: default_max_idle_instances(),
            max_checked_out: None,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_checked_out == Some(0) {
            return Err(EvaluatorError::Configuration {
                source: "pool max_checked_out must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Set the idle pool size
    pub fn with_max_idle(mut self, max_idle_instances: usize) -> Self {
        self.max_idle_instances = max_idle_instances;
        self
    }

    /// Bound the number of concurrently checked-out instances
    pub fn with_max_checked_out(mut self, max: usize) -> Self {
        self.max_checked_out = Some(max);
        self
    }
}

/// Per-key state configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// State TTL (time-to-live) in milliseconds
    pub ttl_ms: Option<u64>,
}

impl StateConfig {
    /// Validate state configuration
    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms == Some(0) {
            return Err(EvaluatorError::Configuration {
                source: "state ttl_ms must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Get TTL as Duration
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

fn default_max_idle_instances() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EvaluatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_idle_instances, num_cpus::get());
        assert_eq!(config.pool.max_checked_out, None);
        assert_eq!(config.state.ttl(), None);
    }

    #[test]
    fn test_pool_config_validation() {
        let config = PoolConfig::default().with_max_checked_out(0);
        assert!(config.validate().is_err());

        let config = PoolConfig::default().with_max_checked_out(2).with_max_idle(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_state_config_validation() {
        let config = StateConfig { ttl_ms: Some(0) };
        assert!(config.validate().is_err());

        let config = StateConfig { ttl_ms: Some(1500) };
        assert_eq!(config.ttl(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = EvaluatorConfig::from_json_str(r#"{"pool": {"max_checked_out": 8}}"#).unwrap();
        assert_eq!(config.pool.max_checked_out, Some(8));
        assert_eq!(config.pool.max_idle_instances, default_max_idle_instances());
        assert_eq!(config.state, StateConfig::default());
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = EvaluatorConfig::from_json_str(r#"{"state": {"ttl_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, EvaluatorError::Configuration { .. }));

        let err = EvaluatorConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, EvaluatorError::Configuration { .. }));
    }

    #[test]
    fn test_from_missing_file() {
        let err = EvaluatorConfig::from_file("/nonexistent/evaluator.json").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
