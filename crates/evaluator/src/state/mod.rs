//! Per-key state
//!
//! [`StateInternals`] is the lookup contract the evaluator binds to each
//! (step, key) pair. [`InMemoryStateInternals`] is the implementation used by
//! the default context backend.

pub mod backend;
pub mod memory;

pub use backend::{namespaced_key, StateInternals, StateInternalsExt};
pub use memory::{InMemoryStateInternals, MemoryStateStats};
