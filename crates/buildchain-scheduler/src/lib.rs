//! Dependency-aware build orchestration.
//!
//! The [`OrchestrationEngine`] decides when each job of a revision may run:
//! - requests are recorded before any dependency is looked at
//! - a job is dispatched once all of its dependencies succeeded
//! - a failed or cancelled dependency cancels everything waiting on it

pub mod error;
pub mod events;
pub mod locks;
pub mod orchestrator;

pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use locks::RequestLocks;
pub use orchestrator::OrchestrationEngine;
