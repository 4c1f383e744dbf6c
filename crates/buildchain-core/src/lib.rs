//! Core domain types and traits for the buildchain orchestrator.
//!
//! This crate contains:
//! - Job, revision and request identifiers
//! - The dependency graph and the validated job graph
//! - Build request records and their lifecycle states
//! - The dispatcher trait implemented by execution backends

pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod id;
pub mod job;
pub mod request;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use graph::{DependencyGraph, GraphError, NodeId};
pub use id::{JobId, RequestId, RequestKey, SourceRevision};
pub use job::{JobGraph, JobSpec};
pub use request::{BuildRequest, RequestOrigin, RequestState};
