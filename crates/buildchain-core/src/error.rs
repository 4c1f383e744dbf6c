//! Error types for buildchain.

use thiserror::Error;

use crate::JobId;
use crate::graph::GraphError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("job '{0}' is defined more than once")]
    DuplicateJob(JobId),

    #[error("dependency cycle through job '{0}'")]
    DependencyCycle(JobId),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: JobId, dependency: JobId },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
