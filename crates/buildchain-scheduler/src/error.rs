//! Orchestration errors.

use buildchain_core::{JobId, RequestKey};
use buildchain_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The job is not part of the job graph. Never retryable.
    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The backend refused the hand-off; the request is pending again.
    #[error("failed to dispatch {key}: {source}")]
    Dispatch {
        key: RequestKey,
        source: buildchain_core::Error,
    },
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
