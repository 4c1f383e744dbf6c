//! Store error types.

use buildchain_core::{RequestKey, RequestState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The record is terminal and can no longer change.
    #[error("build request {key} is already {state}")]
    StaleUpdate { key: RequestKey, state: RequestState },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Contention outcomes callers treat as "someone else got there first".
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleUpdate { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
