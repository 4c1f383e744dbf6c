//! Durable storage for build requests.
//!
//! The pending set and the completion ledger are one logical keyed store from
//! the engine's point of view: one record per (job, revision). Two
//! implementations are provided, an in-memory store for tests and local runs
//! and a PostgreSQL store for anything that has to survive a restart.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryRequestStore;
pub use postgres::PgRequestStore;

use async_trait::async_trait;
use buildchain_core::{BuildRequest, JobId, RequestKey, RequestState, SourceRevision};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeSet;

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Fetch the record for a (job, revision) pair.
    async fn get(&self, key: &RequestKey) -> StoreResult<Option<BuildRequest>>;

    /// Insert `request` unless a record for its key already exists.
    /// Returns true if this call created the record.
    async fn put_if_absent(&self, request: &BuildRequest) -> StoreResult<bool>;

    /// Move a live record to `state`.
    ///
    /// Fails with [`StoreError::StaleUpdate`] if the record is already terminal
    /// (or, for `Dispatched`, is no longer pending) and [`StoreError::NotFound`]
    /// if there is no record.
    async fn update_state(&self, key: &RequestKey, state: RequestState)
    -> StoreResult<BuildRequest>;

    /// Return a dispatched record to pending after the backend refused it,
    /// keeping `error`. Fails with [`StoreError::StaleUpdate`] unless the
    /// record is currently dispatched.
    async fn mark_dispatch_failed(&self, key: &RequestKey, error: &str)
    -> StoreResult<BuildRequest>;

    /// Replace the set of dependencies a live record is waiting on.
    async fn set_waiting(&self, key: &RequestKey, waiting_on: &BTreeSet<JobId>)
    -> StoreResult<()>;

    /// All non-terminal records for a revision.
    async fn list_pending(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>>;

    /// Every record for a revision, whatever its state.
    async fn list_revision(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>>;

    /// Revisions with at least one pending record that is not held back by a
    /// failed dispatch.
    async fn pending_revisions(&self) -> StoreResult<Vec<SourceRevision>>;
}

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
