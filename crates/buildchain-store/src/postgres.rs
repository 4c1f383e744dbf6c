//! PostgreSQL request store.

use async_trait::async_trait;
use buildchain_core::{
    BuildRequest, JobId, RequestId, RequestKey, RequestOrigin, RequestState, SourceRevision,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::debug;

use crate::{RequestStore, StoreError, StoreResult};

/// A build request row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRequestRecord {
    pub id: uuid::Uuid,
    pub job_id: String,
    pub revision: String,
    pub origin: serde_json::Value,
    pub state: String,
    pub cancelled_by: Option<String>,
    pub waiting_on: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dispatch_error: Option<String>,
}

impl TryFrom<BuildRequestRecord> for BuildRequest {
    type Error = StoreError;

    fn try_from(record: BuildRequestRecord) -> Result<Self, Self::Error> {
        let state = RequestState::from_parts(&record.state, record.cancelled_by.as_deref())
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "build request {} has state '{}' (cancelled_by: {:?})",
                    record.id, record.state, record.cancelled_by
                ))
            })?;
        let origin: RequestOrigin = serde_json::from_value(record.origin)?;

        Ok(BuildRequest {
            id: RequestId::from_uuid(record.id),
            key: RequestKey::new(record.job_id, record.revision),
            origin,
            state,
            waiting_on: record.waiting_on.into_iter().map(JobId::from).collect(),
            requested_at: record.requested_at,
            dispatched_at: record.dispatched_at,
            finished_at: record.finished_at,
            dispatch_error: record.dispatch_error,
        })
    }
}

const LIVE_STATES: &str = "('pending', 'dispatched')";

/// Request store backed by PostgreSQL.
///
/// `put_if_absent` relies on the `(job_id, revision)` unique constraint and
/// terminal protection is enforced inside the `UPDATE`, so concurrent engines
/// sharing one database still see at most one record per pair.
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, key: &RequestKey) -> StoreResult<Option<BuildRequestRecord>> {
        let record = sqlx::query_as::<_, BuildRequestRecord>(
            "SELECT * FROM build_requests WHERE job_id = $1 AND revision = $2",
        )
        .bind(key.job_id.as_str())
        .bind(key.revision.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Explain why a guarded update matched no row.
    async fn rejected(&self, key: &RequestKey) -> StoreError {
        match self.fetch(key).await {
            Ok(Some(record)) => match BuildRequest::try_from(record) {
                Ok(existing) => StoreError::StaleUpdate {
                    key: key.clone(),
                    state: existing.state,
                },
                Err(e) => e,
            },
            Ok(None) => StoreError::NotFound(format!("build request {}", key)),
            Err(e) => e,
        }
    }

    fn convert(records: Vec<BuildRequestRecord>) -> StoreResult<Vec<BuildRequest>> {
        records.into_iter().map(BuildRequest::try_from).collect()
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn get(&self, key: &RequestKey) -> StoreResult<Option<BuildRequest>> {
        self.fetch(key)
            .await?
            .map(BuildRequest::try_from)
            .transpose()
    }

    async fn put_if_absent(&self, request: &BuildRequest) -> StoreResult<bool> {
        let waiting_on: Vec<&str> = request.waiting_on.iter().map(JobId::as_str).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO build_requests
                (id, job_id, revision, origin, state, cancelled_by, waiting_on,
                 requested_at, dispatched_at, finished_at, dispatch_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_id, revision) DO NOTHING
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(request.key.job_id.as_str())
        .bind(request.key.revision.as_str())
        .bind(serde_json::to_value(&request.origin)?)
        .bind(request.state.as_str())
        .bind(request.state.cancelled_by().map(JobId::as_str))
        .bind(&waiting_on)
        .bind(request.requested_at)
        .bind(request.dispatched_at)
        .bind(request.finished_at)
        .bind(request.dispatch_error.as_deref())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        if !created {
            debug!(request = %request.key, "Build request already recorded");
        }
        Ok(created)
    }

    async fn update_state(
        &self,
        key: &RequestKey,
        state: RequestState,
    ) -> StoreResult<BuildRequest> {
        let record = sqlx::query_as::<_, BuildRequestRecord>(&format!(
            r#"
            UPDATE build_requests
            SET state = $3::text,
                cancelled_by = $4,
                dispatched_at = CASE
                    WHEN $3::text = 'dispatched' THEN NOW()
                    WHEN $3::text = 'pending' THEN NULL
                    ELSE dispatched_at END,
                finished_at = CASE
                    WHEN $3::text IN ('succeeded', 'failed', 'cancelled') THEN NOW()
                    ELSE finished_at END,
                waiting_on = CASE
                    WHEN $3::text IN ('succeeded', 'failed', 'cancelled') THEN '{{}}'
                    ELSE waiting_on END,
                dispatch_error = CASE
                    WHEN $3::text = 'dispatched' THEN NULL
                    ELSE dispatch_error END
            WHERE job_id = $1 AND revision = $2 AND state IN {LIVE_STATES}
              AND ($3::text <> 'dispatched' OR state = 'pending')
            RETURNING *
            "#
        ))
        .bind(key.job_id.as_str())
        .bind(key.revision.as_str())
        .bind(state.as_str())
        .bind(state.cancelled_by().map(JobId::as_str))
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => BuildRequest::try_from(record),
            None => Err(self.rejected(key).await),
        }
    }

    async fn mark_dispatch_failed(
        &self,
        key: &RequestKey,
        error: &str,
    ) -> StoreResult<BuildRequest> {
        let record = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            UPDATE build_requests
            SET state = 'pending', dispatched_at = NULL, dispatch_error = $3
            WHERE job_id = $1 AND revision = $2 AND state = 'dispatched'
            RETURNING *
            "#,
        )
        .bind(key.job_id.as_str())
        .bind(key.revision.as_str())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => BuildRequest::try_from(record),
            None => Err(self.rejected(key).await),
        }
    }

    async fn set_waiting(
        &self,
        key: &RequestKey,
        waiting_on: &BTreeSet<JobId>,
    ) -> StoreResult<()> {
        let waiting_on: Vec<&str> = waiting_on.iter().map(JobId::as_str).collect();
        let result = sqlx::query(&format!(
            "UPDATE build_requests SET waiting_on = $3 \
             WHERE job_id = $1 AND revision = $2 AND state IN {LIVE_STATES}"
        ))
        .bind(key.job_id.as_str())
        .bind(key.revision.as_str())
        .bind(&waiting_on)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(key).await);
        }
        Ok(())
    }

    async fn list_pending(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>> {
        let records = sqlx::query_as::<_, BuildRequestRecord>(&format!(
            "SELECT * FROM build_requests WHERE revision = $1 AND state IN {LIVE_STATES} \
             ORDER BY requested_at ASC"
        ))
        .bind(revision.as_str())
        .fetch_all(&self.pool)
        .await?;
        Self::convert(records)
    }

    async fn list_revision(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>> {
        let records = sqlx::query_as::<_, BuildRequestRecord>(
            "SELECT * FROM build_requests WHERE revision = $1 ORDER BY requested_at ASC",
        )
        .bind(revision.as_str())
        .fetch_all(&self.pool)
        .await?;
        Self::convert(records)
    }

    async fn pending_revisions(&self) -> StoreResult<Vec<SourceRevision>> {
        let revisions: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT revision FROM build_requests \
             WHERE state = 'pending' AND dispatch_error IS NULL ORDER BY revision",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(revisions.into_iter().map(SourceRevision::from).collect())
    }
}
