//! In-memory request store.

use async_trait::async_trait;
use buildchain_core::{BuildRequest, JobId, RequestKey, RequestState, SourceRevision};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::{RequestStore, StoreError, StoreResult};

/// Request store held in process memory, indexed by revision.
///
/// Nothing survives a restart; use it for tests and one-shot local runs.
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    revisions: RwLock<HashMap<SourceRevision, HashMap<JobId, BuildRequest>>>,
    writes: AtomicU64,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn get(&self, key: &RequestKey) -> StoreResult<Option<BuildRequest>> {
        let revisions = self.revisions.read().await;
        Ok(revisions
            .get(&key.revision)
            .and_then(|jobs| jobs.get(&key.job_id))
            .cloned())
    }

    async fn put_if_absent(&self, request: &BuildRequest) -> StoreResult<bool> {
        let mut revisions = self.revisions.write().await;
        let jobs = revisions.entry(request.key.revision.clone()).or_default();
        if jobs.contains_key(&request.key.job_id) {
            return Ok(false);
        }
        jobs.insert(request.key.job_id.clone(), request.clone());
        self.record_write();
        Ok(true)
    }

    async fn update_state(
        &self,
        key: &RequestKey,
        state: RequestState,
    ) -> StoreResult<BuildRequest> {
        let mut revisions = self.revisions.write().await;
        let request = revisions
            .get_mut(&key.revision)
            .and_then(|jobs| jobs.get_mut(&key.job_id))
            .ok_or_else(|| StoreError::NotFound(format!("build request {}", key)))?;

        let dispatching_twice =
            state == RequestState::Dispatched && request.state != RequestState::Pending;
        if request.state.is_terminal() || dispatching_twice {
            return Err(StoreError::StaleUpdate {
                key: key.clone(),
                state: request.state.clone(),
            });
        }

        request.transition(state);
        self.record_write();
        Ok(request.clone())
    }

    async fn mark_dispatch_failed(
        &self,
        key: &RequestKey,
        error: &str,
    ) -> StoreResult<BuildRequest> {
        let mut revisions = self.revisions.write().await;
        let request = revisions
            .get_mut(&key.revision)
            .and_then(|jobs| jobs.get_mut(&key.job_id))
            .ok_or_else(|| StoreError::NotFound(format!("build request {}", key)))?;

        if request.state != RequestState::Dispatched {
            return Err(StoreError::StaleUpdate {
                key: key.clone(),
                state: request.state.clone(),
            });
        }

        request.fail_dispatch(error);
        self.record_write();
        Ok(request.clone())
    }

    async fn set_waiting(
        &self,
        key: &RequestKey,
        waiting_on: &BTreeSet<JobId>,
    ) -> StoreResult<()> {
        let mut revisions = self.revisions.write().await;
        let request = revisions
            .get_mut(&key.revision)
            .and_then(|jobs| jobs.get_mut(&key.job_id))
            .ok_or_else(|| StoreError::NotFound(format!("build request {}", key)))?;

        if request.state.is_terminal() {
            return Err(StoreError::StaleUpdate {
                key: key.clone(),
                state: request.state.clone(),
            });
        }

        request.waiting_on = waiting_on.clone();
        self.record_write();
        Ok(())
    }

    async fn list_pending(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>> {
        let revisions = self.revisions.read().await;
        let mut pending: Vec<BuildRequest> = revisions
            .get(revision)
            .map(|jobs| {
                jobs.values()
                    .filter(|r| !r.state.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    async fn list_revision(&self, revision: &SourceRevision) -> StoreResult<Vec<BuildRequest>> {
        let revisions = self.revisions.read().await;
        let mut all: Vec<BuildRequest> = revisions
            .get(revision)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|r| r.requested_at);
        Ok(all)
    }

    async fn pending_revisions(&self) -> StoreResult<Vec<SourceRevision>> {
        let revisions = self.revisions.read().await;
        let mut live: Vec<SourceRevision> = revisions
            .iter()
            .filter(|(_, jobs)| {
                jobs.values()
                    .any(|r| r.is_pending() && r.dispatch_error.is_none())
            })
            .map(|(revision, _)| revision.clone())
            .collect();
        live.sort();
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildchain_core::RequestOrigin;

    fn pending(job: &str, revision: &str) -> BuildRequest {
        BuildRequest::pending(
            RequestKey::new(job, revision),
            RequestOrigin::external(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_put_if_absent_only_once() {
        let store = MemoryRequestStore::new();
        let first = pending("build", "rev1");
        let second = pending("build", "rev1");

        assert!(store.put_if_absent(&first).await.unwrap());
        assert!(!store.put_if_absent(&second).await.unwrap());

        let stored = store.get(&first.key).await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_records_are_final() {
        let store = MemoryRequestStore::new();
        let request = pending("build", "rev1");
        store.put_if_absent(&request).await.unwrap();

        store
            .update_state(&request.key, RequestState::Dispatched)
            .await
            .unwrap();
        let done = store
            .update_state(&request.key, RequestState::Failed)
            .await
            .unwrap();
        assert_eq!(done.state, RequestState::Failed);

        let err = store
            .update_state(&request.key, RequestState::Succeeded)
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(
            store.get(&request.key).await.unwrap().unwrap().state,
            RequestState::Failed
        );

        let err = store
            .set_waiting(&request.key, &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn test_dispatch_only_from_pending() {
        let store = MemoryRequestStore::new();
        let request = pending("build", "rev1");
        store.put_if_absent(&request).await.unwrap();

        store
            .update_state(&request.key, RequestState::Dispatched)
            .await
            .unwrap();
        let err = store
            .update_state(&request.key, RequestState::Dispatched)
            .await
            .unwrap_err();
        assert!(err.is_stale());

        // a refused hand-off goes back to pending with its reason
        let reverted = store
            .mark_dispatch_failed(&request.key, "backend unavailable")
            .await
            .unwrap();
        assert!(reverted.dispatch_failed());
        assert!(reverted.dispatched_at.is_none());

        // only a dispatched record can be marked
        let err = store
            .mark_dispatch_failed(&request.key, "again")
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let redispatched = store
            .update_state(&request.key, RequestState::Dispatched)
            .await
            .unwrap();
        assert!(redispatched.dispatch_error.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryRequestStore::new();
        let err = store
            .update_state(&RequestKey::new("build", "rev1"), RequestState::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pending_queries_are_scoped_to_revision() {
        let store = MemoryRequestStore::new();
        for request in [
            pending("build", "rev1"),
            pending("test", "rev1"),
            pending("build", "rev2"),
        ] {
            store.put_if_absent(&request).await.unwrap();
        }
        store
            .update_state(&RequestKey::new("build", "rev1"), RequestState::Dispatched)
            .await
            .unwrap();
        store
            .update_state(&RequestKey::new("build", "rev2"), RequestState::Dispatched)
            .await
            .unwrap();
        store
            .update_state(&RequestKey::new("build", "rev2"), RequestState::Succeeded)
            .await
            .unwrap();

        let live = store.list_pending(&"rev1".into()).await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(store.list_pending(&"rev2".into()).await.unwrap().is_empty());
        assert_eq!(store.list_revision(&"rev2".into()).await.unwrap().len(), 1);

        // only rev1 still has a request waiting on dependencies
        assert_eq!(
            store.pending_revisions().await.unwrap(),
            vec![SourceRevision::from("rev1")]
        );
    }
}
