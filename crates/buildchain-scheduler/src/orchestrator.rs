//! Build orchestrator - runs jobs for a revision in dependency order, at most once each.
//!
//! Work is requested lazily: asking for one job walks its dependencies,
//! records every request as pending before recursing, and dispatches a job
//! only once all of its dependencies have succeeded for the same revision.
//! Completions arrive asynchronously and in any order; each one either
//! re-evaluates the pending requests of its revision or cancels the ones that
//! can no longer run.
//!
//! A request whose hand-off the backend refused goes back to pending with the
//! error attached. Re-evaluation and recovery leave it alone; only a caller's
//! `ensure` that reaches it dispatches it again.
//!
//! Locks are taken per (job, revision) and only ever from a dependent towards
//! its dependencies, so the acyclic job graph rules out lock cycles. Cascades
//! run after every lock of the triggering call has been released.

use async_recursion::async_recursion;
use buildchain_core::{
    BuildRequest, Dispatcher, JobGraph, JobId, RequestKey, RequestOrigin, RequestState,
    SourceRevision,
};
use buildchain_store::{RequestStore, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::locks::RequestLocks;

/// Orchestrates build requests for a fixed job graph.
pub struct OrchestrationEngine {
    graph: Arc<JobGraph>,
    store: Arc<dyn RequestStore>,
    dispatcher: Arc<dyn Dispatcher>,
    locks: RequestLocks,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl OrchestrationEngine {
    pub fn new(
        graph: Arc<JobGraph>,
        store: Arc<dyn RequestStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            graph,
            store,
            dispatcher,
            locks: RequestLocks::new(),
            events: None,
        }
    }

    /// Stream lifecycle events. Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Make sure `job_id` runs for `revision`, requesting its dependencies first.
    ///
    /// Idempotent: a request that already reached a terminal state is returned
    /// as is, and a dispatched one is never dispatched again. Requests on this
    /// path whose last dispatch failed are handed to the backend once more.
    pub async fn ensure(
        &self,
        job_id: &JobId,
        revision: &SourceRevision,
        origin: RequestOrigin,
    ) -> EngineResult<BuildRequest> {
        self.check_job(job_id)?;
        let key = RequestKey::new(job_id.clone(), revision.clone());

        let mut cancelled = Vec::new();
        let result = self.ensure_locked(key, origin, true, &mut cancelled).await;
        let cascaded = self.cascade(revision, cancelled).await;

        let request = result?;
        cascaded?;
        Ok(request)
    }

    /// Record the result the execution backend reported for a job.
    ///
    /// Duplicate notifications for an already terminal request are absorbed.
    pub async fn on_job_completed(
        &self,
        job_id: &JobId,
        revision: &SourceRevision,
        success: bool,
    ) -> EngineResult<()> {
        self.check_job(job_id)?;
        let key = RequestKey::new(job_id.clone(), revision.clone());

        let recorded = {
            let _guard = self.locks.acquire(&key).await;
            self.record_completion(&key, success).await?
        };
        if !recorded {
            return Ok(());
        }

        if success {
            self.reevaluate(revision).await
        } else {
            self.cascade(revision, vec![key]).await
        }
    }

    /// Re-evaluate every pending request in the store, e.g. after a restart.
    ///
    /// Dispatched requests and requests whose dispatch failed are left alone.
    /// Returns the number of revisions visited.
    pub async fn recover(&self) -> EngineResult<usize> {
        let revisions = self.store.pending_revisions().await?;
        info!(revisions = revisions.len(), "Recovering pending build requests");

        for revision in &revisions {
            self.reevaluate(revision).await?;
        }
        Ok(revisions.len())
    }

    /// Current record for a job at a revision, if any.
    pub async fn request(
        &self,
        job_id: &JobId,
        revision: &SourceRevision,
    ) -> EngineResult<Option<BuildRequest>> {
        let key = RequestKey::new(job_id.clone(), revision.clone());
        Ok(self.store.get(&key).await?)
    }

    /// Every record for a revision.
    pub async fn requests_for(&self, revision: &SourceRevision) -> EngineResult<Vec<BuildRequest>> {
        Ok(self.store.list_revision(revision).await?)
    }

    fn check_job(&self, job_id: &JobId) -> EngineResult<()> {
        if self.graph.contains(job_id) {
            Ok(())
        } else {
            Err(EngineError::UnknownJob(job_id.clone()))
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    #[async_recursion]
    async fn ensure_locked(
        &self,
        key: RequestKey,
        origin: RequestOrigin,
        retry_failed: bool,
        cancelled: &mut Vec<RequestKey>,
    ) -> EngineResult<BuildRequest> {
        let _guard = self.locks.acquire(&key).await;

        let request = match self.store.get(&key).await? {
            Some(existing) => existing,
            None => self.create(&key, origin).await?,
        };

        if !request.is_pending() {
            debug!(job = %key.job_id, revision = %key.revision, state = %request.state, "Nothing to do");
            return Ok(request);
        }
        if request.dispatch_failed() && !retry_failed {
            debug!(job = %key.job_id, revision = %key.revision, "Held after a failed dispatch");
            return Ok(request);
        }
        self.advance(request, retry_failed, cancelled).await
    }

    /// Persist a new pending record, or read back the one that beat us to it.
    async fn create(&self, key: &RequestKey, origin: RequestOrigin) -> EngineResult<BuildRequest> {
        let candidate = BuildRequest::pending(
            key.clone(),
            origin.clone(),
            self.graph.dependencies(&key.job_id),
        );

        if self.store.put_if_absent(&candidate).await? {
            info!(job = %key.job_id, revision = %key.revision, ?origin, "Build request created");
            self.emit(EngineEvent::RequestCreated {
                key: key.clone(),
                origin,
            });
            return Ok(candidate);
        }

        self.reload(key).await
    }

    /// Check dependencies of a pending request and move it forward.
    ///
    /// The caller holds the request's lock. Dependency state is always read
    /// fresh from the store.
    async fn advance(
        &self,
        mut request: BuildRequest,
        retry_failed: bool,
        cancelled: &mut Vec<RequestKey>,
    ) -> EngineResult<BuildRequest> {
        let key = request.key.clone();
        let mut waiting = BTreeSet::new();

        for dependency in self.graph.dependencies(&key.job_id) {
            let dep_key = key.sibling(&dependency);
            let state = match self.store.get(&dep_key).await? {
                Some(existing) if existing.state.is_terminal() => existing.state,
                _ => {
                    let origin = RequestOrigin::dependency_of(&key.job_id);
                    self.ensure_locked(dep_key, origin, retry_failed, cancelled)
                        .await?
                        .state
                }
            };

            match state {
                RequestState::Succeeded => {}
                RequestState::Failed | RequestState::Cancelled { .. } => {
                    return self.cancel(&key, dependency, cancelled).await;
                }
                RequestState::Pending | RequestState::Dispatched => {
                    waiting.insert(dependency);
                }
            }
        }

        if waiting.is_empty() {
            return self.dispatch(&key).await;
        }

        if waiting != request.waiting_on {
            match self.store.set_waiting(&key, &waiting).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => return self.reload(&key).await,
                Err(e) => return Err(e.into()),
            }
            self.emit(EngineEvent::Waiting {
                key: key.clone(),
                waiting_on: waiting.clone(),
            });
            request.waiting_on = waiting;
        }

        debug!(job = %key.job_id, revision = %key.revision, waiting_on = ?request.waiting_on, "Waiting on dependencies");
        Ok(request)
    }

    /// Pending -> Dispatched, then hand the job to the backend.
    async fn dispatch(&self, key: &RequestKey) -> EngineResult<BuildRequest> {
        let spec = self
            .graph
            .job(&key.job_id)
            .ok_or_else(|| EngineError::UnknownJob(key.job_id.clone()))?;

        // Persisted first: a crash after this point can never lead to a second dispatch.
        let request = match self.store.update_state(key, RequestState::Dispatched).await {
            Ok(request) => request,
            Err(e) if e.is_stale() => return self.reload(key).await,
            Err(e) => return Err(e.into()),
        };

        info!(job = %key.job_id, revision = %key.revision, backend = self.dispatcher.name(), "Dispatching build request");

        if let Err(source) = self.dispatcher.dispatch(key, spec).await {
            let error = source.to_string();
            warn!(job = %key.job_id, revision = %key.revision, %error, "Dispatch failed, holding request until asked again");
            if let Err(e) = self.store.mark_dispatch_failed(key, &error).await {
                warn!(job = %key.job_id, revision = %key.revision, error = %e, "Could not record failed dispatch");
            }
            self.emit(EngineEvent::DispatchFailed {
                key: key.clone(),
                error,
            });
            return Err(EngineError::Dispatch {
                key: key.clone(),
                source,
            });
        }

        self.emit(EngineEvent::Dispatched { key: key.clone() });
        Ok(request)
    }

    /// Cancel a pending request whose dependency `cause` can no longer succeed.
    /// The caller holds the request's lock.
    async fn cancel(
        &self,
        key: &RequestKey,
        cause: JobId,
        cancelled: &mut Vec<RequestKey>,
    ) -> EngineResult<BuildRequest> {
        let state = RequestState::Cancelled {
            cause: cause.clone(),
        };
        match self.store.update_state(key, state).await {
            Ok(request) => {
                info!(job = %key.job_id, revision = %key.revision, %cause, "Build request cancelled");
                self.emit(EngineEvent::Cancelled {
                    key: key.clone(),
                    cause,
                });
                cancelled.push(key.clone());
                Ok(request)
            }
            Err(e) if e.is_stale() => self.reload(key).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false if the completion was a duplicate.
    async fn record_completion(&self, key: &RequestKey, success: bool) -> EngineResult<bool> {
        let state = RequestState::completed(success);

        match self.store.update_state(key, state.clone()).await {
            Ok(_) => {}
            Err(e) if e.is_stale() => return Ok(self.duplicate_completion(key)),
            Err(StoreError::NotFound(_)) => {
                // Reported before anyone asked for it here.
                let record = BuildRequest::reported(key.clone(), success);
                if !self.store.put_if_absent(&record).await? {
                    match self.store.update_state(key, state).await {
                        Ok(_) => {}
                        Err(e) if e.is_stale() => return Ok(self.duplicate_completion(key)),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        info!(job = %key.job_id, revision = %key.revision, success, "Build request completed");
        self.emit(EngineEvent::Completed {
            key: key.clone(),
            success,
        });
        Ok(true)
    }

    fn duplicate_completion(&self, key: &RequestKey) -> bool {
        debug!(job = %key.job_id, revision = %key.revision, "Ignoring duplicate completion");
        self.emit(EngineEvent::DuplicateCompletion { key: key.clone() });
        false
    }

    /// Give every pending request of a revision another chance to dispatch.
    async fn reevaluate(&self, revision: &SourceRevision) -> EngineResult<()> {
        let mut cancelled = Vec::new();
        let mut first_error = None;

        for candidate in self.store.list_pending(revision).await? {
            if !candidate.is_pending() || candidate.dispatch_failed() {
                continue;
            }
            if !self.graph.contains(candidate.job_id()) {
                warn!(job = %candidate.key.job_id, %revision, "Pending request for a job missing from the job graph");
                continue;
            }
            if let Err(e) = self.reevaluate_one(candidate.key, &mut cancelled).await {
                warn!(%revision, error = %e, "Re-evaluation failed");
                first_error.get_or_insert(e);
            }
        }

        self.cascade(revision, cancelled).await?;
        first_error.map_or(Ok(()), Err)
    }

    async fn reevaluate_one(
        &self,
        key: RequestKey,
        cancelled: &mut Vec<RequestKey>,
    ) -> EngineResult<()> {
        let _guard = self.locks.acquire(&key).await;
        if let Some(request) = self.store.get(&key).await? {
            if request.is_pending() && !request.dispatch_failed() {
                self.advance(request, false, cancelled).await?;
            }
        }
        Ok(())
    }

    /// Cancel pending requests waiting on anything in `poisoned`, transitively.
    async fn cascade(
        &self,
        revision: &SourceRevision,
        mut poisoned: Vec<RequestKey>,
    ) -> EngineResult<()> {
        while let Some(cause) = poisoned.pop() {
            for candidate in self.store.list_pending(revision).await? {
                if !candidate.is_pending() || !candidate.waiting_on.contains(&cause.job_id) {
                    continue;
                }

                let _guard = self.locks.acquire(&candidate.key).await;
                // It may have moved on since the listing.
                match self.store.get(&candidate.key).await? {
                    Some(current) if current.is_pending() => {}
                    _ => continue,
                }

                let state = RequestState::Cancelled {
                    cause: cause.job_id.clone(),
                };
                match self.store.update_state(&candidate.key, state).await {
                    Ok(_) => {
                        info!(job = %candidate.key.job_id, %revision, cause = %cause.job_id, "Build request cancelled");
                        self.emit(EngineEvent::Cancelled {
                            key: candidate.key.clone(),
                            cause: cause.job_id.clone(),
                        });
                        poisoned.push(candidate.key);
                    }
                    Err(e) if e.is_stale() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn reload(&self, key: &RequestKey) -> EngineResult<BuildRequest> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("build request {}", key)).into())
    }
}
