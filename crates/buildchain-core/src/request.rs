//! Build requests: the record of one job for one source revision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{JobId, RequestId, RequestKey};

/// Why a build request exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestOrigin {
    /// Asked for directly by a caller.
    External { requested_by: Option<String> },
    /// Requested transitively because `of` (same revision) depends on it.
    Dependency { of: JobId },
    /// Created from a completion report for a job nobody had requested yet.
    Reported,
}

impl RequestOrigin {
    pub fn external() -> Self {
        RequestOrigin::External { requested_by: None }
    }

    pub fn requested_by(who: impl Into<String>) -> Self {
        RequestOrigin::External {
            requested_by: Some(who.into()),
        }
    }

    pub fn dependency_of(job: &JobId) -> Self {
        RequestOrigin::Dependency { of: job.clone() }
    }
}

/// Lifecycle state of a build request.
///
/// `Succeeded`, `Failed` and `Cancelled` are terminal and never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for dependencies.
    Pending,
    /// Handed to the execution backend.
    Dispatched,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
    /// Never dispatched because `cause` failed or was itself cancelled.
    Cancelled { cause: JobId },
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Cancelled { .. }
        )
    }

    pub fn completed(success: bool) -> Self {
        if success {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        }
    }

    /// Short name used for persistence and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Dispatched => "dispatched",
            RequestState::Succeeded => "succeeded",
            RequestState::Failed => "failed",
            RequestState::Cancelled { .. } => "cancelled",
        }
    }

    /// Rebuild a state from its persisted name and optional cancellation cause.
    pub fn from_parts(state: &str, cancelled_by: Option<&str>) -> Option<Self> {
        match state {
            "pending" => Some(RequestState::Pending),
            "dispatched" => Some(RequestState::Dispatched),
            "succeeded" => Some(RequestState::Succeeded),
            "failed" => Some(RequestState::Failed),
            "cancelled" => cancelled_by.map(|cause| RequestState::Cancelled {
                cause: JobId::from(cause),
            }),
            _ => None,
        }
    }

    pub fn cancelled_by(&self) -> Option<&JobId> {
        match self {
            RequestState::Cancelled { cause } => Some(cause),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Cancelled { cause } => write!(f, "cancelled (by {})", cause),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One job for one source revision, with its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: RequestId,
    pub key: RequestKey,
    pub origin: RequestOrigin,
    pub state: RequestState,
    /// Dependencies not yet known to have succeeded. Only meaningful while pending.
    pub waiting_on: BTreeSet<JobId>,
    pub requested_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the last hand-off to the backend failed. A pending request with an
    /// error is only dispatched again when a caller asks for it.
    pub dispatch_error: Option<String>,
}

impl BuildRequest {
    /// A new pending request.
    pub fn pending(
        key: RequestKey,
        origin: RequestOrigin,
        waiting_on: impl IntoIterator<Item = JobId>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            key,
            origin,
            state: RequestState::Pending,
            waiting_on: waiting_on.into_iter().collect(),
            requested_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            dispatch_error: None,
        }
    }

    /// A terminal record for a completion that arrived before any request.
    pub fn reported(key: RequestKey, success: bool) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            key,
            origin: RequestOrigin::Reported,
            state: RequestState::completed(success),
            waiting_on: BTreeSet::new(),
            requested_at: now,
            dispatched_at: None,
            finished_at: Some(now),
            dispatch_error: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.key.job_id
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, RequestState::Pending)
    }

    /// Pending because the backend refused the last hand-off.
    pub fn dispatch_failed(&self) -> bool {
        self.is_pending() && self.dispatch_error.is_some()
    }

    /// Back to pending after a refused hand-off, keeping the reason.
    pub fn fail_dispatch(&mut self, error: impl Into<String>) {
        self.transition(RequestState::Pending);
        self.dispatch_error = Some(error.into());
    }

    /// Move to `state`, stamping the matching timestamp.
    ///
    /// Callers are responsible for refusing transitions out of terminal states.
    pub fn transition(&mut self, state: RequestState) {
        let now = Utc::now();
        match &state {
            RequestState::Dispatched => {
                self.dispatched_at = Some(now);
                self.dispatch_error = None;
            }
            RequestState::Pending => self.dispatched_at = None,
            _ => self.finished_at = Some(now),
        }
        if state.is_terminal() {
            self.waiting_on.clear();
        }
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RequestState::Pending.is_terminal());
        assert!(!RequestState::Dispatched.is_terminal());
        assert!(RequestState::Succeeded.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(
            RequestState::Cancelled {
                cause: "build".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_state_parts() {
        let cancelled = RequestState::Cancelled {
            cause: "test".into(),
        };
        assert_eq!(
            RequestState::from_parts(cancelled.as_str(), Some("test")),
            Some(cancelled)
        );
        assert_eq!(RequestState::from_parts("cancelled", None), None);
        assert_eq!(RequestState::from_parts("bogus", None), None);
        assert_eq!(
            RequestState::from_parts("dispatched", None),
            Some(RequestState::Dispatched)
        );
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let key = RequestKey::new("build", "rev1");
        let mut request = BuildRequest::pending(key, RequestOrigin::external(), ["dep".into()]);
        assert!(request.is_pending());
        assert_eq!(request.waiting_on.len(), 1);

        request.transition(RequestState::Dispatched);
        assert!(request.dispatched_at.is_some());
        assert!(request.finished_at.is_none());

        request.transition(RequestState::Succeeded);
        assert!(request.finished_at.is_some());
        assert!(request.waiting_on.is_empty());
    }

    #[test]
    fn test_failed_dispatch_is_remembered_until_next_dispatch() {
        let mut request =
            BuildRequest::pending(RequestKey::new("build", "rev1"), RequestOrigin::external(), []);
        request.transition(RequestState::Dispatched);
        request.fail_dispatch("connection refused");

        assert!(request.dispatch_failed());
        assert!(request.dispatched_at.is_none());
        assert_eq!(request.dispatch_error.as_deref(), Some("connection refused"));

        request.transition(RequestState::Dispatched);
        assert!(!request.dispatch_failed());
        assert!(request.dispatch_error.is_none());
    }

    #[test]
    fn test_origin_serializes_tagged() {
        let origin = RequestOrigin::dependency_of(&"deploy".into());
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["kind"], "dependency");
        assert_eq!(json["of"], "deploy");
    }
}
