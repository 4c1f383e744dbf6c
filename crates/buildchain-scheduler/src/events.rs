//! Events emitted while the engine moves build requests through their lifecycle.

use buildchain_core::{JobId, RequestKey, RequestOrigin};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A pending record was created.
    RequestCreated { key: RequestKey, origin: RequestOrigin },
    /// The set of dependencies a pending request waits on changed.
    Waiting {
        key: RequestKey,
        waiting_on: BTreeSet<JobId>,
    },
    /// Handed to the execution backend.
    Dispatched { key: RequestKey },
    /// The backend refused the hand-off. The request stays pending until asked for again.
    DispatchFailed { key: RequestKey, error: String },
    /// A completion was recorded.
    Completed { key: RequestKey, success: bool },
    /// Never dispatched because `cause` failed or was cancelled.
    Cancelled { key: RequestKey, cause: JobId },
    /// A completion arrived for an already terminal request and was ignored.
    DuplicateCompletion { key: RequestKey },
}

impl EngineEvent {
    pub fn key(&self) -> &RequestKey {
        match self {
            EngineEvent::RequestCreated { key, .. }
            | EngineEvent::Waiting { key, .. }
            | EngineEvent::Dispatched { key }
            | EngineEvent::DispatchFailed { key, .. }
            | EngineEvent::Completed { key, .. }
            | EngineEvent::Cancelled { key, .. }
            | EngineEvent::DuplicateCompletion { key } => key,
        }
    }
}
