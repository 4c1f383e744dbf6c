//! Dispatcher trait: the boundary to the execution backend.

use async_trait::async_trait;

use crate::job::JobSpec;
use crate::{RequestKey, Result};

/// Hands build requests to whatever actually runs jobs.
///
/// `dispatch` is called at most once per (job, revision). The backend later
/// reports the result through the engine's completion entry point. It must do
/// so asynchronously: calling back into the engine from inside `dispatch`
/// would wait on the request lock held by the dispatching call.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Start running `spec` for the revision in `key`.
    async fn dispatch(&self, key: &RequestKey, spec: &JobSpec) -> Result<()>;
}
