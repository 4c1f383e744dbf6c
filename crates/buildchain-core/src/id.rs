//! Identifiers for jobs, revisions and build requests.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable name of a job, as written in the job table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for JobId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Opaque identifier of the input being built (usually a commit).
///
/// Never interpreted, only compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct SourceRevision(String);

impl SourceRevision {
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceRevision {
    fn from(revision: &str) -> Self {
        Self(revision.to_string())
    }
}

impl From<String> for SourceRevision {
    fn from(revision: String) -> Self {
        Self(revision)
    }
}

/// The identity of a build request: one job for one revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{job_id}@{revision}")]
pub struct RequestKey {
    pub job_id: JobId,
    pub revision: SourceRevision,
}

impl RequestKey {
    pub fn new(job_id: impl Into<JobId>, revision: impl Into<SourceRevision>) -> Self {
        Self {
            job_id: job_id.into(),
            revision: revision.into(),
        }
    }

    /// Key for another job of the same revision.
    pub fn sibling(&self, job_id: &JobId) -> Self {
        Self {
            job_id: job_id.clone(),
            revision: self.revision.clone(),
        }
    }
}

/// Unique identifier of a persisted build request record.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
