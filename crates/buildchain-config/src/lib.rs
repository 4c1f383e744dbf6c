//! KDL configuration parsing for buildchain.
//!
//! This crate handles:
//! - Job table definitions (buildchain.kdl) turned into a validated job graph
//! - Variable interpolation for job commands

pub mod error;
pub mod jobs;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use jobs::{JobTable, load_jobs, parse_jobs};
pub use variables::VariableContext;
