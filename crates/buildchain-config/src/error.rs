//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("cycle detected in dependencies: {0}")]
    CycleDetected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<buildchain_core::Error> for ConfigError {
    fn from(err: buildchain_core::Error) -> Self {
        use buildchain_core::Error;

        match err {
            Error::DuplicateJob(job) => ConfigError::Duplicate(format!("job '{}'", job)),
            Error::UnknownDependency { job, dependency } => ConfigError::InvalidReference(
                format!("job '{}' depends on unknown job '{}'", job, dependency),
            ),
            Error::DependencyCycle(job) => ConfigError::CycleDetected(format!("job '{}'", job)),
            other => ConfigError::InvalidValue {
                field: "jobs".to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
