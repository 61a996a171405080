//! Error types for parsing drover domain values.

use thiserror::Error;

/// Result type alias for domain parsing.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when a stored or engine-reported value cannot be interpreted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task status '{0}'")]
    UnknownStatus(String),

    #[error("unknown metadata key '{0}'")]
    UnknownInfoKey(String),

    #[error("unknown progress key '{0}'")]
    UnknownProgressKey(String),

    #[error("invalid output value for '{name}': {reason}")]
    InvalidOutput { name: String, reason: String },

    #[error("duplicate job identifier '{0}' in job tree")]
    DuplicateJob(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
