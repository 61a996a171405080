//! Error types for engines, file schemes and templates.

use std::path::PathBuf;

use drover_types::TaskStatus;
use thiserror::Error;

/// Errors raised by an [`Engine`](crate::Engine) or a submission template.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend could not be reached or rejected the package.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The caller handed this backend a package shape it cannot run.
    #[error("{backend} accepts at most {max} input document(s), got {got}")]
    UnsupportedInputShape {
        backend: &'static str,
        max: usize,
        got: usize,
    },

    /// Outputs were requested before the run completed successfully.
    #[error("outputs of run '{run_id}' are not ready (status: {status})")]
    NotReady { run_id: String, status: TaskStatus },

    /// The operation is intentionally not provided by this backend.
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The backend has no record of this run.
    #[error("Unknown run: {0}")]
    UnknownRun(String),

    /// No environment is configured under this id.
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Server returned an error response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An engine-reported value could not be interpreted.
    #[error("Invalid engine data: {0}")]
    InvalidData(#[from] drover_types::Error),

    /// Spawning or supervising a process failed.
    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the caller must change its request rather than retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnsupportedInputShape { .. } | EngineError::NotReady { .. }
        )
    }

    /// Whether the backend intentionally lacks the operation.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, EngineError::Unsupported { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while copying outputs.
#[derive(Debug, Error)]
pub enum FileSchemeError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transport command ran but reported failure.
    #[error("copy of '{source_location}' failed: {message}")]
    Transfer {
        source_location: String,
        message: String,
    },

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl FileSchemeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FileSchemeError::Io {
            path: path.into(),
            source,
        }
    }
}
