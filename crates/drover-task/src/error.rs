//! Error types for the task lifecycle.

use drover_engine::{EngineError, FileSchemeError};
use drover_store::StoreError;
use drover_types::InfoKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The environment id stored for (or requested by) a task does not resolve.
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// A task store exists but lacks a key every task is created with.
    #[error("Task {tid} has no '{key}' recorded")]
    MissingMetadata { tid: String, key: InfoKey },

    /// The task was never submitted, so there is no run to talk to.
    #[error("Task {0} has not been submitted to an engine")]
    NotSubmitted(String),

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Output copy failed: {0}")]
    Copy(#[from] FileSchemeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownEnvironment(id) => TaskError::UnknownEnvironment(id),
            other => TaskError::Engine(other),
        }
    }
}

impl TaskError {
    /// Whether retrying (usually via resume) can succeed without the caller
    /// changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Engine(e) => !e.is_caller_error() && !e.is_unsupported(),
            TaskError::Store(e) => e.is_transient(),
            TaskError::Copy(_) | TaskError::Translation(_) | TaskError::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
