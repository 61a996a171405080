//! Error types for the task store.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(#[from] drover_types::Error),

    /// The on-disk schema was written by a newer drover.
    #[error("schema for '{provider}' is version {found}, this build supports up to {supported}")]
    SchemaTooNew {
        provider: &'static str,
        found: i32,
        supported: i32,
    },

    /// Schema upgrade failed.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A write-once row already exists.
    #[error("{entity} '{key}' already exists")]
    AlreadyExists { entity: &'static str, key: String },

    /// A set-once value was written with a different value.
    #[error("'{key}' is already set to '{existing}', refusing to set '{attempted}'")]
    Conflict {
        key: String,
        existing: String,
        attempted: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error comes from a concurrent writer holding the file
    /// (locked/busy) or a momentarily read-only handle, rather than from a
    /// broken store.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }

    /// Whether this is a primary-key or unique constraint violation.
    pub(crate) fn is_constraint(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
        )
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
