// src/storage/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Write would move a run backwards in its lifecycle
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("entity belongs to organization {found}, not {expected}")]
    TenantMismatch { expected: String, found: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store temporarily unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
