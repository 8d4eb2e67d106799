//! Storage errors

use thiserror::Error;

/// Convenience result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the record's current state
    /// (e.g. deciding an approval that is no longer pending)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization of a persisted payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("storage backend error: {0}")]
    Backend(String),
}
