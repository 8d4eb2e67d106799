//! Service-level errors

use procflow_core::DefinitionError;
use procflow_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors from the execution service surfaces
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The referenced execution/approval does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is invalid for the record's current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Sub-process definition resolution failed
    #[error("unknown process: {0}")]
    UnknownProcess(String),
}
