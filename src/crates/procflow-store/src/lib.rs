//! # procflow-store
//!
//! Persistence model and storage abstraction for process executions.
//!
//! The crate defines the three persisted record families - executions, node
//! executions, approval requests - the [`ExecutionStore`] trait backends
//! implement, and an in-memory reference implementation for tests and
//! single-process deployments.
//!
//! ```rust,ignore
//! use procflow_store::{ExecutionStore, InMemoryExecutionStore, ProcessExecutionRecord};
//!
//! let store = InMemoryExecutionStore::new();
//! let record = ProcessExecutionRecord::new("org-1", "agent-1", "user-1");
//! store.create_execution(record).await?;
//! ```

pub mod error;
pub mod memory;
pub mod models;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::InMemoryExecutionStore;
pub use models::{
    ApprovalRequestRecord, ApprovalStatus, ExecutionFilter, ExecutionRecordStatus,
    ExecutionStats, NodeExecutionRecord, NodeExecutionStatus, ProcessExecutionRecord,
};
pub use traits::ExecutionStore;
