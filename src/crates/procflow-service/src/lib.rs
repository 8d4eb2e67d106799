//! # procflow-service
//!
//! Wires the process engine to persistence and exposes the surfaces
//! collaborators call: trigger, resume, approvals, wake-ups, queries,
//! cancellation, and sub-process invocation.
//!
//! ```rust,ignore
//! use procflow_service::{ExecutionService, StartRequest};
//! use procflow_store::InMemoryExecutionStore;
//! use std::sync::Arc;
//!
//! let service = ExecutionService::new(
//!     Arc::new(InMemoryExecutionStore::new()),
//!     Arc::new(deps),
//! );
//!
//! let result = service
//!     .start_execution(StartRequest::new(definition, "org-1", "agent-1", "user-1"))
//!     .await?;
//!
//! if result.is_waiting() {
//!     // later, when the approver decides:
//!     service.decide_approval(&approval_id, decision).await?;
//! }
//! ```

pub mod error;
pub mod recorder;
pub mod service;
pub mod subprocess;

pub use error::{Result, ServiceError};
pub use service::{
    ApprovalDecision, DefinitionResolver, ExecutionDetail, ExecutionService, ParentLink,
    StartRequest,
};
pub use subprocess::ServiceSubProcessRunner;
