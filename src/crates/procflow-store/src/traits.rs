//! The storage abstraction for process executions
//!
//! [`ExecutionStore`] is the single trait a persistence backend implements:
//! CRUD for executions, node executions and approval requests, per-agent
//! execution numbering, the pending-approval queries the approval surfaces
//! need, the expiry sweep, and wake-up queries for delayed executions.
//!
//! Every method is a short-lived operation scoped to one call; there are no
//! cross-call transactions. Implementations must be safe for concurrent use
//! (`Send + Sync`), since many executions persist through one store.

use crate::error::Result;
use crate::models::{
    ApprovalRequestRecord, ExecutionFilter, ExecutionStats, NodeExecutionRecord,
    ProcessExecutionRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage backend for executions, node executions, and approvals
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ----- executions -----------------------------------------------------

    /// Insert a new execution record
    async fn create_execution(&self, record: ProcessExecutionRecord) -> Result<()>;

    /// Fetch one execution
    async fn get_execution(&self, execution_id: &str) -> Result<Option<ProcessExecutionRecord>>;

    /// Fetch by correlation id within an org
    async fn get_execution_by_correlation(
        &self,
        org_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ProcessExecutionRecord>>;

    /// Replace an execution record (matched by id)
    async fn update_execution(&self, record: ProcessExecutionRecord) -> Result<()>;

    /// Delete an execution and everything it owns (node executions and
    /// approval requests cascade)
    async fn delete_execution(&self, execution_id: &str) -> Result<()>;

    /// List executions matching a filter, newest first
    async fn list_executions(&self, filter: &ExecutionFilter)
        -> Result<Vec<ProcessExecutionRecord>>;

    /// Next monotonic execution number for an agent
    async fn next_execution_number(&self, agent_id: &str) -> Result<u64>;

    /// Waiting executions whose scheduled wake-up time has passed
    /// (delay/schedule nodes record `wake_at` in their metadata)
    async fn list_due_resumptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessExecutionRecord>>;

    /// Aggregate metrics for an org (optionally one agent)
    async fn execution_stats(
        &self,
        org_id: &str,
        agent_id: Option<&str>,
    ) -> Result<ExecutionStats>;

    // ----- node executions ------------------------------------------------

    /// Insert a node-execution record
    async fn create_node_execution(&self, record: NodeExecutionRecord) -> Result<()>;

    /// Replace a node-execution record (matched by id)
    async fn update_node_execution(&self, record: NodeExecutionRecord) -> Result<()>;

    /// All node executions of an execution, by execution order
    async fn list_node_executions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<NodeExecutionRecord>>;

    // ----- approvals ------------------------------------------------------

    /// Insert an approval request
    async fn create_approval(&self, record: ApprovalRequestRecord) -> Result<()>;

    /// Fetch one approval request
    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequestRecord>>;

    /// Replace an approval request (matched by id)
    async fn update_approval(&self, record: ApprovalRequestRecord) -> Result<()>;

    /// Pending approvals of one execution
    async fn pending_approvals_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ApprovalRequestRecord>>;

    /// Pending approvals a user can act on (direct, role, group, or `any`)
    async fn pending_approvals_for_user(
        &self,
        org_id: &str,
        user_id: &str,
        role_ids: &[String],
        group_ids: &[String],
    ) -> Result<Vec<ApprovalRequestRecord>>;

    /// Mark past-deadline pending approvals expired (or escalated when an
    /// escalation target is configured) and return the updated records
    async fn expire_due_approvals(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequestRecord>>;
}
