//! Persisted record types
//!
//! Three principal records: [`ProcessExecutionRecord`] (one per run),
//! [`NodeExecutionRecord`] (one per node step), and
//! [`ApprovalRequestRecord`] (one per approval/human-task gate). An
//! execution owns its node executions and approvals; deleting it cascades.
//! Parent executions loosely reference children via `parent_execution_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status of a process execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRecordStatus {
    Pending,
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionRecordStatus {
    /// Terminal statuses can never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionRecordStatus::Completed
                | ExecutionRecordStatus::Failed
                | ExecutionRecordStatus::Cancelled
                | ExecutionRecordStatus::TimedOut
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ExecutionRecordStatus::Pending
                | ExecutionRecordStatus::Running
                | ExecutionRecordStatus::Waiting
                | ExecutionRecordStatus::Paused
        )
    }
}

/// Status of a single node step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Escalated,
}

/// One run of a process definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessExecutionRecord {
    pub id: String,
    pub org_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Monotonic per agent
    pub execution_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub status: ExecutionRecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub trigger_input: Map<String, Value>,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_data: Option<Value>,
    #[serde(default)]
    pub can_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<f64>,
    #[serde(default)]
    pub node_count_executed: u64,
    #[serde(default)]
    pub tool_calls_count: u64,
    #[serde(default)]
    pub ai_calls_count: u64,
    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub execution_depth: u32,

    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default = "default_process_version")]
    pub process_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_snapshot: Option<Value>,
    #[serde(default)]
    pub extra_metadata: Map<String, Value>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_process_version() -> u32 {
    1
}

impl ProcessExecutionRecord {
    /// Fresh pending record
    pub fn new(
        org_id: impl Into<String>,
        agent_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            agent_id: agent_id.into(),
            conversation_id: None,
            execution_number: 1,
            correlation_id: None,
            status: ExecutionRecordStatus::Pending,
            current_node_id: None,
            completed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            variables: Map::new(),
            trigger_input: Map::new(),
            trigger_type: "manual".to_string(),
            output: None,
            checkpoint_data: None,
            can_resume: false,
            checkpoint_at: None,
            waiting_for: None,
            error_message: None,
            error_node_id: None,
            error_details: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            last_retry_at: None,
            started_at: None,
            completed_at: None,
            total_duration_ms: None,
            node_count_executed: 0,
            tool_calls_count: 0,
            ai_calls_count: 0,
            tokens_used: 0,
            parent_execution_id: None,
            parent_node_id: None,
            execution_depth: 0,
            created_at: Utc::now(),
            created_by: created_by.into(),
            updated_at: None,
            process_version: default_process_version(),
            process_definition_snapshot: None,
            extra_metadata: Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// One node step within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: String,
    pub process_execution_id: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    pub execution_order: u64,

    pub status: NodeExecutionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_after: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_taken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<String>,
    #[serde(default)]
    pub llm_tokens_used: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response_body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<f64>,
}

impl NodeExecutionRecord {
    pub fn new(
        process_execution_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        execution_order: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process_execution_id: process_execution_id.into(),
            node_id: node_id.into(),
            node_type: node_type.into(),
            node_name: None,
            execution_order,
            status: NodeExecutionStatus::Pending,
            input_data: None,
            output_data: None,
            variables_before: None,
            variables_after: None,
            branch_taken: None,
            loop_index: None,
            loop_total: None,
            tool_name: None,
            tool_arguments: None,
            tool_result: None,
            llm_model: None,
            llm_prompt: None,
            llm_response: None,
            llm_tokens_used: 0,
            http_method: None,
            http_url: None,
            http_status_code: None,
            http_response_body: None,
            error_message: None,
            error_type: None,
            error_stack: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            wait_duration_ms: None,
        }
    }
}

/// A pending or decided approval/human-task gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestRecord {
    pub id: String,
    pub org_id: String,
    pub process_execution_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    pub status: ApprovalStatus,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub review_data: Value,
    #[serde(default = "default_priority")]
    pub priority: String,

    /// user | role | group | department | any
    #[serde(default = "default_assignee_type")]
    pub assignee_type: String,
    #[serde(default)]
    pub assigned_user_ids: Vec<String>,
    #[serde(default)]
    pub assigned_role_ids: Vec<String>,
    #[serde(default)]
    pub assigned_group_ids: Vec<String>,
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub approval_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_comments: Option<String>,
    #[serde(default)]
    pub decision_data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_after_hours: Option<u32>,
    #[serde(default)]
    pub escalation_user_ids: Vec<String>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reminder_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_sent_at: Option<DateTime<Utc>>,
    /// What to do with the owning execution on expiry (from node config)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_action: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_priority() -> String {
    "normal".to_string()
}
fn default_assignee_type() -> String {
    "user".to_string()
}
fn default_min_approvals() -> u32 {
    1
}

impl ApprovalRequestRecord {
    pub fn new(
        org_id: impl Into<String>,
        process_execution_id: impl Into<String>,
        node_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.into(),
            process_execution_id: process_execution_id.into(),
            node_id: node_id.into(),
            node_name: None,
            status: ApprovalStatus::Pending,
            title: title.into(),
            description: None,
            review_data: Value::Null,
            priority: default_priority(),
            assignee_type: default_assignee_type(),
            assigned_user_ids: Vec::new(),
            assigned_role_ids: Vec::new(),
            assigned_group_ids: Vec::new(),
            min_approvals: default_min_approvals(),
            approval_count: 0,
            decided_by: None,
            decided_at: None,
            decision: None,
            decision_comments: None,
            decision_data: Value::Null,
            deadline_at: None,
            escalate_after_hours: None,
            escalation_user_ids: Vec::new(),
            escalated: false,
            escalated_at: None,
            reminder_sent: false,
            reminder_sent_at: None,
            timeout_action: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Escalated requests remain actionable by their new assignees
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            ApprovalStatus::Pending | ApprovalStatus::Escalated
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && self
                .deadline_at
                .map(|deadline| deadline < now)
                .unwrap_or(false)
    }

    /// Whether a user may see/decide this request
    pub fn is_visible_to(&self, user_id: &str, role_ids: &[String], group_ids: &[String]) -> bool {
        match self.assignee_type.as_str() {
            "any" => true,
            "role" => self
                .assigned_role_ids
                .iter()
                .any(|role| role_ids.contains(role)),
            "group" => self
                .assigned_group_ids
                .iter()
                .any(|group| group_ids.contains(group)),
            _ => self.assigned_user_ids.iter().any(|id| id == user_id),
        }
    }
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub org_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<ExecutionRecordStatus>,
    pub parent_execution_id: Option<String>,
    pub limit: Option<usize>,
}

/// Aggregated execution metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub waiting: u64,
    pub running: u64,
    pub cancelled: u64,
    pub avg_duration_ms: f64,
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionRecordStatus::Completed.is_terminal());
        assert!(ExecutionRecordStatus::TimedOut.is_terminal());
        assert!(!ExecutionRecordStatus::Waiting.is_terminal());
        assert!(ExecutionRecordStatus::Waiting.is_active());
    }

    #[test]
    fn test_approval_visibility() {
        let mut approval = ApprovalRequestRecord::new("org", "exec", "node", "Review");
        approval.assigned_user_ids = vec!["u1".to_string()];
        assert!(approval.is_visible_to("u1", &[], &[]));
        assert!(!approval.is_visible_to("u2", &[], &[]));

        approval.assignee_type = "role".to_string();
        approval.assigned_role_ids = vec!["admins".to_string()];
        assert!(approval.is_visible_to("u2", &["admins".to_string()], &[]));

        approval.assignee_type = "any".to_string();
        assert!(approval.is_visible_to("anyone", &[], &[]));
    }

    #[test]
    fn test_approval_expiry() {
        let mut approval = ApprovalRequestRecord::new("org", "exec", "node", "Review");
        assert!(!approval.is_expired(Utc::now()));
        approval.deadline_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(approval.is_expired(Utc::now()));
    }

    #[test]
    fn test_execution_serde_round_trip() {
        let mut record = ProcessExecutionRecord::new("org", "agent", "user");
        record.status = ExecutionRecordStatus::Waiting;
        record.can_resume = true;
        let json = serde_json::to_string(&record).unwrap();
        let back: ProcessExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ExecutionRecordStatus::Waiting);
        assert!(back.can_resume);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&ExecutionRecordStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert_eq!(
            serde_json::to_string(&NodeExecutionStatus::Retrying).unwrap(),
            "\"retrying\""
        );
    }
}
