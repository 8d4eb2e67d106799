//! Node and process execution result types
//!
//! Every node executor returns a [`NodeResult`]; the engine aggregates them
//! into a terminal [`ProcessResult`]. Both are explicit sum-of-state structs
//! rather than error-driven control flow: a waiting approval and a failed
//! HTTP call are both ordinary values the engine inspects.

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Execution outcome status, shared by node and process results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Skipped,
    Waiting,
    Cancelled,
    Timeout,
}

/// What a paused execution is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingKind {
    Approval,
    HumanTask,
    Delay,
    Schedule,
    Event,
    Subprocess,
}

impl WaitingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingKind::Approval => "approval",
            WaitingKind::HumanTask => "human_task",
            WaitingKind::Delay => "delay",
            WaitingKind::Schedule => "schedule",
            WaitingKind::Event => "event",
            WaitingKind::Subprocess => "subprocess",
        }
    }
}

/// Result from executing a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    /// Execution status
    pub status: ExecutionStatus,

    /// Node output data (if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Next node to execute (for branching nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,

    /// Next nodes for parallel fan-out / loop body entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_ids: Option<Vec<String>>,

    /// Variables to update in state
    #[serde(default)]
    pub variables_update: serde_json::Map<String, Value>,

    /// Error information if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    /// Execution duration
    #[serde(default)]
    pub duration_ms: f64,

    /// LLM tokens used
    #[serde(default)]
    pub tokens_used: u64,

    /// Human-readable execution log lines for the audit trail
    #[serde(default)]
    pub logs: Vec<String>,

    /// What the node is waiting for, when status is `Waiting`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<WaitingKind>,

    /// Metadata for the waiting state (approval request payload, resume_at, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_metadata: Option<Value>,
}

impl NodeResult {
    /// Create a success result carrying only output
    pub fn success(output: Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: Some(output),
            next_node_id: None,
            next_node_ids: None,
            variables_update: serde_json::Map::new(),
            error: None,
            duration_ms: 0.0,
            tokens_used: 0,
            logs: Vec::new(),
            waiting_for: None,
            waiting_metadata: None,
        }
    }

    /// Create a failure result
    pub fn failure(error: ExecutionError) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            output: None,
            next_node_id: None,
            next_node_ids: None,
            variables_update: serde_json::Map::new(),
            error: Some(error),
            duration_ms: 0.0,
            tokens_used: 0,
            logs: Vec::new(),
            waiting_for: None,
            waiting_metadata: None,
        }
    }

    /// Create a skipped result
    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            logs: vec![format!("Skipped: {reason}")],
            status: ExecutionStatus::Skipped,
            ..Self::success(Value::Null)
        }
    }

    /// Create a waiting result
    pub fn waiting(waiting_for: WaitingKind, waiting_metadata: Value) -> Self {
        Self {
            status: ExecutionStatus::Waiting,
            waiting_for: Some(waiting_for),
            waiting_metadata: Some(waiting_metadata),
            ..Self::success(Value::Null)
        }
    }

    /// Set the output
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Direct the engine to a specific next node
    pub fn with_next_node(mut self, node_id: impl Into<String>) -> Self {
        self.next_node_id = Some(node_id.into());
        self
    }

    /// Direct the engine to several next nodes (parallel branches, loop body)
    pub fn with_next_nodes(mut self, node_ids: Vec<String>) -> Self {
        self.next_node_ids = Some(node_ids);
        self
    }

    /// Queue a variable update
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables_update.insert(name.into(), value);
        self
    }

    /// Replace the log lines
    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    /// Append a log line
    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    /// Set the duration
    pub fn with_duration_ms(mut self, ms: f64) -> Self {
        self.duration_ms = ms;
        self
    }

    /// Set tokens used
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failure
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ExecutionStatus::Waiting
    }

    pub fn is_skipped(&self) -> bool {
        self.status == ExecutionStatus::Skipped
    }

    /// Whether execution should continue to the next node
    pub fn should_continue(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Success | ExecutionStatus::Skipped
        )
    }
}

/// Result from executing an entire process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Final process status
    pub status: ExecutionStatus,

    /// Process output (END node output, or all variables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Final variable values
    #[serde(default)]
    pub final_variables: serde_json::Map<String, Value>,

    /// Executed node ids, in completion order
    #[serde(default)]
    pub nodes_executed: Vec<String>,

    /// Skipped node ids
    #[serde(default)]
    pub nodes_skipped: Vec<String>,

    /// Error, if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    /// Node that caused the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<String>,

    /// Wall-clock duration
    #[serde(default)]
    pub total_duration_ms: f64,

    /// Total LLM tokens used
    #[serde(default)]
    pub total_tokens_used: u64,

    /// Number of executed nodes
    #[serde(default)]
    pub node_count: usize,

    /// Whether the execution can be resumed
    #[serde(default)]
    pub can_resume: bool,

    /// Node to resume from, when waiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_node_id: Option<String>,

    /// What the process is waiting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<WaitingKind>,

    /// Metadata for the waiting state (used to create approval records etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_metadata: Option<Value>,

    /// Execution id for reference
    pub execution_id: String,
}

impl ProcessResult {
    /// Create a success result
    pub fn success(
        output: Value,
        final_variables: serde_json::Map<String, Value>,
        nodes_executed: Vec<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        let node_count = nodes_executed.len();
        Self {
            status: ExecutionStatus::Success,
            output: Some(output),
            final_variables,
            nodes_executed,
            nodes_skipped: Vec::new(),
            error: None,
            failed_node_id: None,
            total_duration_ms: 0.0,
            total_tokens_used: 0,
            node_count,
            can_resume: false,
            resume_node_id: None,
            waiting_for: None,
            waiting_metadata: None,
            execution_id: execution_id.into(),
        }
    }

    /// Create a failure result
    pub fn failure(error: ExecutionError, execution_id: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            error: Some(error),
            output: None,
            ..Self::success(
                Value::Null,
                serde_json::Map::new(),
                Vec::new(),
                execution_id,
            )
        }
    }

    /// Create a waiting result
    pub fn waiting(
        waiting_for: WaitingKind,
        resume_node_id: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Waiting,
            can_resume: true,
            waiting_for: Some(waiting_for),
            resume_node_id: Some(resume_node_id.into()),
            output: None,
            ..Self::success(
                Value::Null,
                serde_json::Map::new(),
                Vec::new(),
                execution_id,
            )
        }
    }

    /// Attach the executed-node trail and recompute the count
    pub fn with_nodes_executed(mut self, nodes: Vec<String>) -> Self {
        self.node_count = nodes.len();
        self.nodes_executed = nodes;
        self
    }

    /// Attach skipped nodes
    pub fn with_nodes_skipped(mut self, nodes: Vec<String>) -> Self {
        self.nodes_skipped = nodes;
        self
    }

    /// Attach final variables
    pub fn with_final_variables(mut self, vars: serde_json::Map<String, Value>) -> Self {
        self.final_variables = vars;
        self
    }

    /// Record the failing node
    pub fn with_failed_node(mut self, node_id: impl Into<String>) -> Self {
        self.failed_node_id = Some(node_id.into());
        self
    }

    /// Attach waiting metadata
    pub fn with_waiting_metadata(mut self, metadata: Value) -> Self {
        self.waiting_metadata = Some(metadata);
        self
    }

    /// Set the total duration
    pub fn with_duration_ms(mut self, ms: f64) -> Self {
        self.total_duration_ms = ms;
        self
    }

    /// Set total token usage
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.total_tokens_used = tokens;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failure
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ExecutionStatus::Waiting
    }

    /// Summarized JSON view for API responses (user-facing error rendering)
    pub fn to_summary_json(&self) -> Value {
        json!({
            "status": self.status,
            "execution_id": self.execution_id,
            "output": self.output,
            "node_count": self.node_count,
            "can_resume": self.can_resume,
            "waiting_for": self.waiting_for,
            "error": self.error.as_ref().map(|e| e.to_user_json()),
            "failed_node_id": self.failed_node_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ExecutionError};

    #[test]
    fn test_success_result() {
        let result = NodeResult::success(json!({"count": 42}))
            .with_variable("count", json!(42))
            .log("computed");

        assert!(result.is_success());
        assert!(result.should_continue());
        assert_eq!(result.variables_update["count"], json!(42));
        assert_eq!(result.logs, vec!["computed"]);
    }

    #[test]
    fn test_skipped_continues() {
        let result = NodeResult::skipped("node disabled");
        assert!(result.is_skipped());
        assert!(result.should_continue());
        assert_eq!(result.logs, vec!["Skipped: node disabled"]);
    }

    #[test]
    fn test_waiting_result() {
        let result = NodeResult::waiting(WaitingKind::Approval, json!({"node_id": "a1"}));
        assert!(result.is_waiting());
        assert!(!result.should_continue());
        assert_eq!(result.waiting_for, Some(WaitingKind::Approval));
    }

    #[test]
    fn test_failure_does_not_continue() {
        let result = NodeResult::failure(ExecutionError::validation_error("bad config"));
        assert!(result.is_failure());
        assert!(!result.should_continue());
    }

    #[test]
    fn test_process_waiting_can_resume() {
        let result = ProcessResult::waiting(WaitingKind::Delay, "delay-1", "exec-1");
        assert!(result.can_resume);
        assert_eq!(result.resume_node_id.as_deref(), Some("delay-1"));
    }

    #[test]
    fn test_process_result_node_count() {
        let result = ProcessResult::success(
            json!("done"),
            serde_json::Map::new(),
            vec!["start".into(), "work".into(), "end".into()],
            "exec-1",
        );
        assert_eq!(result.node_count, 3);
    }

    #[test]
    fn test_summary_uses_user_error_rendering() {
        let err = ExecutionError::new(ErrorCategory::External, "HTTP_500", "boom at line 3");
        let result = ProcessResult::failure(err, "exec-1").with_failed_node("fetch");
        let summary = result.to_summary_json();
        let msg = summary["error"]["message"].as_str().unwrap();
        assert!(!msg.contains("boom"));
    }

    #[test]
    fn test_waiting_kind_serde() {
        assert_eq!(
            serde_json::to_string(&WaitingKind::HumanTask).unwrap(),
            "\"human_task\""
        );
    }
}
