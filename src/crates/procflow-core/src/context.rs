//! Execution context passed to node executors
//!
//! [`ProcessContext`] is the read-only side of an execution: who triggered
//! it, for which org/agent, with what input, and which tools the caller is
//! allowed to touch. Executors read it; only the engine constructs it.

use crate::llm::ChatMessage;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;

/// Read-only context for a single execution
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    pub execution_id: String,
    pub org_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub trigger_type: String,
    pub trigger_input: Map<String, Value>,
    pub correlation_id: Option<String>,
    /// Depth in the sub-process tree (0 for top-level executions)
    pub execution_depth: u32,
    /// Recent conversation, for AI_TASK `include_history`
    pub conversation_history: Vec<ChatMessage>,
    /// When set, only these tool ids may be invoked
    pub allowed_tool_ids: Option<HashSet<String>>,
    /// Tools explicitly denied by policy; checked before the allow list
    pub denied_tool_ids: HashSet<String>,
    /// Execution-scoped directory for file output
    pub output_dir: Option<PathBuf>,
}

impl ProcessContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            trigger_type: "manual".to_string(),
            ..Self::default()
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = org_id.into();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_trigger(
        mut self,
        trigger_type: impl Into<String>,
        trigger_input: Map<String, Value>,
    ) -> Self {
        self.trigger_type = trigger_type.into();
        self.trigger_input = trigger_input;
        self
    }

    pub fn with_allowed_tools(mut self, tool_ids: impl IntoIterator<Item = String>) -> Self {
        self.allowed_tool_ids = Some(tool_ids.into_iter().collect());
        self
    }

    pub fn with_denied_tools(mut self, tool_ids: impl IntoIterator<Item = String>) -> Self {
        self.denied_tool_ids = tool_ids.into_iter().collect();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Whether a tool may be invoked from this execution
    ///
    /// Deny list wins over everything; an absent allow list means all tools
    /// are available.
    pub fn is_tool_allowed(&self, tool_id: &str) -> bool {
        if self.denied_tool_ids.contains(tool_id) {
            return false;
        }
        match &self.allowed_tool_ids {
            Some(allowed) => allowed.contains(tool_id),
            None => true,
        }
    }

    /// User context published by the identity layer into the trigger input
    pub fn user_context(&self) -> Map<String, Value> {
        self.trigger_input
            .get("_user_context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Identity-directory warnings attached to the trigger input
    pub fn identity_warnings(&self) -> Vec<String> {
        self.trigger_input
            .get("_identity_warnings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
