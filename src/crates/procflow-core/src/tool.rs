//! Platform tool interface
//!
//! Tools are the pluggable units of work a TOOL_CALL node invokes: API
//! wrappers, RAG lookups, data connectors. The engine only sees this trait;
//! tool registration, discovery and permissions live with the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of a tool invocation
///
/// Tools report failure in-band rather than through `Err` so that executors
/// can attach retryability and user messaging uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// An injected platform tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute the tool with named arguments
    async fn execute(&self, args: Map<String, Value>) -> ToolOutcome;
}
