//! Typed events emitted during process execution
//!
//! The engine pushes [`ProcessEvent`]s over an mpsc channel for observers:
//! live UIs stream them, and the service layer turns `node_started` /
//! `node_completed` pairs into persisted node-execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a process event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventType {
    ProcessStarted,
    NodeStarted,
    NodeCompleted,
    ProcessWaiting,
    ProcessFailed,
    ProcessCompleted,
}

/// One event in an execution's stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    #[serde(rename = "type")]
    pub event_type: ProcessEventType,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn new(event_type: ProcessEventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            node_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serde() {
        let event = ProcessEvent::new(
            ProcessEventType::NodeCompleted,
            json!({"status": "success"}),
        )
        .with_node("n1");

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("node_completed"));
        assert_eq!(value["node_id"], json!("n1"));
    }
}
