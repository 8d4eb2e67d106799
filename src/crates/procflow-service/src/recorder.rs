//! Node-execution recording from the engine's event stream
//!
//! The engine emits a `node_completed` event per node step; the recorder
//! turns each into a persisted [`NodeExecutionRecord`], extracting the typed
//! tool/LLM/HTTP details from the node family.

use chrono::Duration;
use procflow_core::{ProcessEvent, ProcessEventType};
use procflow_store::{ExecutionStore, NodeExecutionRecord, NodeExecutionStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Consume engine events, persisting one record per completed node
///
/// Runs until the sender side closes; returns the number of records written.
pub async fn record_node_executions(
    store: Arc<dyn ExecutionStore>,
    execution_id: String,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) -> u64 {
    let mut order = 0u64;
    while let Some(event) = events.recv().await {
        if event.event_type != ProcessEventType::NodeCompleted {
            continue;
        }
        let record = record_from_event(&execution_id, order, &event);
        if let Err(e) = store.create_node_execution(record).await {
            warn!(execution_id = %execution_id, error = %e, "failed to persist node execution");
        }
        order += 1;
    }
    order
}

fn record_from_event(execution_id: &str, order: u64, event: &ProcessEvent) -> NodeExecutionRecord {
    let data = &event.data;
    let node_id = data
        .get("node_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let node_type = data
        .get("node_type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut record = NodeExecutionRecord::new(execution_id, node_id, node_type, order);
    record.node_name = data
        .get("node_name")
        .and_then(Value::as_str)
        .map(str::to_string);

    record.status = match data.get("status").and_then(Value::as_str) {
        Some("success") => NodeExecutionStatus::Completed,
        Some("failure") => NodeExecutionStatus::Failed,
        Some("skipped") => NodeExecutionStatus::Skipped,
        Some("waiting") => NodeExecutionStatus::Waiting,
        _ => NodeExecutionStatus::Completed,
    };

    record.output_data = data.get("output").filter(|v| !v.is_null()).cloned();
    record.variables_before = data.get("variables_before").cloned();
    record.variables_after = data.get("variables_after").cloned();
    record.branch_taken = data
        .get("branch_taken")
        .and_then(Value::as_str)
        .map(str::to_string);
    record.loop_index = data.get("loop_index").and_then(Value::as_u64);
    record.loop_total = data.get("loop_total").and_then(Value::as_u64);

    if let Some(error) = data.get("error").filter(|v| !v.is_null()) {
        record.error_message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.error_type = error
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.retry_count = error
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
    }

    let duration_ms = data.get("duration_ms").and_then(Value::as_f64);
    record.duration_ms = duration_ms;
    record.completed_at = Some(event.timestamp);
    record.started_at = duration_ms
        .map(|ms| event.timestamp - Duration::milliseconds(ms as i64))
        .or(Some(event.timestamp));

    record.llm_tokens_used = data.get("tokens_used").and_then(Value::as_u64).unwrap_or(0);

    // Typed details by node family
    let output = data.get("output");
    match node_type {
        "tool_call" => {
            record.tool_result = output.cloned();
        }
        "http_request" => {
            record.http_status_code = output
                .and_then(|o| o.get("status_code"))
                .and_then(Value::as_u64)
                .map(|code| code as u16);
            record.http_response_body = output.and_then(|o| o.get("data")).cloned();
        }
        _ => {}
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use procflow_store::InMemoryExecutionStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_completed_nodes_in_order() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let recorder = tokio::spawn(record_node_executions(
            store.clone() as Arc<dyn ExecutionStore>,
            "exec-1".to_string(),
            rx,
        ));

        tx.send(
            ProcessEvent::new(
                ProcessEventType::NodeStarted,
                json!({"node_id": "start", "node_type": "start"}),
            )
            .with_node("start"),
        )
        .unwrap();
        tx.send(
            ProcessEvent::new(
                ProcessEventType::NodeCompleted,
                json!({
                    "node_id": "start",
                    "node_name": "start",
                    "node_type": "start",
                    "status": "success",
                    "output": {"started": true},
                    "duration_ms": 1.5,
                }),
            )
            .with_node("start"),
        )
        .unwrap();
        tx.send(
            ProcessEvent::new(
                ProcessEventType::NodeCompleted,
                json!({
                    "node_id": "fetch",
                    "node_type": "http_request",
                    "status": "failure",
                    "output": null,
                    "error": {"code": "HTTP_503", "message": "unavailable"},
                }),
            )
            .with_node("fetch"),
        )
        .unwrap();
        drop(tx);

        let written = recorder.await.unwrap();
        assert_eq!(written, 2);

        let records = store.list_node_executions("exec-1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node_id, "start");
        assert_eq!(records[0].status, NodeExecutionStatus::Completed);
        assert_eq!(records[0].execution_order, 0);
        assert_eq!(records[1].status, NodeExecutionStatus::Failed);
        assert_eq!(records[1].error_type.as_deref(), Some("HTTP_503"));
    }
}
