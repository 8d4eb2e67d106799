//! Flow control executors: START, END, MERGE

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::Dependencies;
use crate::error::ExecutionError;
use crate::executor::{config_string_list, config_string_or, NodeExecutor};
use crate::result::NodeResult;
use crate::state::ProcessState;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Entry point of every process
///
/// Seeds trigger input into variables: per the node's `input_mapping` when
/// one is declared, otherwise by copying every trigger-input field.
pub struct StartExecutor;

impl StartExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for StartExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let mut logs = vec!["Process started".to_string()];

        match &node.input_mapping {
            Some(mapping) if !mapping.is_empty() => {
                for (var_name, source) in mapping {
                    let key = source
                        .as_str()
                        .map(|s| s.replace("{{", "").replace("}}", "").trim().to_string())
                        .unwrap_or_default();
                    if let Some(value) = context.trigger_input.get(&key) {
                        state.set(var_name.clone(), value.clone(), &node.id);
                        logs.push(format!("Set {var_name} from trigger input"));
                    }
                }
            }
            _ => {
                for (key, value) in &context.trigger_input {
                    state.set(key.clone(), value.clone(), &node.id);
                    logs.push(format!("Set {key} from trigger input"));
                }
            }
        }

        logs.push(format!("Trigger type: {}", context.trigger_type));
        logs.push(format!("User: {}", context.user_id));

        NodeResult::success(json!({
            "started": true,
            "trigger_type": context.trigger_type,
            "user_id": context.user_id,
        }))
        .with_logs(logs)
    }
}

/// Exit point of a process
///
/// Computes the process output: an explicit field map, a single expression,
/// or - absent any `output` config - all variables. Sensitive values are
/// masked because the END output is the execution's exported payload.
pub struct EndExecutor;

impl EndExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for EndExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let mut logs = vec!["Process completed".to_string()];

        let output = match node.config_value("output") {
            Some(Value::Object(mapping)) => {
                let mut output = Map::new();
                for (output_key, var_path) in mapping {
                    let value = match var_path {
                        Value::String(expr) => match state.evaluate(expr) {
                            Ok(value) => value,
                            Err(e) => {
                                return NodeResult::failure(
                                    ExecutionError::validation_error(format!(
                                        "Failed to evaluate output '{output_key}': {e}"
                                    ))
                                    .with_source_node(&node.id),
                                )
                                .with_logs(logs);
                            }
                        },
                        other => other.clone(),
                    };
                    output.insert(output_key.clone(), value);
                }
                Value::Object(output)
            }
            Some(Value::String(expr)) => match state.evaluate(expr) {
                Ok(value) => value,
                Err(e) => {
                    return NodeResult::failure(
                        ExecutionError::validation_error(format!(
                            "Failed to evaluate output expression: {e}"
                        ))
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                }
            },
            _ => Value::Object(state.masked_variables()),
        };

        let output = state.mask_value(&output);
        logs.push(format!("Nodes executed: {}", state.completed_nodes().len()));

        NodeResult::success(output).with_logs(logs)
    }
}

/// Join point for parallel branches
///
/// Collects named source-node outputs and combines them per `strategy`:
/// `concat` flattens arrays, `object` merges objects, anything else keeps
/// the results as an array.
pub struct MergeExecutor;

impl MergeExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for MergeExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let strategy = config_string_or(node, "strategy", "array");
        let source_nodes = config_string_list(node, "source_nodes");
        let output_variable = node
            .output_variable
            .clone()
            .unwrap_or_else(|| "merged_results".to_string());

        let mut logs = vec![format!(
            "Merging results from {} branches",
            source_nodes.len()
        )];

        let mut results = Vec::new();
        for source_id in &source_nodes {
            if let Some(output) = state.node_output(source_id) {
                results.push(output.clone());
            }
        }
        logs.push(format!("Collected {} results", results.len()));

        let merged = match strategy.as_str() {
            "concat" => {
                let mut merged = Vec::new();
                for result in results {
                    match result {
                        Value::Array(items) => merged.extend(items),
                        other => merged.push(other),
                    }
                }
                Value::Array(merged)
            }
            "object" => {
                let mut merged = Map::new();
                for (i, result) in results.into_iter().enumerate() {
                    match result {
                        Value::Object(map) => merged.extend(map),
                        other => {
                            merged.insert(format!("result_{i}"), other);
                        }
                    }
                }
                Value::Object(merged)
            }
            _ => Value::Array(results),
        };

        NodeResult::success(merged.clone())
            .with_variable(output_variable, merged)
            .with_logs(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, NodeType};

    fn make_node(node_type: NodeType, type_config: Map<String, Value>) -> ProcessNode {
        ProcessNode {
            id: "n".to_string(),
            node_type,
            name: "n".to_string(),
            config: NodeConfig {
                type_config,
                ..NodeConfig::default()
            },
            input_mapping: None,
            output_variable: None,
            next: None,
        }
    }

    fn deps() -> Arc<Dependencies> {
        Arc::new(Dependencies::new())
    }

    #[tokio::test]
    async fn test_start_copies_trigger_input() {
        let node = make_node(NodeType::Start, Map::new());
        let mut state = ProcessState::default();
        let mut input = Map::new();
        input.insert("x".to_string(), json!("hello"));
        input.insert("items".to_string(), json!([1, 2]));
        let ctx = ProcessContext::new("e1").with_trigger("manual", input);

        let executor = StartExecutor::new(deps());
        let result = executor.execute(&node, &mut state, &ctx).await;

        assert!(result.is_success());
        assert_eq!(state.get("x"), Some(&json!("hello")));
        assert_eq!(state.get("items"), Some(&json!([1, 2])));
    }

    #[tokio::test]
    async fn test_start_applies_input_mapping() {
        let mut node = make_node(NodeType::Start, Map::new());
        let mut mapping = Map::new();
        mapping.insert("amount".to_string(), json!("{{ total }}"));
        node.input_mapping = Some(mapping);

        let mut state = ProcessState::default();
        let mut input = Map::new();
        input.insert("total".to_string(), json!(42));
        input.insert("noise".to_string(), json!("ignored"));
        let ctx = ProcessContext::new("e1").with_trigger("manual", input);

        let executor = StartExecutor::new(deps());
        executor.execute(&node, &mut state, &ctx).await;

        assert_eq!(state.get("amount"), Some(&json!(42)));
        assert!(state.get("noise").is_none());
    }

    #[tokio::test]
    async fn test_end_single_variable_output() {
        let mut type_config = Map::new();
        type_config.insert("output".to_string(), json!("{{y}}"));
        let node = make_node(NodeType::End, type_config);

        let mut state = ProcessState::default();
        state.set("y", json!("hello world"), "ai");

        let executor = EndExecutor::new(deps());
        let result = executor
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.output, Some(json!("hello world")));
    }

    #[tokio::test]
    async fn test_end_field_map_output() {
        let mut type_config = Map::new();
        type_config.insert(
            "output".to_string(),
            json!({"answer": "{{y}}", "fixed": 1}),
        );
        let node = make_node(NodeType::End, type_config);

        let mut state = ProcessState::default();
        state.set("y", json!(7), "work");

        let executor = EndExecutor::new(deps());
        let result = executor
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.output, Some(json!({"answer": 7, "fixed": 1})));
    }

    #[tokio::test]
    async fn test_end_default_output_masks_sensitive() {
        let node = make_node(NodeType::End, Map::new());
        let mut state = ProcessState::new(Map::new(), vec!["token".to_string()]);
        state.set("token", json!("secret-value"), "start");
        state.set("visible", json!("ok"), "start");

        let executor = EndExecutor::new(deps());
        let result = executor
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        let output = result.output.unwrap();
        assert_eq!(output["visible"], json!("ok"));
        assert_ne!(output["token"], json!("secret-value"));
    }

    #[tokio::test]
    async fn test_merge_object_strategy() {
        let mut type_config = Map::new();
        type_config.insert("strategy".to_string(), json!("object"));
        type_config.insert("source_nodes".to_string(), json!(["x", "y"]));
        let node = make_node(NodeType::Merge, type_config);

        let mut state = ProcessState::default();
        state.mark_completed("x", json!({"a": 1}));
        state.mark_completed("y", json!({"b": 2}));

        let executor = MergeExecutor::new(deps());
        let result = executor
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.output, Some(json!({"a": 1, "b": 2})));
        assert_eq!(result.variables_update["merged_results"], json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn test_merge_concat_strategy() {
        let mut type_config = Map::new();
        type_config.insert("strategy".to_string(), json!("concat"));
        type_config.insert("source_nodes".to_string(), json!(["x", "y"]));
        let node = make_node(NodeType::Merge, type_config);

        let mut state = ProcessState::default();
        state.mark_completed("x", json!([1, 2]));
        state.mark_completed("y", json!(3));

        let executor = MergeExecutor::new(deps());
        let result = executor
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.output, Some(json!([1, 2, 3])));
    }
}
