//! Logic executors: CONDITION, SWITCH, LOOP, WHILE, PARALLEL, SUB_PROCESS
//!
//! These nodes steer execution rather than do work. LOOP, WHILE and PARALLEL
//! return *control information* (body nodes, branch starts, continuation
//! flags); the engine owns the actual iteration and fan-out so that frames
//! survive checkpoints.

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::Dependencies;
use crate::error::{ErrorCategory, ExecutionError};
use crate::executor::{
    config_array, config_bool, config_string_list, config_string_or, config_u64, NodeExecutor,
};
use crate::expression::ExpressionError;
use crate::result::NodeResult;
use crate::state::ProcessState;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Classify a condition-evaluation failure
///
/// A null operand means an earlier step did not produce the expected value -
/// not something the user can fix by editing this node. Anything else points
/// at the condition text itself.
fn condition_eval_failed(
    node: &ProcessNode,
    expression: &str,
    error: &ExpressionError,
) -> ExecutionError {
    let (business_message, is_fixable) = if error.is_null_operand() {
        (
            format!(
                "The decision step \"{}\" could not evaluate because a required value was \
                 missing or empty. This usually means an earlier step (like data extraction \
                 or AI analysis) did not produce the expected result. Please check the \
                 previous steps in the technical view.",
                node.name
            ),
            false,
        )
    } else {
        (
            format!(
                "The decision step \"{}\" encountered an error evaluating its rule. \
                 The condition configuration may need to be updated.",
                node.name
            ),
            true,
        )
    };

    ExecutionError::new(
        ErrorCategory::Validation,
        "CONDITION_EVAL_FAILED",
        format!("Failed to evaluate condition '{expression}': {error}"),
    )
    .with_business_message(business_message)
    .user_fixable(is_fixable)
    .with_details(json!({ "expression": expression, "error": error.to_string() }))
    .with_source_node(&node.id)
}

/// If/else branching on a single expression
///
/// Config: `expression`, `true_branch`, `false_branch`.
pub struct ConditionExecutor;

impl ConditionExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if node.id.is_empty() {
            return Some(ExecutionError::validation_error("Node ID is required"));
        }
        if config_string_or(node, "expression", "").is_empty() {
            return Some(ExecutionError::validation_error(
                "Condition expression is required",
            ));
        }
        let true_branch = config_string_or(node, "true_branch", "");
        let false_branch = config_string_or(node, "false_branch", "");
        if true_branch.is_empty() && false_branch.is_empty() {
            return Some(ExecutionError::validation_error(
                "At least one branch (true or false) must be defined",
            ));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let expression = config_string_or(node, "expression", "");
        let true_branch = config_string_or(node, "true_branch", "");
        let false_branch = config_string_or(node, "false_branch", "");

        let mut logs = vec![format!("Evaluating condition: {expression}")];

        let outcome = match state.evaluate_condition(&expression) {
            Ok(outcome) => outcome,
            Err(e) => {
                return NodeResult::failure(condition_eval_failed(node, &expression, &e))
                    .with_logs(logs);
            }
        };
        logs.push(format!("Condition result: {outcome}"));

        let (next_node, branch_name) = if outcome {
            (true_branch, "true")
        } else {
            (false_branch, "false")
        };
        logs.push(format!("Taking {branch_name} branch -> {next_node}"));

        if next_node.is_empty() {
            return NodeResult::failure(
                ExecutionError::validation_error(format!("No {branch_name} branch defined"))
                    .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        NodeResult::success(json!({ "condition_result": outcome, "branch": branch_name }))
            .with_next_node(next_node)
            .with_logs(logs)
    }
}

/// Multi-way branching: first matching case wins, `default` as fallback
///
/// Cases carry either a plain value (compared for equality against the
/// evaluated expression) or a nested boolean expression.
pub struct SwitchExecutor;

impl SwitchExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for SwitchExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "expression", "").is_empty() {
            return Some(ExecutionError::validation_error(
                "Switch expression is required",
            ));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let expression = config_string_or(node, "expression", "");
        let cases = config_array(node, "cases");
        let default_target = config_string_or(node, "default", "");

        let mut logs = vec![format!("Evaluating switch expression: {expression}")];

        let value = match state.evaluate(&expression) {
            Ok(value) => value,
            Err(e) => {
                return NodeResult::failure(condition_eval_failed(node, &expression, &e))
                    .with_logs(logs);
            }
        };
        logs.push(format!("Expression value: {value}"));

        for (i, case) in cases.iter().enumerate() {
            let case_condition = case.get("condition").or_else(|| case.get("value"));
            let case_target = case
                .get("target")
                .or_else(|| case.get("next"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(case_condition) = case_condition else {
                continue;
            };

            let matched = match case_condition {
                // Nested boolean expression, evaluated against the switch value
                Value::String(s) if s.contains("{{") => {
                    let full = format!("({expression}) {s}");
                    state.evaluate_condition(&full).unwrap_or_else(|e| {
                        logs.push(format!("Case {i} evaluation failed: {e}"));
                        false
                    })
                }
                literal => crate::nodes::loose_value_eq(&value, literal),
            };

            if matched {
                logs.push(format!("Matched case {i} -> {case_target}"));
                if case_target.is_empty() {
                    return NodeResult::failure(
                        ExecutionError::validation_error(format!(
                            "Case {i} matched but has no target"
                        ))
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                }
                return NodeResult::success(json!({ "matched_case": i, "value": value }))
                    .with_next_node(case_target)
                    .with_logs(logs);
            }
        }

        logs.push(format!("No case matched, using default: {default_target}"));
        if default_target.is_empty() {
            return NodeResult::failure(
                ExecutionError::validation_error("No case matched and no default defined")
                    .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        NodeResult::success(json!({ "matched_case": "default", "value": value }))
            .with_next_node(default_target)
            .with_logs(logs)
    }
}

/// For-each loop entry
///
/// Evaluates `items_expression`, primes the loop frame, and hands the body
/// node list to the engine. An empty collection short-circuits successfully
/// with `{iterations: 0, results: []}`.
pub struct LoopExecutor;

impl LoopExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let items_expr = config_string_or(node, "items_expression", "[]");
        let item_var = config_string_or(node, "item_variable", "item");
        let index_var = config_string_or(node, "index_variable", "index");
        let body_nodes = config_string_list(node, "body_nodes");
        let max_iterations = config_u64(node, "max_iterations", 1000) as usize;

        let mut logs = vec![format!("Starting loop with expression: {items_expr}")];

        let items = match state.evaluate(&items_expr) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => Vec::new(),
            Ok(other) => vec![other],
            Err(e) => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!("Failed to get loop items: {e}"))
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };
        logs.push(format!("Found {} items to iterate", items.len()));

        if items.len() > max_iterations {
            return NodeResult::failure(
                ExecutionError::validation_error(format!(
                    "Too many items ({}), max is {max_iterations}",
                    items.len()
                ))
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        if items.is_empty() {
            logs.push("Empty collection, skipping loop".to_string());
            return NodeResult::success(json!({ "iterations": 0, "results": [] })).with_logs(logs);
        }

        let total = items.len();
        state.push_loop(items, &item_var, &index_var);
        state.set_loop_item(&node.id);
        logs.push(format!("Loop initialized, first item set to {item_var}"));

        let mut result = NodeResult::success(json!({
            "is_loop_start": true,
            "total_items": total,
            "item_variable": item_var,
            "index_variable": index_var,
            "body_nodes": body_nodes,
        }))
        .with_logs(logs);
        if let Some(first) = body_nodes.first() {
            result = result.with_next_nodes(vec![first.clone()]);
        }
        result
    }
}

/// Conditional loop: re-evaluated by the engine before every iteration
///
/// The iteration counter lives in the state's hidden counter namespace, not
/// among user-visible variables.
pub struct WhileExecutor;

impl WhileExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for WhileExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let condition = config_string_or(node, "condition", "false");
        let body_nodes = config_string_list(node, "body_nodes");
        let max_iterations = config_u64(node, "max_iterations", 1000);

        let counter_key = format!("while_{}_count", node.id);
        let current_count = state.counter(&counter_key);

        let mut logs = vec![format!(
            "While iteration {}, condition: {condition}",
            current_count + 1
        )];

        if current_count >= max_iterations {
            return NodeResult::failure(
                ExecutionError::validation_error(format!(
                    "Max iterations ({max_iterations}) reached"
                ))
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        let should_continue = match state.evaluate_condition(&condition) {
            Ok(value) => value,
            Err(e) => {
                return NodeResult::failure(condition_eval_failed(node, &condition, &e))
                    .with_logs(logs);
            }
        };

        if should_continue {
            logs.push("Condition true, executing body".to_string());
            state.set_counter(&counter_key, current_count + 1);

            let mut result = NodeResult::success(json!({
                "iteration": current_count + 1,
                "continuing": true,
                "body_nodes": body_nodes,
            }))
            .with_logs(logs);
            if let Some(first) = body_nodes.first() {
                result = result.with_next_nodes(vec![first.clone()]);
            }
            result
        } else {
            logs.push("Condition false, exiting loop".to_string());
            state.clear_counter(&counter_key);

            NodeResult::success(json!({ "iteration": current_count, "continuing": false }))
                .with_logs(logs)
        }
    }
}

/// Parallel fan-out entry
///
/// Starts the parallel frame and returns each branch's first node; the
/// engine runs branches concurrently on state snapshots and reconciles at
/// the merge point.
pub struct ParallelExecutor;

impl ParallelExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let branches: Vec<Vec<String>> = config_array(node, "branches")
            .iter()
            .map(|branch| match branch {
                Value::Array(nodes) => nodes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::String(single) => vec![single.clone()],
                _ => Vec::new(),
            })
            .collect();
        let merge_strategy = config_string_or(node, "merge_strategy", "wait_all");
        let wait_count = config_u64(node, "wait_count", 0);
        let fail_fast = config_bool(node, "fail_fast", true);

        let mut logs = vec![
            format!("Starting parallel execution with {} branches", branches.len()),
            format!("Strategy: {merge_strategy}"),
        ];

        if branches.is_empty() {
            logs.push("No branches defined".to_string());
            return NodeResult::success(json!({ "branches_count": 0 })).with_logs(logs);
        }

        state.start_parallel(&node.id, branches.clone());

        let branch_starts: Vec<String> = branches
            .iter()
            .enumerate()
            .filter_map(|(i, branch)| {
                branch.first().map(|start| {
                    logs.push(format!("Branch {i}: starts with {start}"));
                    start.clone()
                })
            })
            .collect();

        NodeResult::success(json!({
            "is_parallel_start": true,
            "parallel_id": node.id,
            "branches": branches,
            "branch_starts": branch_starts,
            "merge_strategy": merge_strategy,
            "wait_count": wait_count,
            "fail_fast": fail_fast,
        }))
        .with_next_nodes(branch_starts)
        .with_logs(logs)
    }
}

/// Invoke another published process as a child execution
///
/// The executor only resolves configuration and the input map; the engine
/// interprets the `is_sub_process` output and performs the invocation
/// through the injected runner.
pub struct SubProcessExecutor;

impl SubProcessExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for SubProcessExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let process_id = config_string_or(node, "process_id", "");
        let input_mapping = crate::executor::config_map(node, "input_mapping");
        let wait_for_completion = config_bool(node, "wait_for_completion", true);
        let timeout_seconds = config_u64(node, "timeout_seconds", 3600);

        let mut logs = vec![format!("Sub-process invocation: process_id={process_id}")];

        if process_id.is_empty() {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Configuration,
                    "SUB_PROCESS_NO_ID",
                    "No process ID configured. Select a published process to run.",
                )
                .with_details(json!({ "node_id": node.id }))
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        // Resolve the input map from parent state
        let mut resolved_inputs = Map::new();
        for (child_key, parent_ref) in &input_mapping {
            let value = match parent_ref {
                Value::String(s) if s.contains("{{") => {
                    state.evaluate(s).unwrap_or(Value::Null)
                }
                other => other.clone(),
            };
            resolved_inputs.insert(child_key.clone(), value);
        }

        logs.push(format!(
            "Resolved inputs: {:?}",
            resolved_inputs.keys().collect::<Vec<_>>()
        ));
        logs.push(format!("Wait for completion: {wait_for_completion}"));

        NodeResult::success(json!({
            "is_sub_process": true,
            "sub_process_id": process_id,
            "sub_process_inputs": resolved_inputs,
            "wait_for_completion": wait_for_completion,
            "timeout_seconds": timeout_seconds,
        }))
        .with_logs(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, NodeType};

    fn make_node(node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: "n".to_string(),
            node_type,
            name: "decision".to_string(),
            config: NodeConfig {
                type_config: type_config.as_object().cloned().unwrap_or_default(),
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
    async fn test_condition_true_branch() {
        let node = make_node(
            NodeType::Condition,
            json!({"expression": "{{count}} > 10", "true_branch": "a", "false_branch": "b"}),
        );
        let mut state = ProcessState::default();
        state.set("count", json!(11), "start");

        let result = ConditionExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.next_node_id.as_deref(), Some("a"));
        assert_eq!(result.output.unwrap()["branch"], json!("true"));
    }

    #[tokio::test]
    async fn test_condition_missing_value_classified() {
        let node = make_node(
            NodeType::Condition,
            json!({"expression": "{{parsedData.totalAmount}} > 100", "true_branch": "a", "false_branch": "b"}),
        );
        let mut state = ProcessState::default();

        let result = ConditionExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_failure());
        let error = result.error.unwrap();
        assert_eq!(error.code, "CONDITION_EVAL_FAILED");
        assert!(!error.is_user_fixable);
        assert!(error.business_message.unwrap().contains("decision"));
    }

    #[test]
    fn test_condition_validate_requires_branch() {
        let node = make_node(NodeType::Condition, json!({"expression": "true"}));
        let error = ConditionExecutor::new(deps()).validate(&node).unwrap();
        assert!(error.message.contains("branch"));
    }

    #[tokio::test]
    async fn test_switch_value_case() {
        let node = make_node(
            NodeType::Switch,
            json!({
                "expression": "{{kind}}",
                "cases": [
                    {"value": "invoice", "target": "inv"},
                    {"value": "receipt", "target": "rec"}
                ],
                "default": "other"
            }),
        );
        let mut state = ProcessState::default();
        state.set("kind", json!("receipt"), "start");

        let result = SwitchExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.next_node_id.as_deref(), Some("rec"));
    }

    #[tokio::test]
    async fn test_switch_expression_case_and_default() {
        let node = make_node(
            NodeType::Switch,
            json!({
                "expression": "{{n}}",
                "cases": [{"condition": "> {{limit}}", "target": "big"}],
                "default": "small"
            }),
        );
        let mut state = ProcessState::default();
        state.set("n", json!(5), "start");
        state.set("limit", json!(10), "start");

        let result = SwitchExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.next_node_id.as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn test_switch_no_match_no_default_fails() {
        let node = make_node(
            NodeType::Switch,
            json!({"expression": "{{kind}}", "cases": [{"value": "x", "target": "t"}]}),
        );
        let mut state = ProcessState::default();
        state.set("kind", json!("y"), "start");

        let result = SwitchExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_loop_empty_collection_short_circuits() {
        let node = make_node(
            NodeType::Loop,
            json!({"items_expression": "{{list}}", "body_nodes": ["b"]}),
        );
        let mut state = ProcessState::default();
        state.set("list", json!([]), "start");

        let result = LoopExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!({"iterations": 0, "results": []})));
        assert!(result.next_node_ids.is_none());
        assert!(state.current_loop().is_none());
    }

    #[tokio::test]
    async fn test_loop_primes_frame_and_enters_body() {
        let node = make_node(
            NodeType::Loop,
            json!({"items_expression": "{{list}}", "body_nodes": ["b1", "b2"]}),
        );
        let mut state = ProcessState::default();
        state.set("list", json!(["x", "y"]), "start");

        let result = LoopExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.next_node_ids, Some(vec!["b1".to_string()]));
        assert_eq!(state.get("item"), Some(&json!("x")));
        assert_eq!(state.get("index"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_loop_max_iterations_exceeded() {
        let node = make_node(
            NodeType::Loop,
            json!({"items_expression": "{{list}}", "body_nodes": ["b"], "max_iterations": 2}),
        );
        let mut state = ProcessState::default();
        state.set("list", json!([1, 2, 3]), "start");

        let result = LoopExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_while_counter_hidden_and_exit() {
        let node = make_node(
            NodeType::While,
            json!({"condition": "{{n}} < 2", "body_nodes": ["b"]}),
        );
        let mut state = ProcessState::default();
        state.set("n", json!(0), "start");

        let result = WhileExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.output.as_ref().unwrap()["continuing"], json!(true));
        assert_eq!(state.counter("while_n_count"), 1);
        // Counter is not a user-visible variable
        assert!(state.get("while_n_count").is_none());

        state.set("n", json!(5), "body");
        let result = WhileExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.output.as_ref().unwrap()["continuing"], json!(false));
        assert_eq!(state.counter("while_n_count"), 0);
    }

    #[tokio::test]
    async fn test_parallel_returns_branch_starts() {
        let node = make_node(
            NodeType::Parallel,
            json!({"branches": [["x"], ["y", "y2"]]}),
        );
        let mut state = ProcessState::default();

        let result = ParallelExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(
            result.next_node_ids,
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert!(state.parallel_frame("n").is_some());
    }

    #[tokio::test]
    async fn test_sub_process_resolves_inputs() {
        let node = make_node(
            NodeType::SubProcess,
            json!({
                "process_id": "child-1",
                "input_mapping": {"amount": "{{total}}", "fixed": 5}
            }),
        );
        let mut state = ProcessState::default();
        state.set("total", json!(99), "start");

        let result = SubProcessExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        let output = result.output.unwrap();
        assert_eq!(output["is_sub_process"], json!(true));
        assert_eq!(output["sub_process_inputs"]["amount"], json!(99));
        assert_eq!(output["sub_process_inputs"]["fixed"], json!(5));
    }

    #[tokio::test]
    async fn test_sub_process_requires_id() {
        let node = make_node(NodeType::SubProcess, json!({}));
        let mut state = ProcessState::default();

        let result = SubProcessExecutor::new(deps())
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.error.unwrap().code, "SUB_PROCESS_NO_ID");
    }
}
