//! Data executors: TRANSFORM, VALIDATE, FILTER, MAP, AGGREGATE

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::Dependencies;
use crate::error::{ErrorCategory, ExecutionError};
use crate::executor::{
    config_array, config_bool, config_map, config_str, config_string_or, NodeExecutor,
};
use crate::result::NodeResult;
use crate::state::ProcessState;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Read the node's input: an expression, or all variables when absent
fn resolve_input(node: &ProcessNode, state: &ProcessState) -> Result<Value, ExecutionError> {
    match config_str(node, "input_expression") {
        Some(expr) if !expr.is_empty() => state.evaluate(expr).map_err(|e| {
            ExecutionError::validation_error(format!("Failed to get input: {e}"))
                .with_source_node(&node.id)
        }),
        _ => Ok(Value::Object(state.variables().clone())),
    }
}

/// Coerce a value to the array the sequence executors operate on
fn as_item_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

// ----- TRANSFORM ----------------------------------------------------------

/// General-purpose data reshaping
///
/// Strategies: `map` (build an object from expressions), `rename`, `pick`,
/// `omit`, `flatten`, `merge` (combine several sources), `script` (run the
/// SCRIPT sandbox with `data` bound to the input).
pub struct TransformExecutor;

impl TransformExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }

    fn transform_map(
        data: &Value,
        mapping: &Map<String, Value>,
        state: &ProcessState,
    ) -> Map<String, Value> {
        let mut result = Map::new();
        for (target_key, source) in mapping {
            let value = match source {
                Value::String(expr) if expr.contains("{{") => {
                    state.evaluate(expr).unwrap_or(Value::Null)
                }
                Value::String(field) => match data {
                    Value::Object(map) if map.contains_key(field) => map[field].clone(),
                    _ => state.evaluate(field).unwrap_or(Value::Null),
                },
                other => other.clone(),
            };
            result.insert(target_key.clone(), value);
        }
        result
    }

    fn transform_rename(data: &Value, mapping: &Map<String, Value>) -> Value {
        let Value::Object(map) = data else {
            return data.clone();
        };
        let mut result = Map::new();
        for (key, value) in map {
            let new_key = mapping
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string();
            result.insert(new_key, value.clone());
        }
        Value::Object(result)
    }

    fn transform_pick(data: &Value, fields: &[String]) -> Value {
        let Value::Object(map) = data else {
            return data.clone();
        };
        Value::Object(
            map.iter()
                .filter(|(k, _)| fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn transform_omit(data: &Value, fields: &[String]) -> Value {
        let Value::Object(map) = data else {
            return data.clone();
        };
        Value::Object(
            map.iter()
                .filter(|(k, _)| !fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn transform_flatten(data: &Value) -> Value {
        let Value::Array(items) = data else {
            return data.clone();
        };
        let mut result = Vec::new();
        for item in items {
            match item {
                Value::Array(nested) => result.extend(nested.clone()),
                other => result.push(other.clone()),
            }
        }
        Value::Array(result)
    }

    fn transform_merge(sources: &[&Value], state: &ProcessState) -> Value {
        let mut result = Map::new();
        for source in sources {
            if let Some(expr) = source.as_str() {
                if let Ok(Value::Object(map)) = state.evaluate(expr) {
                    result.extend(map);
                }
            }
        }
        Value::Object(result)
    }
}

#[async_trait]
impl NodeExecutor for TransformExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let transform_type = config_string_or(node, "transform_type", "map");
        let mapping = config_map(node, "mapping");

        let mut logs = vec![format!("Executing {transform_type} transform")];

        let input = match resolve_input(node, state) {
            Ok(input) => input,
            Err(error) => return NodeResult::failure(error).with_logs(logs),
        };

        let fields: Vec<String> = config_array(node, "fields")
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect();

        let result = match transform_type.as_str() {
            "map" => Value::Object(Self::transform_map(&input, &mapping, state)),
            "rename" => Self::transform_rename(&input, &mapping),
            "pick" => Self::transform_pick(&input, &fields),
            "omit" => Self::transform_omit(&input, &fields),
            "flatten" => Self::transform_flatten(&input),
            "merge" => {
                let sources = config_array(node, "sources");
                Self::transform_merge(&sources, state)
            }
            "script" => {
                let script = config_string_or(node, "script", "");
                let mut inputs = Map::new();
                inputs.insert("data".to_string(), input);
                match super::task::ScriptExecutor::run_for_transform(&script, inputs) {
                    Ok(value) => value,
                    Err(error) => {
                        return NodeResult::failure(error.with_source_node(&node.id))
                            .with_logs(logs);
                    }
                }
            }
            other => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!("Unknown transform type: {other}"))
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };

        logs.push("Transform complete".to_string());

        let mut node_result = NodeResult::success(result.clone()).with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            node_result = node_result.with_variable(output_variable.clone(), result);
        }
        node_result
    }
}

// ----- VALIDATE -----------------------------------------------------------

/// Data validation by rules, a boolean expression, or a JSON schema
///
/// With `fail_on_invalid` unset the node succeeds and reports
/// `{is_valid, errors, data}`; set, invalid data becomes a
/// `VALIDATION_FAILED` business-logic failure.
pub struct ValidateExecutor;

impl ValidateExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }

    fn validate_rules(
        data: &Value,
        rules: &[&Value],
        state: &mut ProcessState,
    ) -> (bool, Vec<Value>) {
        let mut errors = Vec::new();

        for rule in rules {
            let field = rule.get("field").and_then(Value::as_str);
            let rule_type = rule
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("required");
            let message = rule.get("message").and_then(Value::as_str);
            let rule_value = rule.get("value");

            let value = match field {
                Some(field) => data.get(field).cloned().unwrap_or(Value::Null),
                None => data.clone(),
            };

            let valid = match rule_type {
                "required" => !value.is_null() && value != json!(""),
                "not_empty" => crate::expression::truthy(&value),
                "min_length" => {
                    let min = rule_value.and_then(Value::as_u64).unwrap_or(0) as usize;
                    value
                        .as_str()
                        .map(|s| s.chars().count() >= min)
                        .unwrap_or(false)
                }
                "max_length" => {
                    let max = rule_value.and_then(Value::as_u64).unwrap_or(0) as usize;
                    value
                        .as_str()
                        .map(|s| s.chars().count() <= max)
                        .unwrap_or(true)
                }
                "min" => {
                    let min = rule_value.and_then(Value::as_f64).unwrap_or(0.0);
                    value.as_f64().map(|v| v >= min).unwrap_or(false)
                }
                "max" => {
                    let max = rule_value.and_then(Value::as_f64).unwrap_or(0.0);
                    value.as_f64().map(|v| v <= max).unwrap_or(true)
                }
                "pattern" => {
                    let pattern = rule_value.and_then(Value::as_str).unwrap_or("");
                    match (Regex::new(pattern), value.as_str()) {
                        (Ok(re), Some(s)) => re.is_match(s),
                        _ => false,
                    }
                }
                "email" => {
                    let re =
                        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
                    value.as_str().map(|s| re.is_match(s)).unwrap_or(false)
                }
                "in" => rule_value
                    .and_then(Value::as_array)
                    .map(|allowed| allowed.contains(&value))
                    .unwrap_or(false),
                "expression" => {
                    let expr = rule_value.and_then(Value::as_str).unwrap_or("");
                    // Publish the field value for the expression, then remove it
                    state.set("_validate_value", value.clone(), "validation");
                    let expr = expr.replace("{{value}}", "{{_validate_value}}");
                    let outcome = state.evaluate_condition(&expr).unwrap_or(false);
                    state.delete("_validate_value", "validation");
                    outcome
                }
                _ => true,
            };

            if !valid {
                errors.push(json!({
                    "field": field,
                    "rule": rule_type,
                    "message": message.map(str::to_string).unwrap_or_else(|| format!(
                        "Validation failed for {}: {rule_type}",
                        field.unwrap_or("value")
                    )),
                }));
            }
        }

        (errors.is_empty(), errors)
    }

    #[cfg(feature = "json-validation")]
    fn validate_schema(data: &Value, schema: &Value) -> (bool, Vec<Value>) {
        match jsonschema::JSONSchema::compile(schema) {
            Ok(compiled) => {
                let errors: Vec<Value> = match compiled.validate(data) {
                    Ok(()) => Vec::new(),
                    Err(iter) => iter.map(|e| json!({ "message": e.to_string() })).collect(),
                };
                (errors.is_empty(), errors)
            }
            Err(e) => (false, vec![json!({ "message": format!("invalid schema: {e}") })]),
        }
    }

    #[cfg(not(feature = "json-validation"))]
    fn validate_schema(_data: &Value, _schema: &Value) -> (bool, Vec<Value>) {
        (
            false,
            vec![json!({
                "message": "schema validation requires the json-validation feature"
            })],
        )
    }
}

#[async_trait]
impl NodeExecutor for ValidateExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let validation_type = config_string_or(node, "validation_type", "rules");
        let fail_on_invalid = config_bool(node, "fail_on_invalid", false);

        let mut logs = vec![format!("Validating with {validation_type}")];

        let data = match resolve_input(node, state) {
            Ok(data) => data,
            Err(error) => return NodeResult::failure(error).with_logs(logs),
        };

        let (is_valid, errors) = match validation_type.as_str() {
            "rules" => {
                let rules = config_array(node, "rules");
                Self::validate_rules(&data, &rules, state)
            }
            "expression" => {
                let expression = config_string_or(node, "expression", "false");
                match state.evaluate_condition(&expression) {
                    Ok(true) => (true, Vec::new()),
                    Ok(false) => (
                        false,
                        vec![json!({ "message": "Expression evaluated to false" })],
                    ),
                    Err(e) => (false, vec![json!({ "message": format!("Validation error: {e}") })]),
                }
            }
            "schema" => {
                let schema = node.config_value("schema").cloned().unwrap_or(json!({}));
                Self::validate_schema(&data, &schema)
            }
            other => (
                false,
                vec![json!({ "message": format!("Unknown validation type: {other}") })],
            ),
        };

        logs.push(format!("Valid: {is_valid}, Errors: {}", errors.len()));

        let validation_result = json!({
            "is_valid": is_valid,
            "errors": errors,
            "data": data,
        });

        if !is_valid && fail_on_invalid {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::BusinessLogic,
                    "VALIDATION_FAILED",
                    format!("Validation failed with {} error(s)", errors.len()),
                )
                .with_details(json!({ "errors": errors }))
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        let mut result = NodeResult::success(validation_result.clone()).with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            result = result.with_variable(output_variable.clone(), validation_result);
        }
        result
    }
}

// ----- FILTER -------------------------------------------------------------

/// Keep sequence elements whose predicate holds
///
/// Publishes `item` (configurable) and `index` during evaluation, then
/// removes them.
pub struct FilterExecutor;

impl FilterExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for FilterExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let filter_expr = config_string_or(node, "filter_expression", "true");
        let item_var = config_string_or(node, "item_variable", "item");

        let mut logs = vec![format!("Filtering with expression: {filter_expr}")];

        let items = match resolve_input(node, state) {
            Ok(input) => as_item_list(input),
            Err(error) => return NodeResult::failure(error).with_logs(logs),
        };
        logs.push(format!("Input items: {}", items.len()));

        let mut kept = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            state.set(item_var.clone(), item.clone(), &node.id);
            state.set("index", json!(i), &node.id);

            match state.evaluate_condition(&filter_expr) {
                Ok(true) => kept.push(item),
                Ok(false) => {}
                Err(e) => logs.push(format!("Warning: Filter failed for item {i}: {e}")),
            }
        }
        state.delete(&item_var, &node.id);
        state.delete("index", &node.id);

        logs.push(format!("Output items: {}", kept.len()));

        let output = Value::Array(kept);
        let mut result = NodeResult::success(output.clone()).with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            result = result.with_variable(output_variable.clone(), output);
        }
        result
    }
}

// ----- MAP ----------------------------------------------------------------

/// Transform each sequence element through a field mapping
pub struct MapExecutor;

impl MapExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for MapExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let mapping = config_map(node, "mapping");
        let item_var = config_string_or(node, "item_variable", "item");

        let mut logs = vec!["Mapping array items".to_string()];

        let items = match resolve_input(node, state) {
            Ok(input) => as_item_list(input),
            Err(error) => return NodeResult::failure(error).with_logs(logs),
        };
        logs.push(format!("Input items: {}", items.len()));

        let mut mapped = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            if mapping.is_empty() {
                mapped.push(item);
                continue;
            }

            state.set(item_var.clone(), item.clone(), &node.id);
            state.set("index", json!(i), &node.id);

            let mut mapped_item = Map::new();
            let mut failed = false;
            for (target_key, source) in &mapping {
                let value = match source {
                    Value::String(expr) => match state.evaluate(expr) {
                        Ok(value) => value,
                        Err(e) => {
                            logs.push(format!("Warning: Map failed for item {i}: {e}"));
                            failed = true;
                            break;
                        }
                    },
                    other => other.clone(),
                };
                mapped_item.insert(target_key.clone(), value);
            }
            // Keep the original element when its mapping fails
            mapped.push(if failed { item } else { Value::Object(mapped_item) });
        }
        state.delete(&item_var, &node.id);
        state.delete("index", &node.id);

        logs.push(format!("Mapped {} items", mapped.len()));

        let output = Value::Array(mapped);
        let mut result = NodeResult::success(output.clone()).with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            result = result.with_variable(output_variable.clone(), output);
        }
        result
    }
}

// ----- AGGREGATE ----------------------------------------------------------

/// Reduce a sequence: count, sum, avg, min, max, first, last, group_by
pub struct AggregateExecutor;

impl AggregateExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeExecutor for AggregateExecutor {
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let operation = config_string_or(node, "operation", "count");
        let field = config_str(node, "field").map(str::to_string);
        let group_by = config_str(node, "group_by").map(str::to_string);

        let mut logs = vec![format!("Aggregating with {operation}")];

        let data = match resolve_input(node, state) {
            Ok(input) => as_item_list(input),
            Err(error) => return NodeResult::failure(error).with_logs(logs),
        };
        logs.push(format!("Input items: {}", data.len()));

        // Project to the named field when every element is an object
        let values: Vec<Value> = match &field {
            Some(field) if data.iter().all(Value::is_object) => data
                .iter()
                .filter_map(|item| item.get(field.as_str()))
                .filter(|v| !v.is_null())
                .cloned()
                .collect(),
            _ => data.clone(),
        };

        let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();

        let result = match operation.as_str() {
            "count" => json!(values.len()),
            "sum" => json!(numbers.iter().sum::<f64>()),
            "avg" => {
                if values.is_empty() {
                    json!(0)
                } else {
                    json!(numbers.iter().sum::<f64>() / values.len() as f64)
                }
            }
            "min" => numbers
                .iter()
                .cloned()
                .fold(None::<f64>, |acc, n| {
                    Some(acc.map_or(n, |a| a.min(n)))
                })
                .map(|n| json!(n))
                .unwrap_or(Value::Null),
            "max" => numbers
                .iter()
                .cloned()
                .fold(None::<f64>, |acc, n| {
                    Some(acc.map_or(n, |a| a.max(n)))
                })
                .map(|n| json!(n))
                .unwrap_or(Value::Null),
            "first" => values.first().cloned().unwrap_or(Value::Null),
            "last" => values.last().cloned().unwrap_or(Value::Null),
            "group_by" => {
                let Some(key_field) = group_by else {
                    return NodeResult::failure(
                        ExecutionError::validation_error("group_by requires a field")
                            .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                };
                let mut groups: Map<String, Value> = Map::new();
                for item in &data {
                    if let Value::Object(map) = item {
                        let key = map
                            .get(&key_field)
                            .map(crate::expression::eval::stringify)
                            .filter(|k| !k.is_empty())
                            .unwrap_or_else(|| "unknown".to_string());
                        groups
                            .entry(key)
                            .or_insert_with(|| json!([]))
                            .as_array_mut()
                            .unwrap()
                            .push(item.clone());
                    }
                }
                Value::Object(groups)
            }
            _ => Value::Array(values),
        };

        logs.push(format!("Result: {result}"));

        let mut node_result = NodeResult::success(result.clone()).with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            node_result = node_result.with_variable(output_variable.clone(), result);
        }
        node_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, NodeType};

    fn make_node(node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: "d1".to_string(),
            node_type,
            name: "data".to_string(),
            config: NodeConfig {
                type_config: type_config.as_object().cloned().unwrap_or_default(),
                ..NodeConfig::default()
            },
            input_mapping: None,
            output_variable: Some("out".to_string()),
            next: None,
        }
    }

    fn deps() -> Arc<Dependencies> {
        Arc::new(Dependencies::new())
    }

    fn ctx() -> ProcessContext {
        ProcessContext::new("e1")
    }

    #[tokio::test]
    async fn test_transform_map() {
        let node = make_node(
            NodeType::Transform,
            json!({
                "transform_type": "map",
                "input_expression": "{{order}}",
                "mapping": {"id": "{{order.id}}", "doubled": "{{order.qty * 2}}"}
            }),
        );
        let mut state = ProcessState::default();
        state.set("order", json!({"id": "o1", "qty": 3}), "start");

        let result = TransformExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!({"id": "o1", "doubled": 6})));
    }

    #[tokio::test]
    async fn test_transform_pick_omit_rename_flatten() {
        let mut state = ProcessState::default();
        state.set("data", json!({"a": 1, "b": 2, "c": 3}), "start");

        let pick = make_node(
            NodeType::Transform,
            json!({"transform_type": "pick", "input_expression": "{{data}}", "fields": ["a", "c"]}),
        );
        let result = TransformExecutor::new(deps())
            .execute(&pick, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!({"a": 1, "c": 3})));

        let omit = make_node(
            NodeType::Transform,
            json!({"transform_type": "omit", "input_expression": "{{data}}", "fields": ["b"]}),
        );
        let result = TransformExecutor::new(deps())
            .execute(&omit, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!({"a": 1, "c": 3})));

        let rename = make_node(
            NodeType::Transform,
            json!({"transform_type": "rename", "input_expression": "{{data}}", "mapping": {"a": "alpha"}}),
        );
        let result = TransformExecutor::new(deps())
            .execute(&rename, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!({"alpha": 1, "b": 2, "c": 3})));

        state.set("nested", json!([[1, 2], 3, [4]]), "start");
        let flatten = make_node(
            NodeType::Transform,
            json!({"transform_type": "flatten", "input_expression": "{{nested}}"}),
        );
        let result = TransformExecutor::new(deps())
            .execute(&flatten, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!([1, 2, 3, 4])));
    }

    #[tokio::test]
    async fn test_transform_merge_sources() {
        let node = make_node(
            NodeType::Transform,
            json!({"transform_type": "merge", "sources": ["{{a}}", "{{b}}"]}),
        );
        let mut state = ProcessState::default();
        state.set("a", json!({"x": 1}), "start");
        state.set("b", json!({"y": 2}), "start");

        let result = TransformExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        assert_eq!(result.output, Some(json!({"x": 1, "y": 2})));
    }

    #[tokio::test]
    async fn test_validate_rules_soft_failure() {
        let node = make_node(
            NodeType::Validate,
            json!({
                "validation_type": "rules",
                "input_expression": "{{form}}",
                "rules": [
                    {"field": "email", "type": "email"},
                    {"field": "age", "type": "min", "value": 18},
                    {"field": "name", "type": "required"}
                ]
            }),
        );
        let mut state = ProcessState::default();
        state.set(
            "form",
            json!({"email": "not-an-email", "age": 17, "name": "Ada"}),
            "start",
        );

        let result = ValidateExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;

        assert!(result.is_success());
        let output = result.output.unwrap();
        assert_eq!(output["is_valid"], json!(false));
        assert_eq!(output["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_validate_fail_on_invalid() {
        let node = make_node(
            NodeType::Validate,
            json!({
                "validation_type": "rules",
                "input_expression": "{{form}}",
                "fail_on_invalid": true,
                "rules": [{"field": "name", "type": "required"}]
            }),
        );
        let mut state = ProcessState::default();
        state.set("form", json!({}), "start");

        let result = ValidateExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        assert_eq!(result.error.unwrap().code, "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_validate_expression_rule_with_value_placeholder() {
        let node = make_node(
            NodeType::Validate,
            json!({
                "validation_type": "rules",
                "input_expression": "{{form}}",
                "rules": [{"field": "qty", "type": "expression", "value": "{{value}} % 2 == 0"}]
            }),
        );
        let mut state = ProcessState::default();
        state.set("form", json!({"qty": 4}), "start");

        let result = ValidateExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        assert_eq!(result.output.unwrap()["is_valid"], json!(true));
        assert!(state.get("_validate_value").is_none());
    }

    #[tokio::test]
    async fn test_filter_publishes_and_cleans_item() {
        let node = make_node(
            NodeType::Filter,
            json!({
                "input_expression": "{{nums}}",
                "filter_expression": "{{item}} > 2"
            }),
        );
        let mut state = ProcessState::default();
        state.set("nums", json!([1, 2, 3, 4]), "start");

        let result = FilterExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;

        assert_eq!(result.output, Some(json!([3, 4])));
        assert!(state.get("item").is_none());
        assert!(state.get("index").is_none());
    }

    #[tokio::test]
    async fn test_map_field_mapping() {
        let node = make_node(
            NodeType::Map,
            json!({
                "input_expression": "{{people}}",
                "mapping": {"name": "{{item.name}}", "position": "{{index}}"}
            }),
        );
        let mut state = ProcessState::default();
        state.set(
            "people",
            json!([{"name": "a"}, {"name": "b"}]),
            "start",
        );

        let result = MapExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        assert_eq!(
            result.output,
            Some(json!([
                {"name": "a", "position": 0},
                {"name": "b", "position": 1}
            ]))
        );
    }

    #[tokio::test]
    async fn test_aggregate_operations() {
        let mut state = ProcessState::default();
        state.set(
            "orders",
            json!([
                {"amount": 10, "region": "eu"},
                {"amount": 20, "region": "us"},
                {"amount": 30, "region": "eu"}
            ]),
            "start",
        );

        for (operation, expected) in [
            ("count", json!(3)),
            ("sum", json!(60.0)),
            ("avg", json!(20.0)),
            ("min", json!(10.0)),
            ("max", json!(30.0)),
            ("first", json!(10)),
            ("last", json!(30)),
        ] {
            let node = make_node(
                NodeType::Aggregate,
                json!({
                    "input_expression": "{{orders}}",
                    "operation": operation,
                    "field": "amount"
                }),
            );
            let result = AggregateExecutor::new(deps())
                .execute(&node, &mut state, &ctx())
                .await;
            assert_eq!(result.output, Some(expected), "operation {operation}");
        }
    }

    #[tokio::test]
    async fn test_aggregate_group_by() {
        let node = make_node(
            NodeType::Aggregate,
            json!({
                "input_expression": "{{orders}}",
                "operation": "group_by",
                "group_by": "region"
            }),
        );
        let mut state = ProcessState::default();
        state.set(
            "orders",
            json!([
                {"id": 1, "region": "eu"},
                {"id": 2, "region": "us"},
                {"id": 3, "region": "eu"}
            ]),
            "start",
        );

        let result = AggregateExecutor::new(deps())
            .execute(&node, &mut state, &ctx())
            .await;
        let output = result.output.unwrap();
        assert_eq!(output["eu"].as_array().unwrap().len(), 2);
        assert_eq!(output["us"].as_array().unwrap().len(), 1);
    }
}
