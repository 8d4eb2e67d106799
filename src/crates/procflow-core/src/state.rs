//! Per-execution runtime state
//!
//! [`ProcessState`] is the single mutable container an execution owns:
//! variables, completion bookkeeping, node outputs, loop and parallel frames,
//! and the checkpoint snapshot that makes the whole thing durable.
//!
//! # Design
//!
//! - **Attributed updates** - every variable change records who made it
//!   (`changed_by`: a node id or `"resume"`), building the audit trail the
//!   persistence layer stores as `variables_before`/`variables_after`.
//! - **Hidden counters** - engine-internal counters (WHILE iteration counts)
//!   live in a separate map that checkpoints round-trip but expressions and
//!   exports never see.
//! - **Sensitive masking** - variables declared sensitive keep their real
//!   values in memory and in resumable checkpoints; every externally
//!   observable payload goes through [`ProcessState::masked_variables`] or
//!   [`ProcessState::mask_text`], which replace the values with a redaction
//!   marker.
//! - **Copy-on-write branches** - parallel branches clone the state at
//!   fan-out ([`ProcessState::branch_snapshot`]) and are reconciled at merge,
//!   so sibling writes are invisible to each other mid-flight.

use crate::expression::{self, ExpressionError, VarScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Marker substituted for sensitive values in exported payloads
pub const REDACTED: &str = "***REDACTED***";

/// One attributed variable change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableChange {
    pub name: String,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

/// An active for-each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub items: Vec<Value>,
    pub item_var: String,
    pub index_var: String,
    pub index: usize,
}

impl LoopFrame {
    pub fn current_item(&self) -> Option<&Value> {
        self.items.get(self.index)
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.items.len()
    }
}

/// Tracking for one PARALLEL fan-out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelFrame {
    /// Branches as configured: each a list of node ids
    pub branches: Vec<Vec<String>>,
    /// Branch indexes that finished
    pub completed: Vec<usize>,
    /// Per-branch results, by branch index
    pub results: Map<String, Value>,
}

/// Mutable state for a single process execution
#[derive(Debug, Clone, Default)]
pub struct ProcessState {
    variables: Map<String, Value>,
    sensitive_variables: HashSet<String>,
    completed_nodes: Vec<String>,
    skipped_nodes: Vec<String>,
    node_outputs: Map<String, Value>,
    current_node_id: Option<String>,
    loop_frames: Vec<LoopFrame>,
    parallel_frames: Map<String, Value>,
    /// Engine-internal counters, outside the user-visible namespace
    counters: Map<String, Value>,
    change_log: Vec<VariableChange>,
}

impl ProcessState {
    /// Fresh state seeded with initial variables and sensitive names
    pub fn new(
        initial_variables: Map<String, Value>,
        sensitive_variables: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            variables: initial_variables,
            sensitive_variables: sensitive_variables.into_iter().collect(),
            ..Self::default()
        }
    }

    // ----- variables ------------------------------------------------------

    /// Read a variable
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Set a variable, recording attribution
    pub fn set(&mut self, name: impl Into<String>, value: Value, changed_by: &str) {
        let name = name.into();
        self.change_log.push(VariableChange {
            name: name.clone(),
            changed_by: changed_by.to_string(),
            changed_at: Utc::now(),
        });
        self.variables.insert(name, value);
    }

    /// Remove a variable, recording attribution
    pub fn delete(&mut self, name: &str, changed_by: &str) {
        if self.variables.remove(name).is_some() {
            self.change_log.push(VariableChange {
                name: name.to_string(),
                changed_by: changed_by.to_string(),
                changed_at: Utc::now(),
            });
        }
    }

    /// Apply a bulk update with a single attribution
    pub fn update(&mut self, updates: &Map<String, Value>, changed_by: &str) {
        for (name, value) in updates {
            self.set(name.clone(), value.clone(), changed_by);
        }
    }

    /// All variables (real values; do not export directly)
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// The attributed change log
    pub fn change_log(&self) -> &[VariableChange] {
        &self.change_log
    }

    /// Mark a name as sensitive
    pub fn mark_sensitive(&mut self, name: impl Into<String>) {
        self.sensitive_variables.insert(name.into());
    }

    pub fn sensitive_names(&self) -> &HashSet<String> {
        &self.sensitive_variables
    }

    // ----- expression evaluation -----------------------------------------

    /// Evaluate an expression (bare or templated) to a value
    pub fn evaluate(&self, source: &str) -> Result<Value, ExpressionError> {
        expression::evaluate_or_interpolate(source, self)
    }

    /// Evaluate an expression to a boolean
    pub fn evaluate_condition(&self, source: &str) -> Result<bool, ExpressionError> {
        expression::evaluate_condition(source, self)
    }

    /// Replace `{{ expr }}` occurrences in a string
    pub fn interpolate_string(&self, source: &str) -> Result<String, ExpressionError> {
        expression::interpolate(source, self)
    }

    /// Interpolate recursively through objects, arrays and strings
    pub fn interpolate_value(&self, value: &Value) -> Result<Value, ExpressionError> {
        Ok(match value {
            Value::String(s) => expression::evaluate_or_interpolate(s, self)?,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.interpolate_value(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate_value(v)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    // ----- completion bookkeeping ----------------------------------------

    /// Record a node as completed and store its output
    pub fn mark_completed(&mut self, node_id: impl Into<String>, output: Value) {
        let node_id = node_id.into();
        self.node_outputs.insert(node_id.clone(), output);
        self.completed_nodes.push(node_id);
    }

    /// Record a node as skipped
    pub fn mark_skipped(&mut self, node_id: impl Into<String>) {
        self.skipped_nodes.push(node_id.into());
    }

    pub fn completed_nodes(&self) -> &[String] {
        &self.completed_nodes
    }

    pub fn skipped_nodes(&self) -> &[String] {
        &self.skipped_nodes
    }

    /// Whether a node already completed (used for resume idempotence)
    pub fn is_completed(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|id| id == node_id)
    }

    /// Output of a previously completed node (MERGE reads these)
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    pub fn set_current_node(&mut self, node_id: impl Into<String>) {
        self.current_node_id = Some(node_id.into());
    }

    pub fn clear_current_node(&mut self) {
        self.current_node_id = None;
    }

    pub fn current_node(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    // ----- hidden counters ------------------------------------------------

    /// Read an engine-internal counter
    pub fn counter(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Set an engine-internal counter
    pub fn set_counter(&mut self, key: impl Into<String>, value: u64) {
        self.counters.insert(key.into(), json!(value));
    }

    /// Drop an engine-internal counter
    pub fn clear_counter(&mut self, key: &str) {
        self.counters.remove(key);
    }

    // ----- loop frames ----------------------------------------------------

    /// Enter a for-each loop
    pub fn push_loop(&mut self, items: Vec<Value>, item_var: &str, index_var: &str) {
        self.loop_frames.push(LoopFrame {
            items,
            item_var: item_var.to_string(),
            index_var: index_var.to_string(),
            index: 0,
        });
    }

    /// Publish the current loop item and index as variables
    pub fn set_loop_item(&mut self, changed_by: &str) {
        let Some(frame) = self.loop_frames.last() else {
            return;
        };
        let item = frame.current_item().cloned().unwrap_or(Value::Null);
        let item_var = frame.item_var.clone();
        let index_var = frame.index_var.clone();
        let index = frame.index;
        self.set(item_var, item, changed_by);
        self.set(index_var, json!(index), changed_by);
    }

    /// Advance the innermost loop; returns false when exhausted
    pub fn advance_loop(&mut self) -> bool {
        match self.loop_frames.last_mut() {
            Some(frame) => {
                frame.index += 1;
                !frame.is_exhausted()
            }
            None => false,
        }
    }

    /// Leave the innermost loop, removing its published variables
    pub fn pop_loop(&mut self, changed_by: &str) {
        if let Some(frame) = self.loop_frames.pop() {
            self.delete(&frame.item_var, changed_by);
            self.delete(&frame.index_var, changed_by);
        }
    }

    pub fn current_loop(&self) -> Option<&LoopFrame> {
        self.loop_frames.last()
    }

    // ----- parallel frames ------------------------------------------------

    /// Start tracking a PARALLEL fan-out
    pub fn start_parallel(&mut self, node_id: &str, branches: Vec<Vec<String>>) {
        let frame = ParallelFrame {
            branches,
            ..ParallelFrame::default()
        };
        self.parallel_frames
            .insert(node_id.to_string(), serde_json::to_value(frame).unwrap_or(Value::Null));
    }

    /// Record one branch as complete with its result
    pub fn complete_branch(&mut self, node_id: &str, branch_index: usize, result: Value) {
        if let Some(mut frame) = self.parallel_frame(node_id) {
            if !frame.completed.contains(&branch_index) {
                frame.completed.push(branch_index);
            }
            frame.results.insert(branch_index.to_string(), result);
            self.parallel_frames.insert(
                node_id.to_string(),
                serde_json::to_value(frame).unwrap_or(Value::Null),
            );
        }
    }

    /// Current frame for a PARALLEL node, if any
    pub fn parallel_frame(&self, node_id: &str) -> Option<ParallelFrame> {
        self.parallel_frames
            .get(node_id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Drop the frame once merged
    pub fn finish_parallel(&mut self, node_id: &str) {
        self.parallel_frames.remove(node_id);
    }

    /// Snapshot for a branch: full clone with private bookkeeping reset
    pub fn branch_snapshot(&self) -> ProcessState {
        let mut snapshot = self.clone();
        snapshot.change_log.clear();
        snapshot
    }

    /// Pull a finished branch's effects back into the parent.
    ///
    /// Variable reconciliation is last-write-wins in call order; node outputs
    /// and completion trails append.
    pub fn absorb_branch(&mut self, branch: ProcessState, changed_by: &str) {
        for change in &branch.change_log {
            if let Some(value) = branch.variables.get(&change.name) {
                self.set(change.name.clone(), value.clone(), changed_by);
            } else {
                self.delete(&change.name, changed_by);
            }
        }
        for node_id in branch.completed_nodes {
            if !self.completed_nodes.contains(&node_id) {
                let output = branch
                    .node_outputs
                    .get(&node_id)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.mark_completed(node_id, output);
            }
        }
        for node_id in branch.skipped_nodes {
            if !self.skipped_nodes.contains(&node_id) {
                self.skipped_nodes.push(node_id);
            }
        }
    }

    // ----- checkpointing --------------------------------------------------

    /// Full-fidelity snapshot sufficient to resume this execution.
    ///
    /// Contains real variable values (the checkpoint is what resume restores
    /// from); use [`Self::masked_variables`] for anything leaving the system.
    pub fn create_checkpoint(&self) -> Value {
        let mut sensitive: Vec<&String> = self.sensitive_variables.iter().collect();
        sensitive.sort();
        json!({
            "variables": self.variables,
            "sensitive_variables": sensitive,
            "completed_nodes": self.completed_nodes,
            "skipped_nodes": self.skipped_nodes,
            "node_outputs": self.node_outputs,
            "current_node_id": self.current_node_id,
            "loop_frames": self.loop_frames,
            "parallel_frames": self.parallel_frames,
            "counters": self.counters,
        })
    }

    /// Restore from a checkpoint produced by [`Self::create_checkpoint`]
    pub fn restore_checkpoint(&mut self, checkpoint: &Value) {
        if let Some(vars) = checkpoint.get("variables").and_then(Value::as_object) {
            self.variables = vars.clone();
        }
        if let Some(names) = checkpoint
            .get("sensitive_variables")
            .and_then(Value::as_array)
        {
            self.sensitive_variables = names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(nodes) = checkpoint.get("completed_nodes").and_then(Value::as_array) {
            self.completed_nodes = nodes
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(nodes) = checkpoint.get("skipped_nodes").and_then(Value::as_array) {
            self.skipped_nodes = nodes
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(outputs) = checkpoint.get("node_outputs").and_then(Value::as_object) {
            self.node_outputs = outputs.clone();
        }
        self.current_node_id = checkpoint
            .get("current_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(frames) = checkpoint.get("loop_frames") {
            self.loop_frames = serde_json::from_value(frames.clone()).unwrap_or_default();
        }
        if let Some(frames) = checkpoint.get("parallel_frames").and_then(Value::as_object) {
            self.parallel_frames = frames.clone();
        }
        if let Some(counters) = checkpoint.get("counters").and_then(Value::as_object) {
            self.counters = counters.clone();
        }
    }

    // ----- sensitive masking ----------------------------------------------

    /// Variables with sensitive values replaced by the redaction marker
    pub fn masked_variables(&self) -> Map<String, Value> {
        let mut masked = self.variables.clone();
        for name in &self.sensitive_variables {
            if masked.contains_key(name) {
                masked.insert(name.clone(), json!(REDACTED));
            }
        }
        masked
    }

    /// Scrub occurrences of sensitive variable *values* from a string.
    ///
    /// Applied to business messages, logs, and any other text that leaves
    /// the engine.
    pub fn mask_text(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for name in &self.sensitive_variables {
            if let Some(value) = self.variables.get(name) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !rendered.is_empty() {
                    masked = masked.replace(&rendered, REDACTED);
                }
            }
        }
        masked
    }

    /// Mask a value tree: sensitive variable values are scrubbed wherever
    /// they appear as strings
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => json!(self.mask_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.mask_value(v));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}

impl VarScope for ProcessState {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(pairs: &[(&str, Value)]) -> ProcessState {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ProcessState::new(vars, Vec::new())
    }

    #[test]
    fn test_set_records_attribution() {
        let mut state = state_with(&[]);
        state.set("x", json!(1), "node-a");
        state.set("x", json!(2), "node-b");

        assert_eq!(state.get("x"), Some(&json!(2)));
        assert_eq!(state.change_log().len(), 2);
        assert_eq!(state.change_log()[1].changed_by, "node-b");
    }

    #[test]
    fn test_interpolation_through_state() {
        let state = state_with(&[("user", json!({"name": "Ada"}))]);
        assert_eq!(
            state.interpolate_string("hello {{user.name}}").unwrap(),
            "hello Ada"
        );
        assert_eq!(
            state
                .interpolate_value(&json!({"greeting": "hi {{user.name}}", "n": 1}))
                .unwrap(),
            json!({"greeting": "hi Ada", "n": 1})
        );
    }

    #[test]
    fn test_loop_frame_lifecycle() {
        let mut state = state_with(&[]);
        state.push_loop(vec![json!("a"), json!("b")], "item", "index");
        state.set_loop_item("loop-1");
        assert_eq!(state.get("item"), Some(&json!("a")));
        assert_eq!(state.get("index"), Some(&json!(0)));

        assert!(state.advance_loop());
        state.set_loop_item("loop-1");
        assert_eq!(state.get("item"), Some(&json!("b")));

        assert!(!state.advance_loop());
        state.pop_loop("loop-1");
        assert!(state.get("item").is_none());
        assert!(state.current_loop().is_none());
    }

    #[test]
    fn test_parallel_frame_tracking() {
        let mut state = state_with(&[]);
        state.start_parallel("par", vec![vec!["x".into()], vec!["y".into()]]);
        state.complete_branch("par", 0, json!({"a": 1}));
        state.complete_branch("par", 1, json!({"b": 2}));

        let frame = state.parallel_frame("par").unwrap();
        assert_eq!(frame.completed.len(), 2);
        assert_eq!(frame.results["0"], json!({"a": 1}));

        state.finish_parallel("par");
        assert!(state.parallel_frame("par").is_none());
    }

    #[test]
    fn test_branch_isolation_and_absorb() {
        let mut parent = state_with(&[("shared", json!("before"))]);
        let mut branch = parent.branch_snapshot();

        branch.set("shared", json!("branch-write"), "x");
        branch.mark_completed("x", json!({"out": 1}));

        // Parent unaffected until absorb
        assert_eq!(parent.get("shared"), Some(&json!("before")));

        parent.absorb_branch(branch, "par");
        assert_eq!(parent.get("shared"), Some(&json!("branch-write")));
        assert_eq!(parent.node_output("x"), Some(&json!({"out": 1})));
        assert!(parent.is_completed("x"));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut state = ProcessState::new(
            [("k".to_string(), json!("v"))].into_iter().collect(),
            vec!["secret".to_string()],
        );
        state.set("secret", json!("hunter2"), "start");
        state.mark_completed("start", json!({"started": true}));
        state.mark_skipped("optional");
        state.set_current_node("work");
        state.push_loop(vec![json!(1), json!(2)], "item", "i");
        state.set_counter("while_w_count", 3);
        state.start_parallel("par", vec![vec!["a".into()]]);

        let checkpoint = state.create_checkpoint();
        let mut restored = ProcessState::default();
        restored.restore_checkpoint(&checkpoint);

        assert_eq!(restored.variables(), state.variables());
        assert_eq!(restored.completed_nodes(), state.completed_nodes());
        assert_eq!(restored.skipped_nodes(), state.skipped_nodes());
        assert_eq!(restored.current_node(), Some("work"));
        assert_eq!(restored.current_loop(), state.current_loop());
        assert_eq!(restored.parallel_frame("par"), state.parallel_frame("par"));
        assert_eq!(restored.counter("while_w_count"), 3);
        assert!(restored.sensitive_names().contains("secret"));
    }

    #[test]
    fn test_masking() {
        let mut state = ProcessState::new(Map::new(), vec!["api_key".to_string()]);
        state.set("api_key", json!("sk-12345"), "start");
        state.set("visible", json!("plain"), "start");

        let masked = state.masked_variables();
        assert_eq!(masked["api_key"], json!(REDACTED));
        assert_eq!(masked["visible"], json!("plain"));

        assert_eq!(
            state.mask_text("failed calling api with sk-12345"),
            format!("failed calling api with {REDACTED}")
        );
        assert_eq!(
            state.mask_value(&json!({"msg": "key sk-12345 invalid"})),
            json!({"msg": format!("key {REDACTED} invalid")})
        );
    }

    #[test]
    fn test_counters_invisible_to_expressions() {
        let mut state = state_with(&[]);
        state.set_counter("hidden", 7);
        assert_eq!(state.evaluate("{{hidden}}").unwrap(), Value::Null);
        assert!(!state.masked_variables().contains_key("hidden"));
    }
}
