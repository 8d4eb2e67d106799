//! The process execution engine
//!
//! [`ProcessEngine`] drives a single execution of a [`ProcessDefinition`]:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  run loop                                                  │
//! │                                                            │
//! │  ┌─ quota check (max nodes, wall clock, cancellation)      │
//! │  ├─ resolve executor, validate                             │
//! │  ├─ execute_with_timeout ── execute_with_retry ── execute  │
//! │  ├─ waiting?  → checkpoint, return waiting result          │
//! │  ├─ failure?  → skip_on_error ? mark skipped : return      │
//! │  ├─ interpret control outputs:                             │
//! │  │    sub-process  → injected runner, adopt child output   │
//! │  │    loop start   → run body per item, pop frame          │
//! │  │    while        → body / re-evaluate until done         │
//! │  │    parallel     → branches on state snapshots, absorb   │
//! │  ├─ mark completed, apply variable updates, counters       │
//! │  ├─ periodic checkpoint                                    │
//! │  └─ select next node (END / directed / override / edges)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is stateless beyond the [`ProcessState`] it owns; everything
//! needed to continue after a pause lives in the checkpoint. `resume` is the
//! symmetric operation: restore state, merge the resume payload, mark the
//! waiting node completed, continue from its successor.
//!
//! Parallel branches run concurrently on copy-on-write snapshots of the
//! state; sibling writes are invisible to each other until the engine
//! absorbs finished branches back (last-write-wins in branch order) before
//! MERGE executes.

use crate::context::ProcessContext;
use crate::definition::{NodeType, ProcessDefinition, ProcessNode, ProcessSettings};
use crate::deps::{Dependencies, SubProcessRequest};
use crate::error::{ErrorCategory, ExecutionError};
use crate::event::{ProcessEvent, ProcessEventType};
use crate::executor::{execute_with_timeout, ExecutorRegistry, NodeExecutor};
use crate::nodes::task::PlausibilityCheck;
use crate::result::{ExecutionStatus, NodeResult, ProcessResult, WaitingKind};
use crate::state::ProcessState;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Callback for persisting checkpoints mid-run
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(
        &self,
        execution_id: &str,
        checkpoint: &Value,
        variables: &Map<String, Value>,
        completed_nodes: &[String],
    );
}

/// Engine tuning knobs
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Override the AI_TASK anti-hallucination thresholds
    pub plausibility: Option<PlausibilityCheck>,
}

/// Why the run loop stopped advancing
enum StepControl {
    Continue(Option<String>),
    Finished(ProcessResult),
}

/// Outcome of one branch of a PARALLEL fan-out
struct BranchOutcome {
    index: usize,
    state: ProcessState,
    last_output: Value,
    failed: Option<(String, ExecutionError)>,
    nodes_executed: u64,
    tokens_used: u64,
}

/// Drives a single process execution
pub struct ProcessEngine {
    definition: Arc<ProcessDefinition>,
    context: ProcessContext,
    deps: Arc<Dependencies>,
    registry: Arc<ExecutorRegistry>,
    state: ProcessState,
    execution_id: String,
    settings: ProcessSettings,
    nodes_executed: u64,
    total_tokens: u64,
    tool_calls: u64,
    ai_calls: u64,
    started_at: Option<Instant>,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    checkpoint_sink: Option<Arc<dyn CheckpointSink>>,
    cancel: Option<watch::Receiver<bool>>,
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ProcessEngine {
    /// Create an engine for a fresh execution
    pub fn new(
        definition: ProcessDefinition,
        context: ProcessContext,
        deps: Arc<Dependencies>,
    ) -> Self {
        let settings = definition.settings.clone();
        let state = ProcessState::new(
            definition.initial_variables(),
            definition.sensitive_variable_names(),
        );
        let execution_id = if context.execution_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            context.execution_id.clone()
        };
        Self {
            definition: Arc::new(definition),
            context,
            deps,
            registry: Arc::new(ExecutorRegistry::standard()),
            state,
            execution_id,
            settings,
            nodes_executed: 0,
            total_tokens: 0,
            tool_calls: 0,
            ai_calls: 0,
            started_at: None,
            events: None,
            checkpoint_sink: None,
            cancel: None,
            executors: HashMap::new(),
        }
    }

    /// Replace the executor registry
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Apply engine options
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        if let Some(plausibility) = options.plausibility {
            let mut registry = ExecutorRegistry::standard();
            registry.register(NodeType::AiTask, move |deps| {
                crate::nodes::task::AiTaskExecutor::with_plausibility(deps, plausibility.clone())
            });
            self.registry = Arc::new(registry);
        }
        self
    }

    /// Stream events to the given channel
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Persist checkpoints through the given sink
    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint_sink = Some(sink);
        self
    }

    /// Observe a cancellation signal
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Current checkpoint, including engine counters
    pub fn checkpoint(&self) -> Value {
        let mut checkpoint = self.state.create_checkpoint();
        if let Some(map) = checkpoint.as_object_mut() {
            map.insert("execution_id".to_string(), json!(self.execution_id));
            map.insert("nodes_executed".to_string(), json!(self.nodes_executed));
            map.insert("total_tokens".to_string(), json!(self.total_tokens));
            map.insert("tool_calls".to_string(), json!(self.tool_calls));
            map.insert("ai_calls".to_string(), json!(self.ai_calls));
        }
        checkpoint
    }

    /// Counters for the persistence layer
    pub fn metrics(&self) -> (u64, u64, u64, u64) {
        (
            self.nodes_executed,
            self.total_tokens,
            self.tool_calls,
            self.ai_calls,
        )
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    fn executor_for(&mut self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        if let Some(executor) = self.executors.get(&node_type) {
            return Some(executor.clone());
        }
        let executor = self.registry.create(node_type, self.deps.clone())?;
        self.executors.insert(node_type, executor.clone());
        Some(executor)
    }

    /// Node ids a control node's edges must skip: its body or branches
    fn control_exclusions(node: &ProcessNode) -> HashSet<String> {
        let mut exclude = HashSet::new();
        match node.node_type {
            NodeType::Loop | NodeType::While => {
                if let Some(body) = node.config_value("body_nodes").and_then(Value::as_array) {
                    exclude.extend(
                        body.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    );
                }
            }
            NodeType::Parallel => {
                if let Some(branches) = node.config_value("branches").and_then(Value::as_array) {
                    for branch in branches {
                        if let Some(nodes) = branch.as_array() {
                            exclude.extend(
                                nodes
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string),
                            );
                        }
                    }
                }
            }
            _ => {}
        }
        exclude
    }

    // ----- entry points ---------------------------------------------------

    /// Execute the process from its START node
    pub async fn execute(&mut self, trigger_input: Map<String, Value>) -> ProcessResult {
        self.started_at = Some(Instant::now());
        self.context.trigger_input = trigger_input;

        info!(
            execution_id = %self.execution_id,
            process = %self.definition.name,
            "starting process execution"
        );

        self.emit(ProcessEvent::new(
            ProcessEventType::ProcessStarted,
            json!({
                "execution_id": self.execution_id,
                "process_name": self.definition.name,
            }),
        ));

        let Some(start) = self.definition.get_start_node() else {
            return self.finish(ProcessResult::failure(
                ExecutionError::new(
                    ErrorCategory::Validation,
                    "NO_START_NODE",
                    "Process has no START node",
                ),
                &self.execution_id,
            ));
        };
        let start_id = start.id.clone();

        let result = self.run_loop(Some(start_id)).await;
        self.finish(result)
    }

    /// Execute with a streaming event channel; the engine is consumed
    pub fn execute_stream(
        mut self,
        trigger_input: Map<String, Value>,
    ) -> UnboundedReceiverStream<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        tokio::spawn(async move {
            self.execute(trigger_input).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Resume a paused execution from its checkpoint
    ///
    /// Restores state and counters, merges `resume_input` with
    /// `changed_by="resume"`, marks the waiting node completed, and continues
    /// from its successor. A waiting node that already completed (duplicate
    /// delivery) is not re-marked.
    pub async fn resume(
        &mut self,
        checkpoint: &Value,
        resume_input: Map<String, Value>,
    ) -> ProcessResult {
        info!(execution_id = %self.execution_id, "resuming process execution");
        self.started_at = Some(Instant::now());

        self.state.restore_checkpoint(checkpoint);
        self.nodes_executed = checkpoint
            .get("nodes_executed")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.total_tokens = checkpoint
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.tool_calls = checkpoint
            .get("tool_calls")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.ai_calls = checkpoint
            .get("ai_calls")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if !resume_input.is_empty() {
            self.state.update(&resume_input, "resume");
        }

        let Some(current_id) = self.state.current_node().map(str::to_string) else {
            return self.finish(ProcessResult::failure(
                ExecutionError::validation_error("No current node in checkpoint"),
                &self.execution_id,
            ));
        };
        let Some(node) = self.definition.get_node(&current_id).cloned() else {
            return self.finish(ProcessResult::failure(
                ExecutionError::validation_error(format!("Node not found: {current_id}")),
                &self.execution_id,
            ));
        };

        let resume_output = Value::Object(resume_input);
        if !self.state.is_completed(&current_id) {
            self.state.mark_completed(&current_id, resume_output.clone());
            if let Some(output_variable) = &node.output_variable {
                self.state
                    .set(output_variable.clone(), resume_output.clone(), "resume");
            }
            self.nodes_executed += 1;
        }

        let resume_result = NodeResult::success(resume_output);
        let exclude = Self::control_exclusions(&node);
        let next = match self.select_next(&node, &resume_result, &exclude) {
            Ok(next) => next,
            Err(error) => {
                return self.finish(
                    ProcessResult::failure(error, &self.execution_id)
                        .with_failed_node(&current_id),
                );
            }
        };

        let result = self.run_loop(next).await;
        self.finish(result)
    }

    // ----- the run loop ---------------------------------------------------

    async fn run_loop(&mut self, mut current: Option<String>) -> ProcessResult {
        while let Some(node_id) = current {
            if let Some(failure) = self.check_quotas() {
                return failure;
            }

            let Some(node) = self.definition.get_node(&node_id).cloned() else {
                return ProcessResult::failure(
                    ExecutionError::validation_error(format!("Node not found: {node_id}")),
                    &self.execution_id,
                )
                .with_nodes_executed(self.state.completed_nodes().to_vec());
            };

            match self.step(&node).await {
                StepControl::Continue(next) => current = next,
                StepControl::Finished(result) => return result,
            }
        }

        // Terminal without an END node: the last output is the result
        let output = self
            .state
            .completed_nodes()
            .last()
            .and_then(|last| self.state.node_output(last))
            .cloned()
            .unwrap_or_else(|| Value::Object(self.state.masked_variables()));

        ProcessResult::success(
            output,
            self.state.variables().clone(),
            self.state.completed_nodes().to_vec(),
            &self.execution_id,
        )
        .with_nodes_skipped(self.state.skipped_nodes().to_vec())
        .with_tokens(self.total_tokens)
    }

    /// Execute one node, fold its result into the run, pick the next node
    async fn step(&mut self, node: &ProcessNode) -> StepControl {
        let result = match self.run_node(node).await {
            Ok(result) => result,
            Err(finished) => return finished,
        };

        let exclude = Self::control_exclusions(node);

        if result.is_skipped() {
            self.state.mark_skipped(&node.id);
            return match self.select_next(node, &result, &exclude) {
                Ok(next) => StepControl::Continue(next),
                Err(error) => StepControl::Finished(self.failure_result(node, error)),
            };
        }

        self.complete_node(node, &result).await;

        if node.node_type == NodeType::End {
            let output = result.output.clone().unwrap_or(Value::Null);
            return StepControl::Finished(
                ProcessResult::success(
                    output,
                    self.state.variables().clone(),
                    self.state.completed_nodes().to_vec(),
                    &self.execution_id,
                )
                .with_nodes_skipped(self.state.skipped_nodes().to_vec())
                .with_tokens(self.total_tokens),
            );
        }

        match self.select_next(node, &result, &exclude) {
            Ok(next) => StepControl::Continue(next),
            Err(error) => StepControl::Finished(self.failure_result(node, error)),
        }
    }

    /// Execute a node and resolve any control construct it opens (loop,
    /// while, parallel, sub-process) down to a plain terminal [`NodeResult`].
    ///
    /// `Err` carries the finished process result when the node caused a
    /// durable pause or an unhandled failure.
    async fn run_node(&mut self, node: &ProcessNode) -> Result<NodeResult, StepControl> {
        self.emit(
            ProcessEvent::new(
                ProcessEventType::NodeStarted,
                json!({
                    "node_id": node.id,
                    "node_name": node.name,
                    "node_type": node.node_type.as_str(),
                }),
            )
            .with_node(&node.id),
        );

        let variables_before = self.state.variables().clone();
        let mut result = self.execute_node(node).await;

        if result.is_success() {
            let is_sub = result
                .output
                .as_ref()
                .and_then(|o| o.get("is_sub_process"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if is_sub {
                result = self.invoke_sub_process(node, result).await;
            }
        }

        self.emit_node_completed(node, &result, &variables_before);

        if result.is_waiting() {
            let waiting = self.waiting_result(node, &result).await;
            return Err(StepControl::Finished(waiting));
        }

        if result.is_failure() {
            if node.config.skip_on_error {
                debug!(node_id = %node.id, "node failed, skip_on_error set");
                return Ok(NodeResult::skipped(format!(
                    "Error: {}",
                    result
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_default()
                )));
            }
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| ExecutionError::internal_error("Node failed without error"));
            return Err(StepControl::Finished(self.failure_result(node, error)));
        }

        if result.is_skipped() {
            return Ok(result);
        }

        // Control constructs the engine drives itself
        let output = result.output.clone().unwrap_or(Value::Null);
        if output
            .get("is_loop_start")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return self.drive_loop(node, result).await;
        }
        if node.node_type == NodeType::While
            && output
                .get("continuing")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        {
            return self.drive_while(node, result).await;
        }
        if output
            .get("is_parallel_start")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return self.drive_parallel(node, result).await;
        }

        Ok(result)
    }

    /// Validate and execute a node under the timeout envelope
    async fn execute_node(&mut self, node: &ProcessNode) -> NodeResult {
        debug!(node_id = %node.id, node_type = node.node_type.as_str(), "executing node");

        if !node.config.enabled {
            debug!(node_id = %node.id, "node is disabled, skipping");
            return NodeResult::skipped("Node is disabled");
        }

        let Some(executor) = self.executor_for(node.node_type) else {
            return NodeResult::failure(ExecutorRegistry::no_executor_error(node.node_type));
        };

        if let Some(validation_error) = executor.validate(node) {
            return NodeResult::failure(validation_error.with_source_node(&node.id));
        }

        self.state.set_current_node(&node.id);

        if let Some(mut cancel) = self.cancel.clone() {
            tokio::select! {
                result = execute_with_timeout(
                    executor.as_ref(), node, &mut self.state, &self.context
                ) => result,
                _ = cancel.changed() => NodeResult::failure(
                    ExecutionError::new(
                        ErrorCategory::UserCancelled,
                        "USER_CANCELLED",
                        "Execution cancelled",
                    )
                    .with_source_node(&node.id),
                ),
            }
        } else {
            execute_with_timeout(executor.as_ref(), node, &mut self.state, &self.context).await
        }
    }

    /// Mark a node completed and account for its result
    async fn complete_node(&mut self, node: &ProcessNode, result: &NodeResult) {
        self.state
            .mark_completed(&node.id, result.output.clone().unwrap_or(Value::Null));
        if !result.variables_update.is_empty() {
            self.state.update(&result.variables_update, &node.id);
        }

        self.nodes_executed += 1;
        self.total_tokens += result.tokens_used;
        match node.node_type {
            NodeType::ToolCall => self.tool_calls += 1,
            NodeType::AiTask => self.ai_calls += 1,
            _ => {}
        }

        if self.settings.checkpoint_enabled
            && self.settings.checkpoint_interval_nodes > 0
            && self.nodes_executed % self.settings.checkpoint_interval_nodes == 0
        {
            self.save_checkpoint().await;
        }
    }

    async fn save_checkpoint(&self) {
        if let Some(sink) = &self.checkpoint_sink {
            let checkpoint = self.checkpoint();
            sink.save(
                &self.execution_id,
                &checkpoint,
                self.state.variables(),
                self.state.completed_nodes(),
            )
            .await;
            debug!(nodes_executed = self.nodes_executed, "checkpoint saved");
        }
    }

    // ----- quota and terminal helpers -------------------------------------

    fn check_quotas(&self) -> Option<ProcessResult> {
        if self.is_cancelled() {
            let mut result = ProcessResult::failure(
                ExecutionError::new(
                    ErrorCategory::UserCancelled,
                    "USER_CANCELLED",
                    "Execution cancelled",
                ),
                &self.execution_id,
            )
            .with_nodes_executed(self.state.completed_nodes().to_vec());
            result.status = ExecutionStatus::Cancelled;
            return Some(result);
        }

        if self.nodes_executed >= self.settings.max_node_executions {
            return Some(
                ProcessResult::failure(
                    ExecutionError::new(
                        ErrorCategory::Resource,
                        "MAX_NODES_EXCEEDED",
                        format!(
                            "Exceeded maximum nodes ({})",
                            self.settings.max_node_executions
                        ),
                    ),
                    &self.execution_id,
                )
                .with_nodes_executed(self.state.completed_nodes().to_vec()),
            );
        }

        let elapsed = self
            .started_at
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);
        if elapsed > self.settings.max_execution_time_seconds {
            let mut result = ProcessResult::failure(
                ExecutionError::timeout_error(
                    format!(
                        "Process exceeded max time ({}s)",
                        self.settings.max_execution_time_seconds
                    ),
                    self.settings.max_execution_time_seconds,
                ),
                &self.execution_id,
            )
            .with_nodes_executed(self.state.completed_nodes().to_vec());
            result.status = ExecutionStatus::Timeout;
            return Some(result);
        }

        None
    }

    fn failure_result(&self, node: &ProcessNode, error: ExecutionError) -> ProcessResult {
        warn!(node_id = %node.id, code = %error.code, "process failed");
        let result = ProcessResult::failure(error.clone(), &self.execution_id)
            .with_failed_node(&node.id)
            .with_nodes_executed(self.state.completed_nodes().to_vec())
            .with_nodes_skipped(self.state.skipped_nodes().to_vec())
            .with_tokens(self.total_tokens);
        self.emit(
            ProcessEvent::new(
                ProcessEventType::ProcessFailed,
                json!({
                    "error": self.state.mask_value(&error.to_technical_json()),
                    "node_id": node.id,
                }),
            )
            .with_node(&node.id),
        );
        result
    }

    async fn waiting_result(&mut self, node: &ProcessNode, result: &NodeResult) -> ProcessResult {
        let waiting_for = result.waiting_for.unwrap_or(WaitingKind::Event);
        info!(node_id = %node.id, kind = waiting_for.as_str(), "process waiting");

        // Waits are durable pauses: always checkpoint before releasing
        self.save_checkpoint().await;

        self.emit(
            ProcessEvent::new(
                ProcessEventType::ProcessWaiting,
                json!({
                    "waiting_for": waiting_for.as_str(),
                    "node_id": node.id,
                }),
            )
            .with_node(&node.id),
        );

        let mut process_result =
            ProcessResult::waiting(waiting_for, &node.id, &self.execution_id)
                .with_nodes_executed(self.state.completed_nodes().to_vec())
                .with_nodes_skipped(self.state.skipped_nodes().to_vec())
                .with_final_variables(self.state.variables().clone())
                .with_tokens(self.total_tokens);
        if let Some(metadata) = &result.waiting_metadata {
            process_result = process_result.with_waiting_metadata(metadata.clone());
        }
        process_result
    }

    fn finish(&self, mut result: ProcessResult) -> ProcessResult {
        if let Some(started) = self.started_at {
            result.total_duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        }
        if result.status == ExecutionStatus::Success {
            self.emit(ProcessEvent::new(
                ProcessEventType::ProcessCompleted,
                json!({
                    "execution_id": self.execution_id,
                    "nodes_executed": result.node_count,
                    "total_duration_ms": result.total_duration_ms,
                    "output": result.output.as_ref().map(|o| self.state.mask_value(o)),
                }),
            ));
        }
        result
    }

    fn emit_node_completed(
        &self,
        node: &ProcessNode,
        result: &NodeResult,
        variables_before: &Map<String, Value>,
    ) {
        let loop_frame = self.state.current_loop();
        self.emit(
            ProcessEvent::new(
                ProcessEventType::NodeCompleted,
                json!({
                    "node_id": node.id,
                    "node_name": node.name,
                    "node_type": node.node_type.as_str(),
                    "status": result.status,
                    "output": result.output,
                    "duration_ms": result.duration_ms,
                    "tokens_used": result.tokens_used,
                    "logs": result.logs.iter()
                        .map(|l| self.state.mask_text(l))
                        .collect::<Vec<_>>(),
                    "error": result.error.as_ref().map(|e| e.to_technical_json()),
                    "variables_before": variables_before,
                    "variables_after": self.state.variables(),
                    "branch_taken": result.output.as_ref()
                        .and_then(|o| o.get("branch"))
                        .cloned(),
                    "loop_index": loop_frame.map(|f| f.index),
                    "loop_total": loop_frame.map(|f| f.items.len()),
                }),
            )
            .with_node(&node.id),
        );
    }

    // ----- next-node selection --------------------------------------------

    /// Pick the node after `node`: END stops, a result-directed id wins,
    /// then the explicit `next` override, then edge evaluation (first true
    /// condition wins, first unconditional edge is the fallback, edge order
    /// breaks ties)
    fn select_next(
        &self,
        node: &ProcessNode,
        result: &NodeResult,
        exclude: &HashSet<String>,
    ) -> Result<Option<String>, ExecutionError> {
        if node.node_type == NodeType::End {
            return Ok(None);
        }

        if let Some(next) = &result.next_node_id {
            return Ok(Some(next.clone()));
        }

        if let Some(next) = &node.next {
            if !next.is_empty() {
                return Ok(Some(next.clone()));
            }
        }

        let edges: Vec<_> = self
            .definition
            .get_outgoing_edges(&node.id)
            .into_iter()
            .filter(|edge| !exclude.contains(&edge.target))
            .collect();
        if edges.is_empty() {
            return Ok(None);
        }

        for edge in &edges {
            match &edge.condition {
                Some(condition) if !condition.is_empty() => {
                    match self.state.evaluate_condition(condition) {
                        Ok(true) => return Ok(Some(edge.target.clone())),
                        Ok(false) => continue,
                        Err(e) => {
                            return Err(ExecutionError::new(
                                ErrorCategory::Validation,
                                "CONDITION_EVAL_FAILED",
                                format!("Failed to evaluate edge condition '{condition}': {e}"),
                            )
                            .user_fixable(!e.is_null_operand())
                            .with_source_node(&node.id));
                        }
                    }
                }
                _ => return Ok(Some(edge.target.clone())),
            }
        }

        Ok(Some(edges[0].target.clone()))
    }

    // ----- engine-driven control constructs -------------------------------

    /// Run a sequence of node ids on the engine's own state (loop and while
    /// bodies). Nested control constructs recurse through [`Self::run_node`].
    fn run_segment<'a>(
        &'a mut self,
        node_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<(), StepControl>> + Send + 'a>> {
        Box::pin(async move {
            for node_id in node_ids {
                if let Some(failure) = self.check_quotas() {
                    return Err(StepControl::Finished(failure));
                }
                let Some(node) = self.definition.get_node(node_id).cloned() else {
                    return Err(StepControl::Finished(ProcessResult::failure(
                        ExecutionError::validation_error(format!("Node not found: {node_id}")),
                        &self.execution_id,
                    )));
                };

                let result = self.run_node(&node).await?;
                if result.is_skipped() {
                    self.state.mark_skipped(&node.id);
                    continue;
                }
                self.complete_node(&node, &result).await;
            }
            Ok(())
        })
    }

    /// Drive a for-each loop: the executor primed the frame and the first
    /// item; the engine runs the body once per item and aggregates results.
    async fn drive_loop(
        &mut self,
        node: &ProcessNode,
        entry: NodeResult,
    ) -> Result<NodeResult, StepControl> {
        let output = entry.output.clone().unwrap_or(Value::Null);
        let body_nodes: Vec<String> = output
            .get("body_nodes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let total = output
            .get("total_items")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut results = Vec::new();
        let mut iterations = 0u64;

        if body_nodes.is_empty() {
            // A loop without a body still consumes its items
            iterations = total;
            while self.state.advance_loop() {}
            self.state.pop_loop(&node.id);
        } else {
            loop {
                if let Err(finished) = self.run_segment(&body_nodes).await {
                    self.state.pop_loop(&node.id);
                    return Err(finished);
                }
                iterations += 1;
                // The last body node's output is this iteration's result
                if let Some(last) = body_nodes.last() {
                    results.push(
                        self.state
                            .node_output(last)
                            .cloned()
                            .unwrap_or(Value::Null),
                    );
                }
                if !self.state.advance_loop() {
                    break;
                }
                self.state.set_loop_item(&node.id);
            }
            self.state.pop_loop(&node.id);
        }

        Ok(NodeResult::success(json!({
            "iterations": iterations,
            "results": results,
        }))
        .with_logs(entry.logs))
    }

    /// Drive a while loop: body, then re-evaluate the node, until the
    /// condition stops holding (or the iteration cap fails it).
    async fn drive_while(
        &mut self,
        node: &ProcessNode,
        entry: NodeResult,
    ) -> Result<NodeResult, StepControl> {
        let body_nodes: Vec<String> = entry
            .output
            .as_ref()
            .and_then(|o| o.get("body_nodes"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if body_nodes.is_empty() {
            return Err(StepControl::Finished(self.failure_result(
                node,
                ExecutionError::validation_error("While loop has no body nodes")
                    .with_source_node(&node.id),
            )));
        }

        let mut evaluation = entry;
        loop {
            let continuing = evaluation
                .output
                .as_ref()
                .and_then(|o| o.get("continuing"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !continuing {
                // The final evaluation becomes the while node's result
                return Ok(evaluation);
            }

            self.run_segment(&body_nodes).await?;
            if let Some(failure) = self.check_quotas() {
                return Err(StepControl::Finished(failure));
            }

            let variables_before = self.state.variables().clone();
            evaluation = self.execute_node(node).await;
            self.emit_node_completed(node, &evaluation, &variables_before);
            if evaluation.is_failure() {
                let error = evaluation.error.clone().unwrap_or_else(|| {
                    ExecutionError::internal_error("While evaluation failed")
                });
                return Err(StepControl::Finished(self.failure_result(node, error)));
            }
        }
    }

    /// Drive a parallel fan-out: each branch runs concurrently on a snapshot
    /// of the state; finished branches are absorbed back in branch order.
    async fn drive_parallel(
        &mut self,
        node: &ProcessNode,
        entry: NodeResult,
    ) -> Result<NodeResult, StepControl> {
        let output = entry.output.clone().unwrap_or(Value::Null);
        let branches: Vec<Vec<String>> = output
            .get("branches")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|branch| {
                        branch
                            .as_array()
                            .map(|nodes| {
                                nodes
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let strategy = output
            .get("merge_strategy")
            .and_then(Value::as_str)
            .unwrap_or("wait_all")
            .to_string();
        let wait_count = output
            .get("wait_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let fail_fast = output
            .get("fail_fast")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let needed = match strategy.as_str() {
            "wait_any" => 1,
            "wait_n" => wait_count.clamp(1, branches.len()),
            _ => branches.len(),
        };

        let mut join_set = tokio::task::JoinSet::new();
        for (index, branch_nodes) in branches.iter().enumerate() {
            let runner = BranchRunner {
                definition: self.definition.clone(),
                deps: self.deps.clone(),
                registry: self.registry.clone(),
                context: self.context.clone(),
                events: self.events.clone(),
                state: self.state.branch_snapshot(),
                remaining_nodes: self
                    .settings
                    .max_node_executions
                    .saturating_sub(self.nodes_executed),
            };
            let branch_nodes = branch_nodes.clone();
            join_set.spawn(async move { runner.run(index, branch_nodes).await });
        }

        let mut outcomes: Vec<BranchOutcome> = Vec::new();
        let mut first_failure: Option<(String, ExecutionError)> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.is_cancelled() {
                        continue;
                    }
                    join_set.abort_all();
                    return Err(StepControl::Finished(self.failure_result(
                        node,
                        ExecutionError::internal_error(format!("Branch task failed: {e}")),
                    )));
                }
            };

            if let Some((failed_node, error)) = outcome.failed.clone() {
                if fail_fast {
                    join_set.abort_all();
                    let mut done = outcomes;
                    done.push(outcome);
                    // Absorb what completed so the audit trail stays coherent
                    self.absorb_outcomes(node, done);
                    return Err(StepControl::Finished(
                        self.failure_result(node, error).with_failed_node(failed_node),
                    ));
                }
                if first_failure.is_none() {
                    first_failure = Some((failed_node, error));
                }
            }

            outcomes.push(outcome);
            let successes = outcomes.iter().filter(|o| o.failed.is_none()).count();
            if successes >= needed && !join_set.is_empty() {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                break;
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.failed.is_none()).count();
        if succeeded < needed {
            let (failed_node, error) = first_failure.unwrap_or_else(|| {
                (
                    node.id.clone(),
                    ExecutionError::internal_error("Parallel branches did not complete"),
                )
            });
            self.absorb_outcomes(node, outcomes);
            return Err(StepControl::Finished(
                self.failure_result(node, error).with_failed_node(failed_node),
            ));
        }

        let branch_results = self.absorb_outcomes(node, outcomes);
        self.state.finish_parallel(&node.id);

        Ok(NodeResult::success(json!({
            "branches_completed": succeeded,
            "merge_strategy": strategy,
            "results": branch_results,
        }))
        .with_logs(entry.logs))
    }

    /// Fold finished branches into the parent state, in branch-index order
    fn absorb_outcomes(&mut self, node: &ProcessNode, mut outcomes: Vec<BranchOutcome>) -> Value {
        outcomes.sort_by_key(|o| o.index);
        let mut branch_results = Vec::new();
        for outcome in outcomes {
            self.nodes_executed += outcome.nodes_executed;
            self.total_tokens += outcome.tokens_used;
            if outcome.failed.is_none() {
                self.state
                    .complete_branch(&node.id, outcome.index, outcome.last_output.clone());
                branch_results.push(outcome.last_output.clone());
                self.state.absorb_branch(outcome.state, &node.id);
            }
        }
        Value::Array(branch_results)
    }

    /// Resolve an `is_sub_process` output through the injected runner
    async fn invoke_sub_process(&mut self, node: &ProcessNode, result: NodeResult) -> NodeResult {
        let output = result.output.clone().unwrap_or(Value::Null);
        let process_id = output
            .get("sub_process_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input = output
            .get("sub_process_inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let wait_for_completion = output
            .get("wait_for_completion")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let timeout_seconds = output
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        let Some(runner) = self.deps.sub_processes.clone() else {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Configuration,
                    "NO_EXECUTOR",
                    "Sub-process invocation is not configured",
                )
                .with_source_node(&node.id),
            )
            .with_logs(result.logs);
        };

        let request = SubProcessRequest {
            process_id: process_id.clone(),
            input,
            parent_execution_id: self.execution_id.clone(),
            parent_node_id: node.id.clone(),
            execution_depth: self.context.execution_depth + 1,
            wait_for_completion,
            timeout_seconds,
        };

        let mut logs = result.logs.clone();
        let invocation = if wait_for_completion {
            match tokio::time::timeout(
                std::time::Duration::from_secs(timeout_seconds),
                runner.start(request),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    return NodeResult::failure(
                        ExecutionError::timeout_error(
                            format!("Sub-process {process_id} timed out"),
                            timeout_seconds,
                        )
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                }
            }
        } else {
            runner.start(request).await
        };

        match invocation {
            Ok(outcome) => {
                logs.push(format!("Sub-process execution: {}", outcome.execution_id));
                if wait_for_completion {
                    match outcome.status {
                        Some(ExecutionStatus::Success) => {
                            let child_output = outcome.output.unwrap_or(Value::Null);
                            let mut node_result =
                                NodeResult::success(child_output.clone()).with_logs(logs);
                            if let Some(output_variable) = &node.output_variable {
                                node_result = node_result
                                    .with_variable(output_variable.clone(), child_output);
                            }
                            node_result
                        }
                        other => NodeResult::failure(
                            ExecutionError::new(
                                ErrorCategory::External,
                                "SUB_PROCESS_FAILED",
                                format!(
                                    "Sub-process {process_id} ended with status {other:?}"
                                ),
                            )
                            .with_details(json!({
                                "child_execution_id": outcome.execution_id,
                                "output": outcome.output,
                            }))
                            .with_source_node(&node.id),
                        )
                        .with_logs(logs),
                    }
                } else {
                    NodeResult::success(json!({
                        "sub_process_execution_id": outcome.execution_id,
                        "started": true,
                    }))
                    .with_logs(logs)
                }
            }
            Err(e) => NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::External,
                    "SUB_PROCESS_FAILED",
                    format!("Sub-process invocation failed: {e}"),
                )
                .with_source_node(&node.id),
            )
            .with_logs(logs),
        }
    }
}

/// Runs one parallel branch on a snapshot of the parent state
///
/// Branch execution is intentionally simpler than the main loop: nodes run
/// in the order the branch lists them, and durable waits are rejected (a
/// single branch cannot pause the process).
struct BranchRunner {
    definition: Arc<ProcessDefinition>,
    deps: Arc<Dependencies>,
    registry: Arc<ExecutorRegistry>,
    context: ProcessContext,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    state: ProcessState,
    remaining_nodes: u64,
}

impl BranchRunner {
    async fn run(mut self, index: usize, node_ids: Vec<String>) -> BranchOutcome {
        let mut nodes_executed = 0u64;
        let mut tokens_used = 0u64;
        let mut last_output = Value::Null;
        let mut failed = None;

        for node_id in &node_ids {
            if nodes_executed >= self.remaining_nodes {
                failed = Some((
                    node_id.clone(),
                    ExecutionError::new(
                        ErrorCategory::Resource,
                        "MAX_NODES_EXCEEDED",
                        "Branch exceeded the execution's node budget",
                    ),
                ));
                break;
            }
            let Some(node) = self.definition.get_node(node_id).cloned() else {
                failed = Some((
                    node_id.clone(),
                    ExecutionError::validation_error(format!("Node not found: {node_id}")),
                ));
                break;
            };

            if !node.config.enabled {
                self.state.mark_skipped(&node.id);
                continue;
            }
            let Some(executor) = self.registry.create(node.node_type, self.deps.clone()) else {
                failed = Some((
                    node.id.clone(),
                    ExecutorRegistry::no_executor_error(node.node_type),
                ));
                break;
            };
            if let Some(validation_error) = executor.validate(&node) {
                failed = Some((node.id.clone(), validation_error));
                break;
            }

            if let Some(sender) = &self.events {
                let _ = sender.send(
                    ProcessEvent::new(
                        ProcessEventType::NodeStarted,
                        json!({
                            "node_id": node.id,
                            "node_name": node.name,
                            "node_type": node.node_type.as_str(),
                            "branch_index": index,
                        }),
                    )
                    .with_node(&node.id),
                );
            }

            self.state.set_current_node(&node.id);
            let result =
                execute_with_timeout(executor.as_ref(), &node, &mut self.state, &self.context)
                    .await;

            if let Some(sender) = &self.events {
                let _ = sender.send(
                    ProcessEvent::new(
                        ProcessEventType::NodeCompleted,
                        json!({
                            "node_id": node.id,
                            "node_name": node.name,
                            "node_type": node.node_type.as_str(),
                            "status": result.status,
                            "output": result.output,
                            "duration_ms": result.duration_ms,
                            "branch_index": index,
                        }),
                    )
                    .with_node(&node.id),
                );
            }

            if result.is_waiting() {
                failed = Some((
                    node.id.clone(),
                    ExecutionError::new(
                        ErrorCategory::Validation,
                        "WAIT_IN_PARALLEL",
                        format!("Node {} cannot wait inside a parallel branch", node.id),
                    ),
                ));
                break;
            }
            if result.is_failure() {
                if node.config.skip_on_error {
                    self.state.mark_skipped(&node.id);
                    continue;
                }
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionError::internal_error("Node failed"));
                failed = Some((node.id.clone(), error));
                break;
            }
            if result.is_skipped() {
                self.state.mark_skipped(&node.id);
                continue;
            }

            last_output = result.output.clone().unwrap_or(Value::Null);
            self.state.mark_completed(&node.id, last_output.clone());
            if !result.variables_update.is_empty() {
                self.state.update(&result.variables_update, &node.id);
            }
            nodes_executed += 1;
            tokens_used += result.tokens_used;
        }

        BranchOutcome {
            index,
            state: self.state,
            last_output,
            failed,
            nodes_executed,
            tokens_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, ProcessEdge};
    use crate::deps::DependencyError;
    use crate::llm::{ChatMessage, ChatOptions, ChatResponse};
    use serde_json::json;

    struct StubLlm;

    #[async_trait]
    impl crate::llm::ChatModel for StubLlm {
        async fn chat(
            &self,
            messages: Vec<ChatMessage>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, DependencyError> {
            let prompt = &messages.last().unwrap().content;
            Ok(ChatResponse {
                content: format!("{} world", prompt.replace("Say ", "")),
                total_tokens: 7,
            })
        }
    }

    fn node(id: &str, node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: id.to_string(),
            node_type,
            name: id.to_string(),
            config: NodeConfig {
                type_config: type_config.as_object().cloned().unwrap_or_default(),
                ..NodeConfig::default()
            },
            input_mapping: None,
            output_variable: None,
            next: None,
        }
    }

    fn edge(source: &str, target: &str) -> ProcessEdge {
        ProcessEdge {
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            edge_type: None,
        }
    }

    fn trigger(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn engine(definition: ProcessDefinition, deps: Dependencies) -> ProcessEngine {
        ProcessEngine::new(definition, ProcessContext::new("exec-1"), Arc::new(deps))
    }

    #[tokio::test]
    async fn test_linear_flow_with_script() {
        let definition = ProcessDefinition::new(
            "linear",
            vec![
                node("start", NodeType::Start, json!({})),
                {
                    let mut n = node(
                        "work",
                        NodeType::Script,
                        json!({"code": "n * 2", "inputs": {"n": "{{x}}"}}),
                    );
                    n.output_variable = Some("y".to_string());
                    n
                },
                node("end", NodeType::End, json!({"output": "{{y}}"})),
            ],
            vec![edge("start", "work"), edge("work", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("x", json!(21))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!(42)));
        assert_eq!(result.nodes_executed, vec!["start", "work", "end"]);
        assert_eq!(result.node_count, 3);
    }

    #[tokio::test]
    async fn test_ai_task_end_to_end() {
        let definition = ProcessDefinition::new(
            "s1",
            vec![
                node("start", NodeType::Start, json!({})),
                {
                    let mut n = node("ai", NodeType::AiTask, json!({"prompt": "Say {{x}}"}));
                    n.output_variable = Some("y".to_string());
                    n
                },
                node("end", NodeType::End, json!({"output": "{{y}}"})),
            ],
            vec![edge("start", "ai"), edge("ai", "end")],
        )
        .unwrap();

        let deps = Dependencies::new().with_llm(Arc::new(StubLlm));
        let mut engine = engine(definition, deps);
        let result = engine.execute(trigger(&[("x", json!("hello"))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!("hello world")));
        assert_eq!(result.nodes_executed, vec!["start", "ai", "end"]);
        assert_eq!(result.total_tokens_used, 7);
    }

    #[tokio::test]
    async fn test_condition_routes_and_skips_other_branch() {
        let definition = ProcessDefinition::new(
            "branching",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "check",
                    NodeType::Condition,
                    json!({"expression": "{{amount}} > 100", "true_branch": "big", "false_branch": "small"}),
                ),
                node("big", NodeType::Script, json!({"code": "'big'"})),
                node("small", NodeType::Script, json!({"code": "'small'"})),
                node("end", NodeType::End, json!({})),
            ],
            vec![
                edge("start", "check"),
                edge("check", "big"),
                edge("check", "small"),
                edge("big", "end"),
                edge("small", "end"),
            ],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("amount", json!(250))])).await;

        assert!(result.is_success());
        assert!(result.nodes_executed.contains(&"big".to_string()));
        assert!(!result.nodes_executed.contains(&"small".to_string()));
    }

    #[tokio::test]
    async fn test_condition_missing_upstream_fails_classified() {
        let definition = ProcessDefinition::new(
            "s2",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "check",
                    NodeType::Condition,
                    json!({"expression": "{{parsedData.totalAmount}} > 100", "true_branch": "a", "false_branch": "b"}),
                ),
                node("a", NodeType::End, json!({})),
                node("b", NodeType::End, json!({})),
            ],
            vec![edge("start", "check"), edge("check", "a"), edge("check", "b")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(Map::new()).await;

        assert!(result.is_failure());
        assert_eq!(result.failed_node_id.as_deref(), Some("check"));
        let error = result.error.unwrap();
        assert_eq!(error.code, "CONDITION_EVAL_FAILED");
        assert!(!error.is_user_fixable);
    }

    #[tokio::test]
    async fn test_skip_on_error_continues() {
        let mut failing = node("flaky", NodeType::Script, json!({"code": "missing > 1"}));
        failing.config.skip_on_error = true;

        let definition = ProcessDefinition::new(
            "skippy",
            vec![
                node("start", NodeType::Start, json!({})),
                failing,
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "flaky"), edge("flaky", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(Map::new()).await;

        assert!(result.is_success());
        assert_eq!(result.nodes_skipped, vec!["flaky"]);
    }

    #[tokio::test]
    async fn test_max_nodes_quota() {
        let doc = json!({
            "name": "infinite",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "spin", "type": "script", "config": {"type_config": {"code": "1"}}}
            ],
            "edges": [
                {"source": "start", "target": "spin"},
                {"source": "spin", "target": "spin"}
            ],
            "settings": {"max_node_executions": 5}
        });
        let definition = ProcessDefinition::from_json(&doc).unwrap();
        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(Map::new()).await;

        assert!(result.is_failure());
        assert_eq!(result.error.unwrap().code, "MAX_NODES_EXCEEDED");
        assert!(result.node_count <= 5);
    }

    #[tokio::test]
    async fn test_loop_iterates_body_per_item() {
        let definition = ProcessDefinition::new(
            "looped",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "each",
                    NodeType::Loop,
                    json!({"items_expression": "{{list}}", "body_nodes": ["double"]}),
                ),
                {
                    let mut n = node(
                        "double",
                        NodeType::Script,
                        json!({"code": "x * 2", "inputs": {"x": "{{item}}"}}),
                    );
                    n.output_variable = Some("doubled".to_string());
                    n
                },
                node("end", NodeType::End, json!({})),
            ],
            vec![
                edge("start", "each"),
                edge("each", "double"),
                edge("each", "end"),
                edge("double", "end"),
            ],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("list", json!([1, 2, 3]))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.final_variables.get("doubled"), Some(&json!(6)));
        let body_runs = result
            .nodes_executed
            .iter()
            .filter(|id| *id == "double")
            .count();
        assert_eq!(body_runs, 3);
        // The loop node records the aggregated result
        assert_eq!(
            engine.state().node_output("each").unwrap()["iterations"],
            json!(3)
        );
    }

    #[tokio::test]
    async fn test_loop_empty_items_short_circuits() {
        let definition = ProcessDefinition::new(
            "s5",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "each",
                    NodeType::Loop,
                    json!({"items_expression": "{{list}}", "body_nodes": ["b"]}),
                ),
                node("b", NodeType::Script, json!({"code": "1"})),
                node("end", NodeType::End, json!({})),
            ],
            vec![
                edge("start", "each"),
                edge("each", "b"),
                edge("each", "end"),
                edge("b", "end"),
            ],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("list", json!([]))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert!(!result.nodes_executed.contains(&"b".to_string()));
        assert_eq!(
            engine.state().node_output("each"),
            Some(&json!({"iterations": 0, "results": []}))
        );
    }

    #[tokio::test]
    async fn test_while_runs_until_condition_false() {
        let definition = ProcessDefinition::new(
            "whiley",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "until_three",
                    NodeType::While,
                    json!({"condition": "{{n}} < 3", "body_nodes": ["inc"]}),
                ),
                {
                    let mut n = node(
                        "inc",
                        NodeType::Script,
                        json!({"code": "n + 1", "inputs": {"n": "{{n}}"}}),
                    );
                    n.output_variable = Some("n".to_string());
                    n
                },
                node("end", NodeType::End, json!({})),
            ],
            vec![
                edge("start", "until_three"),
                edge("until_three", "inc"),
                edge("until_three", "end"),
                edge("inc", "end"),
            ],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("n", json!(0))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.final_variables.get("n"), Some(&json!(3)));
        assert!(result.nodes_executed.contains(&"end".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_branches_merge_object() {
        let definition = ProcessDefinition::new(
            "s4",
            vec![
                node("start", NodeType::Start, json!({})),
                node("par", NodeType::Parallel, json!({"branches": [["x"], ["y"]]})),
                node(
                    "x",
                    NodeType::Transform,
                    json!({"transform_type": "map", "mapping": {"a": 1}}),
                ),
                node(
                    "y",
                    NodeType::Transform,
                    json!({"transform_type": "map", "mapping": {"b": 2}}),
                ),
                node(
                    "join",
                    NodeType::Merge,
                    json!({"strategy": "object", "source_nodes": ["x", "y"]}),
                ),
                node("end", NodeType::End, json!({"output": "{{merged_results}}"})),
            ],
            vec![edge("start", "par"), edge("par", "join"), edge("join", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(Map::new()).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert_eq!(result.output, Some(json!({"a": 1, "b": 2})));
        assert!(result.nodes_executed.contains(&"x".to_string()));
        assert!(result.nodes_executed.contains(&"y".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_fail_fast_propagates_branch_failure() {
        let definition = ProcessDefinition::new(
            "failfast",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "par",
                    NodeType::Parallel,
                    json!({"branches": [["boom"], ["fine"]], "fail_fast": true}),
                ),
                node("boom", NodeType::Script, json!({"code": "missing > 1"})),
                node("fine", NodeType::Script, json!({"code": "1"})),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "par"), edge("par", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(Map::new()).await;

        assert!(result.is_failure());
        assert_eq!(result.failed_node_id.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_parallel_branch_isolation() {
        // Both branches write the same variable; neither sees the other's
        // write mid-flight, and the merge applies them in branch order
        let definition = ProcessDefinition::new(
            "isolated",
            vec![
                node("start", NodeType::Start, json!({})),
                node("par", NodeType::Parallel, json!({"branches": [["w1"], ["w2"]]})),
                {
                    let mut n = node(
                        "w1",
                        NodeType::Script,
                        json!({"code": "shared + '-one'", "inputs": {"shared": "{{shared}}"}}),
                    );
                    n.output_variable = Some("shared".to_string());
                    n
                },
                {
                    let mut n = node(
                        "w2",
                        NodeType::Script,
                        json!({"code": "shared + '-two'", "inputs": {"shared": "{{shared}}"}}),
                    );
                    n.output_variable = Some("shared".to_string());
                    n
                },
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "par"), edge("par", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine.execute(trigger(&[("shared", json!("base"))])).await;

        assert!(result.is_success(), "error: {:?}", result.error);
        // Last-write-wins in branch order: branch 1 wrote after branch 0
        assert_eq!(result.final_variables.get("shared"), Some(&json!("base-two")));
    }

    #[tokio::test]
    async fn test_approval_pause_checkpoint_resume() {
        let definition = ProcessDefinition::new(
            "s3",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "gate",
                    NodeType::Approval,
                    json!({"assignee_source": "platform", "assignee_ids": ["U1"], "timeout_hours": 24}),
                ),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "gate"), edge("gate", "end")],
        )
        .unwrap();

        let mut first = engine(definition.clone(), Dependencies::new());
        let waiting = first.execute(Map::new()).await;

        assert!(waiting.is_waiting());
        assert!(waiting.can_resume);
        assert_eq!(waiting.waiting_for, Some(WaitingKind::Approval));
        assert_eq!(waiting.resume_node_id.as_deref(), Some("gate"));
        let metadata = waiting.waiting_metadata.as_ref().unwrap();
        assert_eq!(metadata["assignee_ids"], json!(["U1"]));

        let checkpoint = first.checkpoint();
        let mut resumed = ProcessEngine::new(
            definition,
            ProcessContext::new("exec-1"),
            Arc::new(Dependencies::new()),
        );
        let result = resumed
            .resume(
                &checkpoint,
                trigger(&[("decision", json!("approved")), ("decided_by", json!("U1"))]),
            )
            .await;

        assert!(result.is_success(), "error: {:?}", result.error);
        assert!(result.nodes_executed.contains(&"gate".to_string()));
        assert!(result.nodes_executed.contains(&"end".to_string()));
        assert_eq!(
            result.final_variables.get("decision"),
            Some(&json!("approved"))
        );
    }

    #[tokio::test]
    async fn test_resume_idempotent_for_completed_node() {
        let definition = ProcessDefinition::new(
            "idem",
            vec![
                node("start", NodeType::Start, json!({})),
                node("gate", NodeType::Approval, json!({"assignee_ids": ["U1"]})),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "gate"), edge("gate", "end")],
        )
        .unwrap();

        let mut first = engine(definition.clone(), Dependencies::new());
        first.execute(Map::new()).await;
        let checkpoint = first.checkpoint();

        let mut second = ProcessEngine::new(
            definition.clone(),
            ProcessContext::new("exec-1"),
            Arc::new(Dependencies::new()),
        );
        let result1 = second
            .resume(&checkpoint, trigger(&[("decision", json!("approved"))]))
            .await;
        assert!(result1.is_success());

        // Re-delivering against the post-resume checkpoint: the gate is
        // already completed and is not re-marked
        let checkpoint2 = second.checkpoint();
        let mut third = ProcessEngine::new(
            definition,
            ProcessContext::new("exec-1"),
            Arc::new(Dependencies::new()),
        );
        let result2 = third
            .resume(&checkpoint2, trigger(&[("decision", json!("approved"))]))
            .await;
        assert!(result2.is_success());
        let gate_count = result2
            .nodes_executed
            .iter()
            .filter(|id| *id == "gate")
            .count();
        assert_eq!(gate_count, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_counters_round_trip() {
        let definition = ProcessDefinition::new(
            "chk",
            vec![
                node("start", NodeType::Start, json!({})),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "end")],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        engine.execute(trigger(&[("k", json!("v"))])).await;

        let checkpoint = engine.checkpoint();
        assert_eq!(checkpoint["nodes_executed"], json!(2));
        let mut restored = ProcessState::default();
        restored.restore_checkpoint(&checkpoint);
        assert_eq!(restored.variables(), engine.state().variables());
        assert_eq!(restored.completed_nodes(), engine.state().completed_nodes());
    }

    #[tokio::test]
    async fn test_event_stream_yields_lifecycle() {
        use tokio_stream::StreamExt;

        let definition = ProcessDefinition::new(
            "streaming",
            vec![
                node("start", NodeType::Start, json!({})),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "end")],
        )
        .unwrap();

        let engine = engine(definition, Dependencies::new());
        let mut stream = engine.execute_stream(Map::new());

        let mut kinds = Vec::new();
        while let Some(event) = stream.next().await {
            kinds.push(event.event_type);
        }

        assert_eq!(kinds.first(), Some(&ProcessEventType::ProcessStarted));
        assert!(kinds.contains(&ProcessEventType::NodeStarted));
        assert!(kinds.contains(&ProcessEventType::NodeCompleted));
        assert_eq!(kinds.last(), Some(&ProcessEventType::ProcessCompleted));
    }

    #[tokio::test]
    async fn test_cancellation_mid_run() {
        let definition = ProcessDefinition::new(
            "cancellable",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "wait",
                    NodeType::Delay,
                    json!({"delay_type": "seconds", "duration": 200}),
                ),
                node("end", NodeType::End, json!({})),
            ],
            vec![edge("start", "wait"), edge("wait", "end")],
        )
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let mut engine = engine(definition, Dependencies::new()).with_cancellation(rx);

        let handle = tokio::spawn(async move { engine.execute(Map::new()).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.error.unwrap().code, "USER_CANCELLED");
    }

    #[tokio::test]
    async fn test_nested_loop_inside_while_body() {
        // WHILE body contains a LOOP node: the segment runner must drive the
        // inner construct rather than record its control output verbatim
        let definition = ProcessDefinition::new(
            "nested",
            vec![
                node("start", NodeType::Start, json!({})),
                node(
                    "outer",
                    NodeType::While,
                    json!({"condition": "{{rounds}} < 2", "body_nodes": ["inner", "bump"]}),
                ),
                node(
                    "inner",
                    NodeType::Loop,
                    json!({"items_expression": "{{list}}", "body_nodes": ["touch"]}),
                ),
                {
                    let mut n = node(
                        "touch",
                        NodeType::Script,
                        json!({"code": "seen + 1", "inputs": {"seen": "{{seen}}"}}),
                    );
                    n.output_variable = Some("seen".to_string());
                    n
                },
                {
                    let mut n = node(
                        "bump",
                        NodeType::Script,
                        json!({"code": "rounds + 1", "inputs": {"rounds": "{{rounds}}"}}),
                    );
                    n.output_variable = Some("rounds".to_string());
                    n
                },
                node("end", NodeType::End, json!({})),
            ],
            vec![
                edge("start", "outer"),
                edge("outer", "inner"),
                edge("outer", "end"),
            ],
        )
        .unwrap();

        let mut engine = engine(definition, Dependencies::new());
        let result = engine
            .execute(trigger(&[
                ("rounds", json!(0)),
                ("seen", json!(0)),
                ("list", json!(["a", "b"])),
            ]))
            .await;

        assert!(result.is_success(), "error: {:?}", result.error);
        // 2 while rounds x 2 loop items
        assert_eq!(result.final_variables.get("seen"), Some(&json!(4)));
        assert_eq!(result.final_variables.get("rounds"), Some(&json!(2)));
    }
}
