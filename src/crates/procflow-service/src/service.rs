//! The execution service: produced surfaces over engine + store
//!
//! [`ExecutionService`] owns the storage backend and the dependency bundle
//! and exposes the operations collaborators (API layer, schedulers, approval
//! UIs) call:
//!
//! - **Trigger**: [`ExecutionService::start_execution`] creates the
//!   execution record (definition snapshot, per-agent numbering), runs the
//!   engine, persists every node step from the event stream, and folds the
//!   terminal/waiting result back into the record - including the approval
//!   request row when the process paused on a human gate.
//! - **Resume**: [`ExecutionService::resume_execution`] restores from the
//!   stored checkpoint. Re-delivery to a finished execution is idempotent:
//!   the stored terminal result is returned unchanged.
//! - **Approvals**: decide (with min-approvals counting), list pending per
//!   user (direct, role, group, `any`), sweep expirations honoring the
//!   configured timeout action and escalation targets.
//! - **Wake-ups**: resume delayed/scheduled executions whose time has come,
//!   and force timeout resolution for event waits.
//! - **Sub-processes**: the service implements the engine's
//!   [`SubProcessRunner`] seam, creating child executions with parent
//!   linkage and depth accounting.

use crate::error::{Result, ServiceError};
use crate::recorder::record_node_executions;
use crate::subprocess::ServiceSubProcessRunner;
use async_trait::async_trait;
use chrono::Utc;
use procflow_core::{
    CheckpointSink, Dependencies, ExecutionError, ExecutionStatus, ProcessContext,
    ProcessDefinition, ProcessEngine, ProcessResult, WaitingKind,
};
use procflow_store::{
    ApprovalRequestRecord, ApprovalStatus, ExecutionFilter, ExecutionRecordStatus,
    ExecutionStats, ExecutionStore, NodeExecutionRecord, ProcessExecutionRecord, StoreError,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Resolves published process ids to definitions (for SUB_PROCESS nodes)
#[async_trait]
pub trait DefinitionResolver: Send + Sync {
    async fn resolve(&self, process_id: &str, org_id: &str) -> Option<ProcessDefinition>;
}

/// Parent linkage for child executions
#[derive(Debug, Clone)]
pub struct ParentLink {
    pub execution_id: String,
    pub node_id: String,
    pub depth: u32,
}

/// Everything needed to start an execution
#[derive(Clone)]
pub struct StartRequest {
    pub definition: ProcessDefinition,
    pub org_id: String,
    pub agent_id: String,
    pub created_by: String,
    pub trigger_type: String,
    pub trigger_input: Map<String, Value>,
    pub correlation_id: Option<String>,
    pub conversation_id: Option<String>,
    pub parent: Option<ParentLink>,
    /// Preallocated execution id (used by fire-and-forget sub-processes)
    pub execution_id: Option<String>,
}

impl StartRequest {
    pub fn new(
        definition: ProcessDefinition,
        org_id: impl Into<String>,
        agent_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            definition,
            org_id: org_id.into(),
            agent_id: agent_id.into(),
            created_by: created_by.into(),
            trigger_type: "manual".to_string(),
            trigger_input: Map::new(),
            correlation_id: None,
            conversation_id: None,
            parent: None,
            execution_id: None,
        }
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

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A decision on a pending approval
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    /// `approved` or `rejected`
    pub decision: String,
    pub comments: Option<String>,
    pub decision_data: Map<String, Value>,
    pub decided_by: String,
}

/// One execution with its node steps and approvals
#[derive(Debug, Clone)]
pub struct ExecutionDetail {
    pub execution: ProcessExecutionRecord,
    pub node_executions: Vec<NodeExecutionRecord>,
    pub approvals: Vec<ApprovalRequestRecord>,
}

/// Persists engine checkpoints onto the execution record
struct StoreCheckpointSink {
    store: Arc<dyn ExecutionStore>,
}

#[async_trait]
impl CheckpointSink for StoreCheckpointSink {
    async fn save(
        &self,
        execution_id: &str,
        checkpoint: &Value,
        variables: &Map<String, Value>,
        completed_nodes: &[String],
    ) {
        let Ok(Some(mut record)) = self.store.get_execution(execution_id).await else {
            return;
        };
        record.checkpoint_data = Some(checkpoint.clone());
        record.checkpoint_at = Some(Utc::now());
        record.can_resume = true;
        record.variables = variables.clone();
        record.completed_nodes = completed_nodes.to_vec();
        if let Err(e) = self.store.update_execution(record).await {
            warn!(execution_id, error = %e, "failed to persist checkpoint");
        }
    }
}

/// The execution service
#[derive(Clone)]
pub struct ExecutionService {
    store: Arc<dyn ExecutionStore>,
    deps: Arc<Dependencies>,
    resolver: Option<Arc<dyn DefinitionResolver>>,
    max_sub_process_depth: u32,
}

impl ExecutionService {
    pub fn new(store: Arc<dyn ExecutionStore>, deps: Arc<Dependencies>) -> Self {
        Self {
            store,
            deps,
            resolver: None,
            max_sub_process_depth: 5,
        }
    }

    /// Enable SUB_PROCESS nodes by providing a definition resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn DefinitionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_max_sub_process_depth(mut self, depth: u32) -> Self {
        self.max_sub_process_depth = depth;
        self
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    pub fn resolver(&self) -> Option<Arc<dyn DefinitionResolver>> {
        self.resolver.clone()
    }

    pub fn max_sub_process_depth(&self) -> u32 {
        self.max_sub_process_depth
    }

    /// Dependency bundle handed to engines: the base bundle plus the
    /// service-backed sub-process runner
    fn engine_deps(&self) -> Arc<Dependencies> {
        let mut deps = (*self.deps).clone();
        deps.sub_processes = Some(Arc::new(ServiceSubProcessRunner::new(self.clone())));
        Arc::new(deps)
    }

    // ----- trigger surface ------------------------------------------------

    /// Start an execution of the given definition
    ///
    /// Creates the persisted record (status `running`, definition snapshot,
    /// per-agent execution number), runs the engine to its first terminal or
    /// waiting point, and persists the outcome. Returns the engine result;
    /// the stored record carries ids for later queries/resume.
    pub async fn start_execution(&self, request: StartRequest) -> Result<ProcessResult> {
        let execution_number = self.store.next_execution_number(&request.agent_id).await?;

        let mut record = ProcessExecutionRecord::new(
            &request.org_id,
            &request.agent_id,
            &request.created_by,
        );
        if let Some(id) = &request.execution_id {
            record.id = id.clone();
        }
        record.execution_number = execution_number;
        record.correlation_id = request.correlation_id.clone();
        record.conversation_id = request.conversation_id.clone();
        record.trigger_type = request.trigger_type.clone();
        record.trigger_input = request.trigger_input.clone();
        record.status = ExecutionRecordStatus::Running;
        record.started_at = Some(Utc::now());
        record.process_version = request.definition.version;
        record.process_definition_snapshot =
            serde_json::to_value(&request.definition).ok();
        if let Some(parent) = &request.parent {
            record.parent_execution_id = Some(parent.execution_id.clone());
            record.parent_node_id = Some(parent.node_id.clone());
            record.execution_depth = parent.depth;
        }
        let execution_id = record.id.clone();
        self.store.create_execution(record).await?;
        info!(execution_id = %execution_id, number = execution_number, "execution created");

        let mut context = ProcessContext::new(&execution_id)
            .with_org(&request.org_id)
            .with_agent(&request.agent_id)
            .with_user(&request.created_by)
            .with_trigger(&request.trigger_type, request.trigger_input.clone());
        context.correlation_id = request.correlation_id.clone();
        context.execution_depth = request.parent.as_ref().map(|p| p.depth).unwrap_or(0);

        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = tokio::spawn(record_node_executions(
            self.store.clone(),
            execution_id.clone(),
            rx,
        ));

        let mut engine = ProcessEngine::new(request.definition, context, self.engine_deps())
            .with_event_sender(tx)
            .with_checkpoint_sink(Arc::new(StoreCheckpointSink {
                store: self.store.clone(),
            }));

        let result = engine.execute(request.trigger_input).await;

        let checkpoint = engine.checkpoint();
        let metrics = engine.metrics();
        drop(engine); // closes the event channel so the recorder drains
        let _ = recorder.await;

        self.persist_result(&execution_id, &result, Some(checkpoint), metrics)
            .await?;
        Ok(result)
    }

    // ----- resume surface -------------------------------------------------

    /// Resume a waiting execution with a payload (approval decision, event
    /// body, or empty for delays)
    ///
    /// Idempotent against duplicate delivery: a terminal execution returns
    /// its stored result without running anything.
    pub async fn resume_execution(
        &self,
        execution_id: &str,
        resume_input: Map<String, Value>,
    ) -> Result<ProcessResult> {
        let mut record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("execution {execution_id}")))?;

        if record.is_terminal() {
            return Ok(self.result_from_record(&record));
        }
        if record.status != ExecutionRecordStatus::Waiting {
            return Err(ServiceError::Conflict(format!(
                "execution {execution_id} is {:?}, not waiting",
                record.status
            )));
        }
        let Some(checkpoint) = record.checkpoint_data.clone() else {
            return Err(ServiceError::Conflict(format!(
                "execution {execution_id} has no checkpoint to resume from"
            )));
        };
        let Some(snapshot) = record.process_definition_snapshot.clone() else {
            return Err(ServiceError::Conflict(format!(
                "execution {execution_id} has no definition snapshot"
            )));
        };
        let definition = ProcessDefinition::from_json(&snapshot)?;

        record.status = ExecutionRecordStatus::Running;
        self.store.update_execution(record.clone()).await?;

        let mut context = ProcessContext::new(execution_id)
            .with_org(&record.org_id)
            .with_agent(&record.agent_id)
            .with_user(&record.created_by)
            .with_trigger(&record.trigger_type, record.trigger_input.clone());
        context.correlation_id = record.correlation_id.clone();
        context.execution_depth = record.execution_depth;

        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = tokio::spawn(record_node_executions(
            self.store.clone(),
            execution_id.to_string(),
            rx,
        ));

        let mut engine = ProcessEngine::new(definition, context, self.engine_deps())
            .with_event_sender(tx)
            .with_checkpoint_sink(Arc::new(StoreCheckpointSink {
                store: self.store.clone(),
            }));

        let result = engine.resume(&checkpoint, resume_input).await;

        let checkpoint = engine.checkpoint();
        let metrics = engine.metrics();
        drop(engine);
        let _ = recorder.await;

        self.persist_result(execution_id, &result, Some(checkpoint), metrics)
            .await?;
        Ok(result)
    }

    // ----- approval surface -----------------------------------------------

    /// Decide a pending approval
    ///
    /// Rejection resolves the gate immediately; approval counts toward
    /// `min_approvals` and resolves once enough approvers agreed. Resolving
    /// resumes the owning execution with the decision payload and returns
    /// its result.
    pub async fn decide_approval(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(ApprovalRequestRecord, Option<ProcessResult>)> {
        let mut approval = self
            .store
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("approval {approval_id}")))?;

        if !approval.is_pending() {
            // Duplicate delivery of a decision is benign
            return Ok((approval, None));
        }

        let now = Utc::now();
        let resolved = if decision.decision == "rejected" {
            approval.status = ApprovalStatus::Rejected;
            true
        } else {
            approval.approval_count += 1;
            if approval.approval_count >= approval.min_approvals {
                approval.status = ApprovalStatus::Approved;
                true
            } else {
                false
            }
        };

        if resolved {
            approval.decided_by = Some(decision.decided_by.clone());
            approval.decided_at = Some(now);
            approval.decision = Some(decision.decision.clone());
            approval.decision_comments = decision.comments.clone();
            approval.decision_data = Value::Object(decision.decision_data.clone());
        }
        self.store.update_approval(approval.clone()).await?;

        if !resolved {
            return Ok((approval, None));
        }

        let mut payload = Map::new();
        payload.insert("decision".to_string(), json!(decision.decision));
        payload.insert(
            "comments".to_string(),
            json!(decision.comments.unwrap_or_default()),
        );
        payload.insert("data".to_string(), Value::Object(decision.decision_data));
        payload.insert("decided_by".to_string(), json!(decision.decided_by));

        let result = self
            .resume_execution(&approval.process_execution_id, payload)
            .await?;
        Ok((approval, Some(result)))
    }

    /// Pending approvals a user can act on
    pub async fn list_pending_approvals_for_user(
        &self,
        org_id: &str,
        user_id: &str,
        role_ids: &[String],
        group_ids: &[String],
    ) -> Result<Vec<ApprovalRequestRecord>> {
        Ok(self
            .store
            .pending_approvals_for_user(org_id, user_id, role_ids, group_ids)
            .await?)
    }

    /// Sweep past-deadline approvals, applying each gate's timeout action
    ///
    /// Escalation (when configured) reassigns and extends the request; plain
    /// expiry applies the node's `timeout_action`: auto-approve, auto-reject,
    /// or fail the owning execution (the default).
    pub async fn expire_approvals(&self, org_id: &str) -> Result<Vec<ApprovalRequestRecord>> {
        let swept = self.store.expire_due_approvals(org_id, Utc::now()).await?;

        for approval in &swept {
            if approval.status != ApprovalStatus::Expired {
                continue; // escalated: still pending with new assignees
            }
            match approval.timeout_action.as_deref() {
                Some("approve") => {
                    let payload = decision_payload("approved", "system:timeout");
                    if let Err(e) = self
                        .resume_execution(&approval.process_execution_id, payload)
                        .await
                    {
                        warn!(approval_id = %approval.id, error = %e, "timeout auto-approve failed");
                    }
                }
                Some("reject") => {
                    let payload = decision_payload("rejected", "system:timeout");
                    if let Err(e) = self
                        .resume_execution(&approval.process_execution_id, payload)
                        .await
                    {
                        warn!(approval_id = %approval.id, error = %e, "timeout auto-reject failed");
                    }
                }
                _ => {
                    self.fail_execution(
                        &approval.process_execution_id,
                        ExecutionError::timeout_error(
                            format!("Approval '{}' expired", approval.title),
                            0,
                        ),
                        Some(&approval.node_id),
                        ExecutionRecordStatus::TimedOut,
                    )
                    .await?;
                }
            }
        }
        Ok(swept)
    }

    // ----- scheduling surface ---------------------------------------------

    /// Resume waiting executions whose wake-up time has passed
    ///
    /// Delays and schedules resume with an empty payload; expired event
    /// waits are resolved per their timeout action.
    pub async fn wake_due_executions(&self) -> Result<Vec<ProcessResult>> {
        let due = self.store.list_due_resumptions(Utc::now()).await?;
        let mut results = Vec::new();

        for record in due {
            match record.waiting_for.as_deref() {
                Some("delay") | Some("schedule") => {
                    match self.resume_execution(&record.id, Map::new()).await {
                        Ok(result) => results.push(result),
                        Err(e) => {
                            warn!(execution_id = %record.id, error = %e, "wake-up resume failed")
                        }
                    }
                }
                Some("event") => {
                    let metadata = record
                        .extra_metadata
                        .get("waiting_metadata")
                        .cloned()
                        .unwrap_or(Value::Null);
                    let action = metadata
                        .get("timeout_action")
                        .and_then(Value::as_str)
                        .unwrap_or("fail");
                    if action == "fail" {
                        self.fail_execution(
                            &record.id,
                            ExecutionError::timeout_error("Event wait timed out", 0),
                            record.current_node_id.as_deref(),
                            ExecutionRecordStatus::TimedOut,
                        )
                        .await?;
                    } else {
                        let mut payload = Map::new();
                        if let Some(default_value) = metadata.get("default_value") {
                            if !default_value.is_null() {
                                payload
                                    .insert("event".to_string(), default_value.clone());
                            }
                        }
                        match self.resume_execution(&record.id, payload).await {
                            Ok(result) => results.push(result),
                            Err(e) => warn!(
                                execution_id = %record.id,
                                error = %e,
                                "event timeout resume failed"
                            ),
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(results)
    }

    // ----- query surface --------------------------------------------------

    /// One execution with node steps and approvals
    pub async fn get_execution_detail(&self, execution_id: &str) -> Result<ExecutionDetail> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("execution {execution_id}")))?;
        let node_executions = self.store.list_node_executions(execution_id).await?;
        let approvals = self
            .store
            .pending_approvals_for_execution(execution_id)
            .await?;
        Ok(ExecutionDetail {
            execution,
            node_executions,
            approvals,
        })
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ProcessExecutionRecord>> {
        Ok(self.store.list_executions(filter).await?)
    }

    pub async fn execution_stats(
        &self,
        org_id: &str,
        agent_id: Option<&str>,
    ) -> Result<ExecutionStats> {
        Ok(self.store.execution_stats(org_id, agent_id).await?)
    }

    // ----- cancellation ---------------------------------------------------

    /// Cancel an active execution, transitively cancelling active children
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        let mut record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("execution {execution_id}")))?;
        if record.is_terminal() {
            return Ok(());
        }

        record.status = ExecutionRecordStatus::Cancelled;
        record.can_resume = false;
        record.completed_at = Some(Utc::now());
        self.store.update_execution(record).await?;

        let children = self
            .store
            .list_executions(&ExecutionFilter {
                parent_execution_id: Some(execution_id.to_string()),
                ..ExecutionFilter::default()
            })
            .await?;
        for child in children {
            if child.is_active() {
                Box::pin(self.cancel_execution(&child.id)).await?;
            }
        }
        Ok(())
    }

    // ----- internals ------------------------------------------------------

    /// Fold an engine result into the stored execution record
    async fn persist_result(
        &self,
        execution_id: &str,
        result: &ProcessResult,
        checkpoint: Option<Value>,
        metrics: (u64, u64, u64, u64),
    ) -> Result<()> {
        let mut record = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("execution {execution_id}")))?;

        let (nodes_executed, tokens, tool_calls, ai_calls) = metrics;
        record.completed_nodes = result.nodes_executed.clone();
        record.skipped_nodes = result.nodes_skipped.clone();
        record.variables = result.final_variables.clone();
        record.node_count_executed = nodes_executed;
        record.tokens_used = tokens;
        record.tool_calls_count = tool_calls;
        record.ai_calls_count = ai_calls;
        record.total_duration_ms = Some(result.total_duration_ms);

        match result.status {
            ExecutionStatus::Success => {
                record.status = ExecutionRecordStatus::Completed;
                record.output = result.output.clone();
                record.current_node_id = result.nodes_executed.last().cloned();
                record.completed_at = Some(Utc::now());
                record.can_resume = false;
                record.waiting_for = None;
            }
            ExecutionStatus::Waiting => {
                record.status = ExecutionRecordStatus::Waiting;
                record.can_resume = true;
                record.current_node_id = result.resume_node_id.clone();
                record.waiting_for = result.waiting_for.map(|kind| kind.as_str().to_string());
                record.checkpoint_data = checkpoint;
                record.checkpoint_at = Some(Utc::now());

                if let Some(metadata) = &result.waiting_metadata {
                    record
                        .extra_metadata
                        .insert("waiting_metadata".to_string(), metadata.clone());
                    // Delay/schedule/event wake-ups for the scheduler sweep
                    let wake_at = metadata
                        .get("resume_at")
                        .or_else(|| metadata.get("timeout_at"))
                        .cloned();
                    if let Some(wake_at) = wake_at {
                        record.extra_metadata.insert("wake_at".to_string(), wake_at);
                    }
                }

                match result.waiting_for {
                    Some(WaitingKind::Approval) | Some(WaitingKind::HumanTask) => {
                        if let Some(metadata) = &result.waiting_metadata {
                            let approval = approval_from_metadata(
                                &record.org_id,
                                execution_id,
                                metadata,
                                result.waiting_for == Some(WaitingKind::HumanTask),
                            );
                            match self.store.create_approval(approval).await {
                                Ok(()) => {}
                                Err(StoreError::Conflict(_)) => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                    _ => {}
                }
            }
            ExecutionStatus::Failure => {
                record.status = ExecutionRecordStatus::Failed;
                self.apply_error(&mut record, result);
            }
            ExecutionStatus::Timeout => {
                record.status = ExecutionRecordStatus::TimedOut;
                self.apply_error(&mut record, result);
            }
            ExecutionStatus::Cancelled => {
                record.status = ExecutionRecordStatus::Cancelled;
                self.apply_error(&mut record, result);
            }
            ExecutionStatus::Skipped => {
                record.status = ExecutionRecordStatus::Completed;
                record.completed_at = Some(Utc::now());
            }
        }

        self.store.update_execution(record).await?;
        Ok(())
    }

    fn apply_error(&self, record: &mut ProcessExecutionRecord, result: &ProcessResult) {
        record.completed_at = Some(Utc::now());
        record.can_resume = false;
        record.error_node_id = result.failed_node_id.clone();
        record.current_node_id = result.failed_node_id.clone();
        if let Some(error) = &result.error {
            record.error_message = Some(error.message.clone());
            record.error_details = Some(error.to_technical_json());
        }
    }

    /// Mark an execution failed/timed out outside an engine run
    async fn fail_execution(
        &self,
        execution_id: &str,
        error: ExecutionError,
        node_id: Option<&str>,
        status: ExecutionRecordStatus,
    ) -> Result<()> {
        let Some(mut record) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        if record.is_terminal() {
            return Ok(());
        }
        record.status = status;
        record.can_resume = false;
        record.completed_at = Some(Utc::now());
        record.error_message = Some(error.message.clone());
        record.error_details = Some(error.to_technical_json());
        record.error_node_id = node_id.map(str::to_string);
        self.store.update_execution(record).await?;
        Ok(())
    }

    /// Reconstruct a result from a terminal record (idempotent resume)
    fn result_from_record(&self, record: &ProcessExecutionRecord) -> ProcessResult {
        let mut result = match record.status {
            ExecutionRecordStatus::Completed => ProcessResult::success(
                record.output.clone().unwrap_or(Value::Null),
                record.variables.clone(),
                record.completed_nodes.clone(),
                &record.id,
            ),
            _ => {
                let error = record
                    .error_details
                    .as_ref()
                    .and_then(|details| serde_json::from_value(details.clone()).ok())
                    .unwrap_or_else(|| {
                        ExecutionError::internal_error(
                            record
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "execution failed".to_string()),
                        )
                    });
                let mut failure = ProcessResult::failure(error, &record.id)
                    .with_nodes_executed(record.completed_nodes.clone());
                if let Some(node_id) = &record.error_node_id {
                    failure = failure.with_failed_node(node_id);
                }
                failure.status = match record.status {
                    ExecutionRecordStatus::Cancelled => ExecutionStatus::Cancelled,
                    ExecutionRecordStatus::TimedOut => ExecutionStatus::Timeout,
                    _ => ExecutionStatus::Failure,
                };
                failure
            }
        };
        result.nodes_skipped = record.skipped_nodes.clone();
        result.total_duration_ms = record.total_duration_ms.unwrap_or(0.0);
        result.total_tokens_used = record.tokens_used;
        result
    }
}

fn decision_payload(decision: &str, decided_by: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("decision".to_string(), json!(decision));
    payload.insert("comments".to_string(), json!("Resolved by timeout policy"));
    payload.insert("data".to_string(), json!({}));
    payload.insert("decided_by".to_string(), json!(decided_by));
    payload
}

/// Build the persisted approval request from the node's waiting metadata
fn approval_from_metadata(
    org_id: &str,
    execution_id: &str,
    metadata: &Value,
    is_human_task: bool,
) -> ApprovalRequestRecord {
    let get_str = |key: &str| metadata.get(key).and_then(Value::as_str).unwrap_or_default();
    let get_list = |key: &str| -> Vec<String> {
        metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let title = if get_str("title").is_empty() {
        if is_human_task {
            "Task".to_string()
        } else {
            "Approval Required".to_string()
        }
    } else {
        get_str("title").to_string()
    };

    let mut approval =
        ApprovalRequestRecord::new(org_id, execution_id, get_str("node_id"), title);
    approval.node_name = Some(get_str("node_name").to_string()).filter(|s| !s.is_empty());
    approval.description =
        Some(get_str("description").to_string()).filter(|s| !s.is_empty());
    approval.review_data = metadata.get("review_data").cloned().unwrap_or(Value::Null);
    approval.priority = metadata
        .get("priority")
        .and_then(Value::as_str)
        .unwrap_or("normal")
        .to_string();

    let assignee_type = metadata
        .get("assignee_type")
        .and_then(Value::as_str)
        .unwrap_or("user");
    approval.assignee_type = assignee_type.to_string();
    let ids = get_list("assignee_ids");
    match assignee_type {
        "role" => approval.assigned_role_ids = ids,
        "group" => approval.assigned_group_ids = ids,
        _ => approval.assigned_user_ids = ids,
    }

    approval.min_approvals = metadata
        .get("min_approvals")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    approval.deadline_at = metadata
        .get("deadline")
        .or_else(|| metadata.get("due_date"))
        .and_then(Value::as_str)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|deadline| deadline.with_timezone(&Utc));
    approval.timeout_action = metadata
        .get("timeout_action")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(escalation) = metadata.get("escalation").filter(|v| !v.is_null()) {
        approval.escalate_after_hours = escalation
            .get("after_hours")
            .and_then(Value::as_u64)
            .map(|hours| hours as u32);
        approval.escalation_user_ids = escalation
            .get("assignee_ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    }

    approval
}
