//! Human-in-the-loop executors: APPROVAL, HUMAN_TASK, NOTIFICATION
//!
//! APPROVAL and HUMAN_TASK never complete inline - they resolve their
//! assignees, build the request payload, and return a waiting result; the
//! engine persists the approval record and releases the worker. NOTIFICATION
//! is fire-and-forget: delivery failures do not fail the process, but an
//! empty recipient set does (it is a configuration problem the user can fix).

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::{AssigneeDescriptor, Dependencies, NotificationRequest};
use crate::error::{ErrorCategory, ExecutionError};
use crate::executor::{
    config_bool, config_str, config_string_list, config_string_or, config_u64, NodeExecutor,
};
use crate::result::{NodeResult, WaitingKind};
use crate::state::ProcessState;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// True when the string looks like a UUID (a template id rather than text)
fn looks_like_uuid(value: &str) -> bool {
    let re = Regex::new(
        r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
    )
    .unwrap();
    re.is_match(value.trim()) || re.is_match(&value.trim().to_lowercase())
}

/// Normalize approver/assignee config to a list of string ids
///
/// Accepts a single id, a list of ids, or a list of objects carrying
/// `id`/`value`/`user_id`.
fn to_assignee_id_list(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Object(map) => map
                    .get("id")
                    .or_else(|| map.get("value"))
                    .or_else(|| map.get("user_id"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

/// Resolved assignees plus resolution notes for the audit trail
struct ResolvedAssignees {
    assignee_type: String,
    user_ids: Vec<String>,
    logs: Vec<String>,
}

/// Resolve approval/task assignees per `assignee_source`
///
/// Order: `user_directory` (typed descriptor through the injected resolver,
/// falling back to `any` on zero resolution), `tool` (a designated tool
/// returns `approver_ids`), anything else platform-literal ids with
/// interpolation.
async fn resolve_assignees(
    deps: &Dependencies,
    node: &ProcessNode,
    state: &ProcessState,
    context: &ProcessContext,
) -> Result<ResolvedAssignees, ExecutionError> {
    let assignee_source = config_string_or(node, "assignee_source", "platform");
    let mut assignee_type = config_string_or(node, "assignee_type", "user");
    let raw_ids = node
        .config_value("assignee_ids")
        .filter(|v| !to_assignee_id_list(v).is_empty())
        .or_else(|| node.config_value("approvers"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut logs = Vec::new();

    if assignee_source == "user_directory" {
        if let Some(directory) = &deps.user_directory {
            logs.push("Resolving assignees via user directory".to_string());

            let descriptor = AssigneeDescriptor {
                kind: config_str(node, "directory_assignee_type")
                    .and_then(|s| serde_json::from_value(json!(s)).ok())
                    .unwrap_or_default(),
                user_ids: to_assignee_id_list(&raw_ids),
                role_ids: config_string_list(node, "assignee_role_ids"),
                group_ids: config_string_list(node, "assignee_group_ids"),
                department_id: config_str(node, "assignee_department_id")
                    .or_else(|| config_str(node, "department_id"))
                    .map(str::to_string),
                department_name: config_str(node, "assignee_department_name")
                    .or_else(|| config_str(node, "department_name"))
                    .map(str::to_string),
                level: config_u64(node, "management_level", 1) as u32,
                expression: config_string_or(node, "assignee_expression", ""),
            };
            let process_context = json!({
                "user_id": context.user_id,
                "trigger_input": context.trigger_input,
                "variables": state.masked_variables(),
            });

            match directory
                .resolve_process_assignee(&descriptor, &process_context, &context.org_id)
                .await
            {
                Ok(user_ids) if !user_ids.is_empty() => {
                    logs.push(format!(
                        "Resolved {} assignees from user directory",
                        user_ids.len()
                    ));
                    return Ok(ResolvedAssignees {
                        assignee_type: "user".to_string(),
                        user_ids,
                        logs,
                    });
                }
                Ok(_) => {
                    let mut detail = format!(
                        "The user directory resolved 0 assignees for type '{:?}'. ",
                        descriptor.kind
                    );
                    match descriptor.kind {
                        crate::deps::AssigneeDescriptorKind::DynamicManager => {
                            detail.push_str(
                                "This means the user who submitted the process does not have \
                                 a manager assigned in the identity directory.",
                            );
                        }
                        crate::deps::AssigneeDescriptorKind::DepartmentManager
                        | crate::deps::AssigneeDescriptorKind::DepartmentByName => {
                            detail.push_str(
                                "This means no users were found in the target department, \
                                 or the user's department is not set.",
                            );
                        }
                        _ => {}
                    }
                    for warning in context.identity_warnings() {
                        detail.push_str(&format!(" Identity warning: {warning}."));
                    }
                    logs.push(detail);
                    logs.push("Falling back to 'any' assignee type".to_string());
                    return Ok(ResolvedAssignees {
                        assignee_type: "any".to_string(),
                        user_ids: Vec::new(),
                        logs,
                    });
                }
                Err(e) => {
                    logs.push(format!(
                        "User directory resolution failed: {e}, falling back to static assignees"
                    ));
                }
            }
        }
    } else if assignee_source == "tool" {
        let tool_id = config_string_or(node, "assignee_tool_id", "");
        if tool_id.is_empty() {
            return Err(ExecutionError::validation_error(
                "Approvers from tool requires a selected tool (assignee_tool_id)",
            ));
        }
        if context.denied_tool_ids.contains(&tool_id) {
            return Err(ExecutionError::new(
                ErrorCategory::Authorization,
                "TOOL_ACCESS_DENIED",
                "Access denied to the approver tool",
            ));
        }
        if !context.is_tool_allowed(&tool_id) {
            return Err(ExecutionError::new(
                ErrorCategory::Authorization,
                "TOOL_NOT_AVAILABLE",
                "Approver tool is not available in this execution context",
            ));
        }
        let Some(tool) = deps.get_tool(&tool_id) else {
            return Err(ExecutionError::validation_error(format!(
                "Approver tool not found: {tool_id}"
            )));
        };

        let mut tool_input = crate::executor::config_map(node, "assignee_tool_input");
        tool_input.insert("user_id".to_string(), json!(context.user_id));
        for (key, value) in &context.trigger_input {
            tool_input.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let tool_input = match state.interpolate_value(&Value::Object(tool_input)) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let outcome = tool.execute(tool_input).await;
        if !outcome.success {
            return Err(ExecutionError::validation_error(
                outcome
                    .error
                    .unwrap_or_else(|| "Approver tool failed".to_string()),
            ));
        }

        let data = outcome.data.unwrap_or(Value::Null);
        let ids = match &data {
            Value::Object(map) => {
                let from_key = map
                    .get("approver_ids")
                    .map(to_assignee_id_list)
                    .filter(|ids| !ids.is_empty());
                from_key
                    .or_else(|| {
                        map.get("manager_id")
                            .and_then(Value::as_str)
                            .map(|id| vec![id.to_string()])
                    })
                    .or_else(|| {
                        map.get("assignee_id")
                            .and_then(Value::as_str)
                            .map(|id| vec![id.to_string()])
                    })
                    .unwrap_or_default()
            }
            other => to_assignee_id_list(other),
        };
        logs.push(format!("Approver tool resolved {} assignees", ids.len()));
        return Ok(ResolvedAssignees {
            assignee_type: "user".to_string(),
            user_ids: ids,
            logs,
        });
    }

    // Platform-literal ids (user/role/group), with interpolation
    let resolved = state
        .interpolate_value(&raw_ids)
        .unwrap_or_else(|_| raw_ids.clone());
    let user_ids = to_assignee_id_list(&resolved);
    if user_ids.is_empty() {
        assignee_type = "any".to_string();
    }
    Ok(ResolvedAssignees {
        assignee_type,
        user_ids,
        logs,
    })
}

// ----- APPROVAL -----------------------------------------------------------

/// Pause for human approval
///
/// Builds the approval-request payload (assignees, deadline, review data,
/// escalation) and returns waiting(approval); the engine turns the metadata
/// into a persistent approval record.
pub struct ApprovalExecutor {
    deps: Arc<Dependencies>,
}

impl ApprovalExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }
}

#[async_trait]
impl NodeExecutor for ApprovalExecutor {
    // Empty assignees are allowed: the request becomes visible to anyone
    // with approval rights ('any').
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let title = config_string_or(node, "title", &format!("Approval Required: {}", node.name));
        let description = config_string_or(node, "description", "");
        let min_approvals = config_u64(node, "min_approvals", 1);
        let timeout_hours = config_u64(node, "timeout_hours", 24);
        let timeout_action = config_string_or(node, "timeout_action", "fail");
        let escalation_enabled = config_bool(node, "escalation_enabled", false);
        let escalation_after_hours = node
            .config_value("escalation_after_hours")
            .and_then(Value::as_u64);
        let escalation_assignee_ids = config_string_list(node, "escalation_assignee_ids");
        let review_data_expr = config_str(node, "review_data_expression").map(str::to_string);
        let form_fields = node.config_value("form_fields").cloned().unwrap_or(json!([]));
        let priority = config_string_or(node, "priority", "normal");

        let mut logs = vec![format!("Creating approval request: {title}")];

        let resolved = match resolve_assignees(&self.deps, node, state, context).await {
            Ok(resolved) => resolved,
            Err(error) => {
                return NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs);
            }
        };
        logs.extend(resolved.logs);

        let title = state.interpolate_string(&title).unwrap_or(title);
        let description = state
            .interpolate_string(&description)
            .unwrap_or(description);

        // Review data: explicit expression, or all (masked) variables
        let review_data = match &review_data_expr {
            Some(expr) => match state.evaluate(expr) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(other) => json!({ "data": other }),
                Err(e) => {
                    logs.push(format!("Warning: Failed to get review data: {e}"));
                    json!({})
                }
            },
            None => Value::Object(state.masked_variables()),
        };

        let deadline = if timeout_hours > 0 {
            Some(Utc::now() + Duration::hours(timeout_hours as i64))
        } else {
            None
        };

        logs.push(format!(
            "Assignees ({}): {:?}",
            resolved.assignee_type, resolved.user_ids
        ));
        logs.push(format!("Deadline: {deadline:?}"));

        let approval_request = json!({
            "node_id": node.id,
            "node_name": node.name,
            "title": title,
            "description": description,
            "assignee_type": resolved.assignee_type,
            "assignee_ids": resolved.user_ids,
            "min_approvals": min_approvals,
            "review_data": review_data,
            "form_fields": form_fields,
            "priority": priority,
            "deadline": deadline.map(|d| d.to_rfc3339()),
            "timeout_action": timeout_action,
            "escalation": if escalation_enabled {
                json!({
                    "enabled": true,
                    "after_hours": escalation_after_hours,
                    "assignee_ids": escalation_assignee_ids,
                })
            } else {
                Value::Null
            },
            "created_at": Utc::now().to_rfc3339(),
            "execution_id": context.execution_id,
            "org_id": context.org_id,
        });

        NodeResult::waiting(WaitingKind::Approval, approval_request).with_logs(logs)
    }
}

// ----- HUMAN_TASK ---------------------------------------------------------

/// Form-based work assigned to a person
///
/// Approval-shaped, but carries a form schema and required fields instead of
/// min-approvals semantics.
pub struct HumanTaskExecutor {
    deps: Arc<Dependencies>,
}

impl HumanTaskExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }
}

#[async_trait]
impl NodeExecutor for HumanTaskExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        let ids = node
            .config_value("assignee_ids")
            .map(to_assignee_id_list)
            .filter(|ids| !ids.is_empty())
            .or_else(|| {
                node.config_value("approvers")
                    .map(to_assignee_id_list)
                    .filter(|ids| !ids.is_empty())
            });
        if ids.is_none() {
            return Some(ExecutionError::validation_error(
                "At least one assignee is required for human task",
            ));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let title = config_string_or(node, "title", &node.name);
        let description = config_string_or(node, "description", "");
        let instructions = config_string_or(node, "instructions", "");
        let form_schema = node.config_value("form_schema").cloned().unwrap_or(json!({}));
        let required_fields = config_string_list(node, "required_fields");
        let due_date_hours = node.config_value("due_date_hours").and_then(Value::as_u64);
        let priority = config_string_or(node, "priority", "normal");
        let context_data_expr = config_str(node, "context_data_expression").map(str::to_string);

        let mut logs = vec![format!("Creating human task: {title}")];

        let resolved = match resolve_assignees(&self.deps, node, state, context).await {
            Ok(resolved) => resolved,
            Err(error) => {
                return NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs);
            }
        };
        logs.extend(resolved.logs);

        let title = state.interpolate_string(&title).unwrap_or(title);
        let description = state
            .interpolate_string(&description)
            .unwrap_or(description);
        let instructions = state
            .interpolate_string(&instructions)
            .unwrap_or(instructions);

        let context_data = match &context_data_expr {
            Some(expr) => state.evaluate(expr).unwrap_or_else(|e| {
                logs.push(format!("Warning: Failed to get context data: {e}"));
                json!({})
            }),
            None => json!({}),
        };

        let due_date = due_date_hours.map(|hours| Utc::now() + Duration::hours(hours as i64));
        logs.push(format!(
            "Assigned to ({}): {:?}",
            resolved.assignee_type, resolved.user_ids
        ));

        let task_data = json!({
            "type": "human_task",
            "node_id": node.id,
            "node_name": node.name,
            "title": title,
            "description": description,
            "instructions": instructions,
            "assignee_type": resolved.assignee_type,
            "assignee_ids": resolved.user_ids,
            "form_schema": form_schema,
            "required_fields": required_fields,
            "context_data": context_data,
            "priority": priority,
            "due_date": due_date.map(|d| d.to_rfc3339()),
            "created_at": Utc::now().to_rfc3339(),
            "execution_id": context.execution_id,
            "org_id": context.org_id,
        });

        NodeResult::waiting(WaitingKind::HumanTask, task_data).with_logs(logs)
    }
}

// ----- NOTIFICATION -------------------------------------------------------

/// Fire-and-forget notification through the injected channel
///
/// Recipient resolution understands shortcuts (`requester`, `manager`, ...),
/// resolves UUID user ids to emails through the directory, and passes
/// through anything that already looks like an email.
pub struct NotificationExecutor {
    deps: Arc<Dependencies>,
}

impl NotificationExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }

    async fn resolve_recipients(
        &self,
        recipients: Vec<String>,
        context: &ProcessContext,
        logs: &mut Vec<String>,
    ) -> Vec<String> {
        let user_context = context.user_context();
        let identity_warnings = context.identity_warnings();

        if user_context.is_empty() {
            logs.push(
                "Warning: user context is empty - identity directory may not be configured \
                 or user not found"
                    .to_string(),
            );
        } else {
            for warning in &identity_warnings {
                logs.push(format!("Identity: {warning}"));
            }
        }

        let mut resolved = Vec::new();
        for recipient in recipients {
            let r = recipient.trim().to_string();
            if r.is_empty() {
                continue;
            }
            let r_lower = r.to_lowercase();

            // Shortcut: the user who started the process
            if ["requester", "submitter", "initiator", "self"].contains(&r_lower.as_str()) {
                match user_context.get("email").and_then(Value::as_str) {
                    Some(email) if !email.is_empty() => {
                        logs.push(format!("Resolved '{r}' -> {email}"));
                        resolved.push(email.to_string());
                    }
                    _ => logs.push(format!(
                        "Warning: Could not resolve '{r}' - no email in user context. \
                         Check that the user's email is set in their profile and the \
                         identity directory is configured."
                    )),
                }
                continue;
            }

            // Shortcut: the requester's manager
            if ["manager", "supervisor", "direct_manager"].contains(&r_lower.as_str()) {
                let mut email = user_context
                    .get("manager_email")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                if email.is_empty() {
                    if let Some(directory) = &self.deps.user_directory {
                        let requester_id = user_context
                            .get("user_id")
                            .and_then(Value::as_str)
                            .unwrap_or(&context.user_id)
                            .to_string();
                        if !requester_id.is_empty() {
                            let manager_email = async {
                                let requester = directory
                                    .get_user(&requester_id, &context.org_id)
                                    .await
                                    .ok()??;
                                let manager_id = requester.manager_id?;
                                let manager = directory
                                    .get_user(&manager_id, &context.org_id)
                                    .await
                                    .ok()??;
                                manager.email
                            }
                            .await;
                            if let Some(found) = manager_email {
                                logs.push(format!(
                                    "Resolved '{r}' via user directory fallback -> {found}"
                                ));
                                email = found;
                            }
                        }
                    }
                }

                if email.is_empty() {
                    logs.push(format!(
                        "Warning: Could not resolve '{r}' - no manager email found. \
                         Check that this user has a manager assigned in the identity directory."
                    ));
                } else {
                    resolved.push(email);
                }
                continue;
            }

            // Already an email
            if r.contains('@') {
                resolved.push(r);
                continue;
            }

            // A UUID-shaped user id: resolve through the directory
            if r.len() >= 20 && r.contains('-') {
                if let Some(directory) = &self.deps.user_directory {
                    match directory.get_user(&r, &context.org_id).await {
                        Ok(Some(user)) if user.email.is_some() => {
                            let email = user.email.unwrap();
                            let prefix: String = r.chars().take(8).collect();
                            logs.push(format!("Resolved user id {prefix}... -> {email}"));
                            resolved.push(email);
                            continue;
                        }
                        Err(e) => {
                            let prefix: String = r.chars().take(8).collect();
                            logs.push(format!(
                                "Warning: Failed to resolve user id {prefix}...: {e}"
                            ));
                        }
                        _ => {}
                    }
                }
            }

            resolved.push(r);
        }

        resolved.retain(|r| !r.trim().is_empty());
        resolved
    }
}

#[async_trait]
impl NodeExecutor for NotificationExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "channel", "").is_empty() {
            return Some(ExecutionError::validation_error(
                "Notification channel is required",
            ));
        }
        let mut recipients = config_string_list(node, "recipients");
        if recipients.is_empty() {
            if let Some(single) = config_str(node, "recipient") {
                recipients.push(single.to_string());
            }
        }
        if recipients.is_empty() {
            return Some(ExecutionError::validation_error(
                "At least one recipient is required",
            ));
        }
        let has_message = !config_string_or(node, "message", "").trim().is_empty();
        let has_template = !config_string_or(node, "template", "").trim().is_empty();
        if !has_message && !has_template {
            return Some(ExecutionError::validation_error(
                "Either message or template is required",
            ));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let channel = config_string_or(node, "channel", "email");
        let mut recipients = config_string_list(node, "recipients");
        if recipients.is_empty() {
            if let Some(single) = config_str(node, "recipient") {
                recipients.push(single.to_string());
            }
        }
        let mut title = config_string_or(node, "title", "");
        let mut message = config_string_or(node, "message", "");
        let mut template_id = config_str(node, "template").map(str::to_string);
        // The visual builder stores body text under "template"; a real
        // template reference is a UUID.
        if message.is_empty() {
            if let Some(template) = &template_id {
                if !looks_like_uuid(template) {
                    message = template.clone();
                    template_id = None;
                }
            }
        }
        let template_data = crate::executor::config_map(node, "template_data");
        let priority = config_string_or(node, "priority", "normal");
        let channel_config = crate::executor::config_map(node, "channel_config");

        let mut logs = vec![format!("Sending {channel} notification")];

        title = state.interpolate_string(&title).unwrap_or(title);
        message = state.interpolate_string(&message).unwrap_or(message);
        let template_data = match state.interpolate_value(&Value::Object(template_data)) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        // Providers require a non-empty subject
        if title.trim().is_empty() {
            title = if node.name.trim().is_empty() {
                "Notification".to_string()
            } else {
                node.name.trim().to_string()
            };
        }

        let interpolated: Vec<String> = recipients
            .iter()
            .map(|r| {
                if r.contains("{{") {
                    state.interpolate_string(r).unwrap_or_else(|_| r.clone())
                } else {
                    r.clone()
                }
            })
            .collect();

        let resolved = self
            .resolve_recipients(interpolated, context, &mut logs)
            .await;
        logs.push(format!("Recipients: {resolved:?}"));
        logs.push(format!("Title: {title}"));

        if resolved.is_empty() {
            logs.push(
                "Warning: No valid recipients after resolution - notification not sent"
                    .to_string(),
            );
            let user_context = context.user_context();
            let mut hints = Vec::new();
            let attempted: Vec<String> = recipients.iter().map(|r| r.to_lowercase()).collect();
            if attempted
                .iter()
                .any(|s| ["requester", "submitter", "initiator", "self"].contains(&s.as_str()))
                && user_context.get("email").and_then(Value::as_str).is_none()
            {
                hints.push(
                    "The requester's email address is not available - check the user's \
                     profile in the identity directory."
                        .to_string(),
                );
            }
            if attempted
                .iter()
                .any(|s| ["manager", "supervisor", "direct_manager"].contains(&s.as_str()))
                && user_context
                    .get("manager_email")
                    .and_then(Value::as_str)
                    .is_none()
            {
                hints.push(
                    "The requester's manager email is not available - ensure a manager is \
                     assigned to this user in the identity directory."
                        .to_string(),
                );
            }
            if user_context.is_empty() {
                hints.push(
                    "The identity directory did not return any user data. Please check that \
                     the identity directory is configured."
                        .to_string(),
                );
            }
            hints.extend(context.identity_warnings());
            let hint_text = if hints.is_empty() {
                "Check the identity directory to ensure the user and their manager have \
                 valid email addresses."
                    .to_string()
            } else {
                hints.join(" ")
            };

            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Configuration,
                    "NO_RECIPIENTS",
                    format!(
                        "No valid recipients resolved for notification '{}'. \
                         Original recipients config: {recipients:?}",
                        node.name
                    ),
                )
                .with_business_message(format!(
                    "The notification \"{}\" could not be sent because no valid recipient \
                     email was found. {hint_text}",
                    node.name
                ))
                .with_details(json!({
                    "original_recipients": recipients,
                    "user_context_available": !user_context.is_empty(),
                    "identity_warnings": context.identity_warnings(),
                }))
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        let Some(service) = &self.deps.notifications else {
            logs.push(
                "Warning: No notification service configured - notification not sent"
                    .to_string(),
            );
            return NodeResult::success(json!({
                "sent": false,
                "reason": "No notification service configured",
            }))
            .with_logs(logs);
        };

        let request = NotificationRequest {
            channel: channel.clone(),
            recipients: resolved.clone(),
            title,
            message,
            template_id,
            template_data,
            priority,
            config: channel_config,
        };

        match service.send(request).await {
            Ok(response) => {
                logs.push("Notification sent successfully".to_string());
                NodeResult::success(json!({
                    "sent": true,
                    "channel": channel,
                    "recipients_count": resolved.len(),
                    "result": response,
                }))
                .with_logs(logs)
            }
            Err(e) => {
                // Delivery is best-effort; the workflow continues
                logs.push(format!("Failed to send notification: {e}"));
                NodeResult::success(json!({
                    "sent": false,
                    "error": e.to_string(),
                    "business_message": format!(
                        "The notification \"{}\" could not be delivered. \
                         The delivery service may be temporarily unavailable.",
                        node.name
                    ),
                }))
                .with_logs(logs)
            }
        }
    }
}
