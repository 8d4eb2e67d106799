//! Task executors: AI_TASK, TOOL_CALL, SCRIPT
//!
//! The nodes that do actual work. AI_TASK drives the injected chat model and
//! guards its structured output two ways: strict JSON parsing (with fence and
//! balanced-block recovery) and a plausibility pass that flags fabricated
//! totals and placeholder prose. SCRIPT evaluates user code in the safe
//! expression subset behind a denylist of dangerous identifiers.

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::Dependencies;
use crate::error::{ErrorCategory, ExecutionError};
use crate::executor::{config_bool, config_str, config_string_or, NodeExecutor};
use crate::expression::{self, VarScope};
use crate::llm::{ChatMessage, ChatOptions};
use crate::result::{NodeResult, WaitingKind};
use crate::state::ProcessState;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

// ----- AI_TASK ------------------------------------------------------------

/// Thresholds for the anti-hallucination pass
///
/// Heuristic by design; hosts can tune per organization through
/// [`crate::engine::EngineOptions`].
#[derive(Debug, Clone)]
pub struct PlausibilityCheck {
    /// Relative tolerance when matching an output total to an input number
    pub numeric_tolerance: f64,
    /// Minimum length for narrative fields before they are flagged as vague
    pub min_detail_chars: usize,
}

impl Default for PlausibilityCheck {
    fn default() -> Self {
        Self {
            numeric_tolerance: 0.10,
            min_detail_chars: 10,
        }
    }
}

impl PlausibilityCheck {
    /// Compare an object output against the prompt text it was derived from.
    ///
    /// Returns warning lines (empty = plausible). Two checks:
    /// 1. Monetary-looking fields must match an input number, the sum of all
    ///    input numbers, or fall within `numeric_tolerance` of one.
    /// 2. Narrative fields must not be suspiciously short or match a curated
    ///    set of generic placeholder phrasings.
    pub fn check(&self, prompt_text: &str, output: &Map<String, Value>) -> Vec<String> {
        let mut warnings = Vec::new();

        // Standalone numeric tokens from the prompt (boundary-checked by
        // offset; the regex engine has no lookarounds)
        let number_re = Regex::new(r"\d+(?:\.\d+)?").unwrap();
        let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '.';
        let mut prompt_numbers: Vec<f64> = Vec::new();
        for token in number_re.find_iter(prompt_text) {
            let standalone = !prompt_text[..token.start()]
                .chars()
                .next_back()
                .map(is_word)
                .unwrap_or(false)
                && !prompt_text[token.end()..]
                    .chars()
                    .next()
                    .map(is_word)
                    .unwrap_or(false);
            if !standalone {
                continue;
            }
            if let Ok(n) = token.as_str().parse::<f64>() {
                if n > 0.0 {
                    prompt_numbers.push(n);
                }
            }
        }

        const TOTAL_KEYS: [&str; 8] = [
            "totalamount",
            "total",
            "amount",
            "grandtotal",
            "total_amount",
            "sum",
            "net",
            "gross",
        ];

        for (key, value) in output {
            let normalized: String = key
                .to_lowercase()
                .chars()
                .filter(|c| *c != '_' && *c != '-')
                .collect();
            if !TOTAL_KEYS.contains(&normalized.as_str())
                && !TOTAL_KEYS.contains(&key.to_lowercase().as_str())
            {
                continue;
            }
            let Some(v) = value.as_f64() else { continue };
            if v <= 0.0 || prompt_numbers.is_empty() {
                continue;
            }

            let exact = prompt_numbers.iter().any(|n| (n - v).abs() < 0.01);
            let total_all: f64 = prompt_numbers.iter().sum();
            let is_sum = (v - total_all).abs() < 0.01;
            let close = prompt_numbers
                .iter()
                .any(|n| (v - n).abs() / n.max(0.01) < self.numeric_tolerance);

            if !exact && !is_sum && !close {
                let preview: Vec<f64> = prompt_numbers.iter().take(10).copied().collect();
                warnings.push(format!(
                    "Anti-hallucination: AI reported {key}={v} but source text contains \
                     numbers {preview:?}. The value may not match the actual data."
                ));
            }
        }

        const DETAIL_KEYS: [&str; 4] = ["details", "summary", "description", "notes"];
        let vague_patterns: Vec<Regex> = [
            r"(?i)^extracted data from",
            r"(?i)^three transactions",
            r"(?i)^multiple (receipts|invoices|documents)",
            r"(?i)^data extracted",
            r"(?i)^information from",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();

        for (key, value) in output {
            if !DETAIL_KEYS.contains(&key.to_lowercase().as_str()) {
                continue;
            }
            let Some(text) = value.as_str() else { continue };
            let trimmed = text.trim().trim_matches(|c| c == '\'' || c == '"');

            if trimmed.chars().count() < self.min_detail_chars {
                warnings.push(format!(
                    "Anti-hallucination: AI field '{key}' is suspiciously short: \
                     \"{trimmed}\". It may not reflect the actual extracted data."
                ));
            } else if vague_patterns.iter().any(|p| p.is_match(trimmed)) {
                let preview: String = trimmed.chars().take(80).collect();
                warnings.push(format!(
                    "Anti-hallucination: AI field '{key}' looks like a generic placeholder: \
                     \"{preview}...\". The AI may not have properly parsed the source data."
                ));
            }
        }

        warnings
    }
}

/// Extract and parse JSON from an LLM response
///
/// Tries, in order: direct parse, a markdown ```json fence, the first
/// balanced object/array in the text.
pub fn parse_json_response(content: &str) -> Result<Value, String> {
    let content = content.trim();
    if let Ok(value) = serde_json::from_str(content) {
        return Ok(value);
    }

    let fence_re = Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap();
    if let Some(caps) = fence_re.captures(content) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Ok(value);
        }
    }

    if let Some(block) = extract_first_json_block(content) {
        if let Ok(value) = serde_json::from_str(&block) {
            return Ok(value);
        }
    }

    Err("No JSON found in response".to_string())
}

/// First balanced `{...}` or `[...]` in a string, string-literal aware
fn extract_first_json_block(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let (start, open, close) = chars.iter().enumerate().find_map(|(i, c)| match c {
        '{' => Some((i, '{', '}')),
        '[' => Some((i, '[', ']')),
        _ => None,
    })?;

    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (j, &c) in chars.iter().enumerate().skip(start) {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(chars[start..=j].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

/// LLM-driven task: classification, extraction, generation, decisions
///
/// Config: `prompt`, `system_prompt`, `model`, `temperature`, `max_tokens`,
/// `output_format` (text|json|structured), `output_schema`, `include_history`.
pub struct AiTaskExecutor {
    deps: Arc<Dependencies>,
    plausibility: PlausibilityCheck,
}

impl AiTaskExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self {
            deps,
            plausibility: PlausibilityCheck::default(),
        })
    }

    pub fn with_plausibility(
        deps: Arc<Dependencies>,
        plausibility: PlausibilityCheck,
    ) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps, plausibility })
    }
}

#[async_trait]
impl NodeExecutor for AiTaskExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "prompt", "").is_empty() {
            return Some(ExecutionError::validation_error(
                "Prompt is required for AI task",
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
        let prompt_template = config_string_or(node, "prompt", "");
        let system_prompt = config_str(node, "system_prompt").map(str::to_string);
        let model = config_str(node, "model").map(str::to_string);
        let temperature = node.config_value("temperature").and_then(Value::as_f64);
        let max_tokens = node.config_value("max_tokens").and_then(Value::as_u64);
        let output_format = config_string_or(node, "output_format", "text");
        let output_schema = node.config_value("output_schema").cloned();
        let include_history = config_bool(node, "include_history", false);

        let mut logs = vec![format!("Executing AI task: {}", node.name)];

        let Some(llm) = self.deps.llm.clone() else {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Configuration,
                    "NO_LLM",
                    "LLM not configured for this process",
                )
                .with_business_message(format!(
                    "The AI step \"{}\" cannot run because no AI model is configured. \
                     Please contact your administrator to set up an AI model for this workflow.",
                    node.name
                ))
                .user_fixable(false)
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        };

        let mut prompt = match state.interpolate_string(&prompt_template) {
            Ok(prompt) => prompt,
            Err(e) => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!("Failed to interpolate prompt: {e}"))
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };
        let preview: String = prompt.chars().take(100).collect();
        logs.push(format!("Interpolated prompt: {preview}..."));

        let structured = output_format == "json"
            || output_format == "structured"
            || output_schema.is_some();
        if structured {
            match &output_schema {
                Some(schema) => {
                    prompt.push_str(&format!(
                        "\n\nRespond with valid JSON matching this schema:\n{}",
                        serde_json::to_string_pretty(schema).unwrap_or_default()
                    ));
                }
                None => prompt.push_str("\n\nRespond with valid JSON only."),
            }
        }

        let mut messages = Vec::new();
        if let Some(system) = &system_prompt {
            let system = state
                .interpolate_string(system)
                .unwrap_or_else(|_| system.clone());
            messages.push(ChatMessage::system(system));
        }
        if include_history {
            let history = &context.conversation_history;
            let skip = history.len().saturating_sub(10);
            messages.extend(history[skip..].iter().cloned());
        }
        messages.push(ChatMessage::user(prompt.clone()));

        let started = Instant::now();
        let response = match llm
            .chat(
                messages,
                ChatOptions {
                    temperature,
                    max_tokens,
                    model,
                },
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return NodeResult::failure(
                    ExecutionError::new(
                        ErrorCategory::External,
                        "LLM_ERROR",
                        format!("LLM call failed: {e}"),
                    )
                    .with_business_message(format!(
                        "The AI step \"{}\" could not process the request. This may be a \
                         temporary issue with the AI service. Please try again.",
                        node.name
                    ))
                    .user_fixable(false)
                    .retryable(true)
                    .with_retry_after(5)
                    .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        logs.push(format!("LLM response received in {duration_ms:.0}ms"));
        logs.push(format!("Tokens used: {}", response.total_tokens));

        let output = if structured {
            match parse_json_response(&response.content) {
                Ok(value) => value,
                Err(e) => {
                    // Invalid JSON is a hard failure: a "success" here lets
                    // downstream nodes see strings/nulls and fail obscurely.
                    let snippet: String = response.content.chars().take(800).collect();
                    logs.push(format!("JSON parse failed: {e}"));
                    return NodeResult::failure(
                        ExecutionError::new(
                            ErrorCategory::External,
                            "INVALID_JSON",
                            format!("AI task returned invalid JSON: {e}"),
                        )
                        .with_business_message(format!(
                            "The AI step \"{}\" could not produce structured data from the \
                             input. This may happen if the uploaded document or image was \
                             unclear, or the AI could not interpret it correctly.",
                            node.name
                        ))
                        .user_fixable(false)
                        .with_details(json!({
                            "node": node.name,
                            "output_format": output_format,
                            "snippet": snippet,
                        }))
                        .retryable(true)
                        .with_retry_after(2)
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs)
                    .with_duration_ms(duration_ms);
                }
            }
        } else {
            Value::String(response.content.clone())
        };

        if let Value::Object(map) = &output {
            logs.extend(self.plausibility.check(&prompt, map));
        }

        let mut result = NodeResult::success(output.clone())
            .with_duration_ms(duration_ms)
            .with_tokens(response.total_tokens)
            .with_logs(logs);
        if let Some(output_variable) = &node.output_variable {
            result = result.with_variable(output_variable.clone(), output);
        }
        result
    }
}

// ----- TOOL_CALL ----------------------------------------------------------

/// Invoke an injected platform tool
///
/// Authorization is checked before anything else: the context's deny list,
/// then its allow list. `requires_approval` turns the call into a waiting
/// approval with the interpolated arguments as review data.
pub struct ToolCallExecutor {
    deps: Arc<Dependencies>,
}

impl ToolCallExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }
}

#[async_trait]
impl NodeExecutor for ToolCallExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "tool_id", "").is_empty() {
            return Some(ExecutionError::validation_error("tool_id is required"));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let tool_id = config_string_or(node, "tool_id", "");
        let arguments = crate::executor::config_map(node, "arguments");
        let requires_approval = config_bool(node, "requires_approval", false);

        let mut logs = vec![format!("Executing tool: {tool_id}")];

        if context.denied_tool_ids.contains(&tool_id) {
            logs.push("Tool access denied by security policy".to_string());
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Authorization,
                    "TOOL_ACCESS_DENIED",
                    format!(
                        "Access denied: You do not have permission to use tool '{tool_id}'"
                    ),
                )
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        if !context.is_tool_allowed(&tool_id) {
            logs.push("Tool not in available tools list".to_string());
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Authorization,
                    "TOOL_NOT_AVAILABLE",
                    format!("Tool '{tool_id}' is not available in this execution context"),
                )
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        }

        let Some(tool) = self.deps.get_tool(&tool_id) else {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Resource,
                    "TOOL_NOT_FOUND",
                    format!("Tool not found: {tool_id}"),
                )
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        };

        let interpolated = match state.interpolate_value(&Value::Object(arguments)) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
            Err(e) => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!(
                        "Failed to interpolate arguments: {e}"
                    ))
                    .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };
        let args_preview: String = serde_json::to_string(&interpolated)
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        logs.push(format!("Arguments: {args_preview}"));

        if requires_approval {
            logs.push("Tool requires approval - pausing for approval".to_string());
            return NodeResult::waiting(
                WaitingKind::Approval,
                json!({
                    "tool_id": tool_id,
                    "arguments": interpolated,
                    "node_id": node.id,
                    "node_name": node.name,
                    "title": format!("Approval required: {}", node.name),
                    "review_data": { "tool_id": tool_id, "arguments": interpolated },
                }),
            )
            .with_logs(logs);
        }

        let started = Instant::now();
        let outcome = tool.execute(interpolated).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        logs.push(format!("Tool executed in {duration_ms:.0}ms"));

        if outcome.success {
            logs.push("Tool execution successful".to_string());
            let data = outcome.data.unwrap_or(Value::Null);
            let mut result = NodeResult::success(data.clone())
                .with_duration_ms(duration_ms)
                .with_logs(logs);
            if let Some(output_variable) = &node.output_variable {
                result = result.with_variable(output_variable.clone(), data);
            }
            result
        } else {
            let message = outcome
                .error
                .unwrap_or_else(|| "Tool execution failed".to_string());
            logs.push(format!("Tool execution failed: {message}"));
            NodeResult::failure(
                ExecutionError::new(ErrorCategory::External, "TOOL_ERROR", message)
                    .retryable(true)
                    .with_source_node(&node.id),
            )
            .with_duration_ms(duration_ms)
            .with_logs(logs)
        }
    }
}

// ----- SCRIPT -------------------------------------------------------------

/// Identifier patterns that must never appear in script code
const SCRIPT_DENYLIST: [&str; 20] = [
    r"__import__",
    r"__builtins__",
    r"__class__",
    r"__globals__",
    r"\bimport\b",
    r"\brequire\s*\(",
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bcompile\s*\(",
    r"\bopen\s*\(",
    r"\bos\.",
    r"\bsys\.",
    r"\bprocess\.",
    r"\bsubprocess\b",
    r"\bsocket\b",
    r"\brequests\b",
    r"\burllib\b",
    r"\bfetch\s*\(",
    r"\bpickle\b",
    r"\bchild_process\b",
];

/// Scope for script evaluation: named inputs plus line-local bindings
struct ScriptScope {
    bindings: Map<String, Value>,
}

impl VarScope for ScriptScope {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).cloned()
    }
}

/// User-provided computation in the safe expression subset
///
/// Code is a sequence of lines; each line is either `name = expression`
/// (binding a local) or a bare expression whose value becomes `result`.
/// The node returns the final `result` binding. A denylist rejects code
/// that mentions introspection, imports, I/O, or networking identifiers
/// before anything is evaluated.
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new(_deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self)
    }

    /// Run a transform script with pre-bound inputs (TRANSFORM `script` mode)
    pub(crate) fn run_for_transform(
        code: &str,
        inputs: Map<String, Value>,
    ) -> Result<Value, ExecutionError> {
        Self::run_script(code, inputs)
    }

    fn run_script(
        code: &str,
        inputs: Map<String, Value>,
    ) -> Result<Value, ExecutionError> {
        for pattern in SCRIPT_DENYLIST {
            let re = Regex::new(pattern).unwrap();
            if re.is_match(code) {
                return Err(ExecutionError::new(
                    ErrorCategory::Validation,
                    "SCRIPT_BLOCKED",
                    format!("Dangerous pattern detected: {pattern}"),
                )
                .with_business_message(
                    "The script step contains code that is not allowed for security reasons.",
                ));
            }
        }

        let mut scope = ScriptScope { bindings: inputs };
        scope
            .bindings
            .entry("result".to_string())
            .or_insert(Value::Null);

        let assignment = Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=([^=].*)$").unwrap();

        for line in code.lines().flat_map(|l| l.split(';')) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            if let Some(caps) = assignment.captures(line) {
                let name = caps[1].to_string();
                let value = expression::evaluate(caps[2].trim(), &scope).map_err(|e| {
                    ExecutionError::validation_error(format!("Script line failed: {e}"))
                })?;
                scope.bindings.insert(name, value);
            } else {
                let value = expression::evaluate(line, &scope).map_err(|e| {
                    ExecutionError::validation_error(format!("Script line failed: {e}"))
                })?;
                scope.bindings.insert("result".to_string(), value);
            }
        }

        Ok(scope.bindings.remove("result").unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodeExecutor for ScriptExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "code", "").is_empty() {
            return Some(ExecutionError::validation_error("Script code is required"));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let code = config_string_or(node, "code", "");
        let inputs = crate::executor::config_map(node, "inputs");

        let mut logs = vec!["Executing script".to_string()];

        let mut input_values = Map::new();
        for (name, source) in &inputs {
            let value = match source {
                Value::String(expr) => state.evaluate(expr).unwrap_or(Value::Null),
                other => other.clone(),
            };
            input_values.insert(name.clone(), value);
        }
        logs.push(format!(
            "Input variables: {:?}",
            input_values.keys().collect::<Vec<_>>()
        ));

        let started = Instant::now();
        match Self::run_script(&code, input_values) {
            Ok(result_value) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                logs.push(format!("Script executed in {duration_ms:.0}ms"));

                let mut result = NodeResult::success(result_value.clone())
                    .with_duration_ms(duration_ms)
                    .with_logs(logs);
                if let Some(output_variable) = &node.output_variable {
                    result = result.with_variable(output_variable.clone(), result_value);
                }
                result
            }
            Err(error) => {
                NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, NodeType};
    use crate::deps::DependencyError;
    use crate::llm::{ChatModel, ChatResponse};
    use crate::tool::{Tool, ToolOutcome};

    struct StubLlm {
        reply: String,
        tokens: u64,
    }

    #[async_trait]
    impl ChatModel for StubLlm {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, DependencyError> {
            Ok(ChatResponse {
                content: self.reply.clone(),
                total_tokens: self.tokens,
            })
        }
    }

    struct StubTool {
        outcome: ToolOutcome,
    }

    #[async_trait]
    impl Tool for StubTool {
        async fn execute(&self, _args: Map<String, Value>) -> ToolOutcome {
            self.outcome.clone()
        }
    }

    fn make_node(node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: "t1".to_string(),
            node_type,
            name: "task".to_string(),
            config: NodeConfig {
                type_config: type_config.as_object().cloned().unwrap_or_default(),
                ..NodeConfig::default()
            },
            input_mapping: None,
            output_variable: Some("out".to_string()),
            next: None,
        }
    }

    #[tokio::test]
    async fn test_ai_task_text_output() {
        let deps = Arc::new(Dependencies::new().with_llm(Arc::new(StubLlm {
            reply: "hello world".to_string(),
            tokens: 12,
        })));
        let node = make_node(NodeType::AiTask, json!({"prompt": "Say {{x}}"}));
        let mut state = ProcessState::default();
        state.set("x", json!("hello"), "start");

        let result = AiTaskExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!("hello world")));
        assert_eq!(result.tokens_used, 12);
        assert_eq!(result.variables_update["out"], json!("hello world"));
    }

    #[tokio::test]
    async fn test_ai_task_no_llm() {
        let node = make_node(NodeType::AiTask, json!({"prompt": "hi"}));
        let mut state = ProcessState::default();

        let result = AiTaskExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.error.unwrap().code, "NO_LLM");
    }

    #[tokio::test]
    async fn test_ai_task_json_parses_fenced_output() {
        let deps = Arc::new(Dependencies::new().with_llm(Arc::new(StubLlm {
            reply: "Here you go:\n```json\n{\"total\": 42}\n```".to_string(),
            tokens: 5,
        })));
        let node = make_node(
            NodeType::AiTask,
            json!({"prompt": "extract 42", "output_format": "json"}),
        );
        let mut state = ProcessState::default();

        let result = AiTaskExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.output, Some(json!({"total": 42})));
    }

    #[tokio::test]
    async fn test_ai_task_invalid_json_is_retryable_failure() {
        let deps = Arc::new(Dependencies::new().with_llm(Arc::new(StubLlm {
            reply: "I could not find any structured data".to_string(),
            tokens: 5,
        })));
        let node = make_node(
            NodeType::AiTask,
            json!({"prompt": "extract", "output_format": "json"}),
        );
        let mut state = ProcessState::default();

        let result = AiTaskExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.code, "INVALID_JSON");
        assert!(error.is_retryable);
        assert!(error.business_message.is_some());
    }

    #[tokio::test]
    async fn test_ai_task_hallucination_warning() {
        let deps = Arc::new(Dependencies::new().with_llm(Arc::new(StubLlm {
            reply: r#"{"totalAmount": 9999, "details": "short"}"#.to_string(),
            tokens: 5,
        })));
        let node = make_node(
            NodeType::AiTask,
            json!({"prompt": "Receipts: 10.50 and 20.25", "output_format": "json"}),
        );
        let mut state = ProcessState::default();

        let result = AiTaskExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        let warnings: Vec<&String> = result
            .logs
            .iter()
            .filter(|l| l.contains("Anti-hallucination"))
            .collect();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_plausibility_accepts_sum_and_tolerance() {
        let check = PlausibilityCheck::default();
        let prompt = "Invoice lines: 10.00, 20.00, 30.00";

        let exact_sum = json!({"total": 60.0});
        assert!(check.check(prompt, exact_sum.as_object().unwrap()).is_empty());

        let within_tolerance = json!({"total": 29.0});
        assert!(check
            .check(prompt, within_tolerance.as_object().unwrap())
            .is_empty());

        let fabricated = json!({"total": 500.0});
        assert_eq!(check.check(prompt, fabricated.as_object().unwrap()).len(), 1);
    }

    #[test]
    fn test_plausibility_flags_generic_placeholder() {
        let check = PlausibilityCheck::default();
        let output = json!({"summary": "Extracted data from the uploaded documents"});
        assert_eq!(check.check("totals: 5", output.as_object().unwrap()).len(), 1);
    }

    #[test]
    fn test_parse_json_balanced_block() {
        let content = "The answer is {\"a\": [1, 2], \"note\": \"has } in string\"} trailing";
        let value = parse_json_response(content).unwrap();
        assert_eq!(value["a"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_tool_call_denied() {
        let deps = Arc::new(Dependencies::new().with_tool(
            "t",
            Arc::new(StubTool {
                outcome: ToolOutcome::ok(json!(1)),
            }),
        ));
        let node = make_node(NodeType::ToolCall, json!({"tool_id": "t"}));
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1").with_denied_tools(["t".to_string()]);

        let result = ToolCallExecutor::new(deps)
            .execute(&node, &mut state, &ctx)
            .await;
        assert_eq!(result.error.unwrap().code, "TOOL_ACCESS_DENIED");
    }

    #[tokio::test]
    async fn test_tool_call_requires_approval_waits() {
        let deps = Arc::new(Dependencies::new().with_tool(
            "t",
            Arc::new(StubTool {
                outcome: ToolOutcome::ok(json!(1)),
            }),
        ));
        let node = make_node(
            NodeType::ToolCall,
            json!({"tool_id": "t", "requires_approval": true, "arguments": {"q": "{{x}}"}}),
        );
        let mut state = ProcessState::default();
        state.set("x", json!("find"), "start");

        let result = ToolCallExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_waiting());
        assert_eq!(result.waiting_for, Some(WaitingKind::Approval));
        let metadata = result.waiting_metadata.unwrap();
        assert_eq!(metadata["arguments"]["q"], json!("find"));
    }

    #[tokio::test]
    async fn test_tool_call_success_writes_output_variable() {
        let deps = Arc::new(Dependencies::new().with_tool(
            "t",
            Arc::new(StubTool {
                outcome: ToolOutcome::ok(json!({"rows": 3})),
            }),
        ));
        let node = make_node(NodeType::ToolCall, json!({"tool_id": "t"}));
        let mut state = ProcessState::default();

        let result = ToolCallExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.variables_update["out"], json!({"rows": 3}));
    }

    #[tokio::test]
    async fn test_tool_call_failure_is_retryable() {
        let deps = Arc::new(Dependencies::new().with_tool(
            "t",
            Arc::new(StubTool {
                outcome: ToolOutcome::failed("upstream 500"),
            }),
        ));
        let node = make_node(NodeType::ToolCall, json!({"tool_id": "t"}));
        let mut state = ProcessState::default();

        let result = ToolCallExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.code, "TOOL_ERROR");
        assert!(error.is_retryable);
    }

    #[tokio::test]
    async fn test_script_assignments_and_result() {
        let node = make_node(
            NodeType::Script,
            json!({
                "code": "doubled = n * 2\nresult = doubled + 1",
                "inputs": {"n": "{{count}}"}
            }),
        );
        let mut state = ProcessState::default();
        state.set("count", json!(10), "start");

        let result = ScriptExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert_eq!(result.output, Some(json!(21)));
        assert_eq!(result.variables_update["out"], json!(21));
    }

    #[tokio::test]
    async fn test_script_bare_expression_is_result() {
        let node = make_node(
            NodeType::Script,
            json!({"code": "sum([1, 2, 3])", "inputs": {}}),
        );
        let mut state = ProcessState::default();

        let result = ScriptExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.output, Some(json!(6)));
    }

    #[tokio::test]
    async fn test_script_denylist_blocks() {
        for code in [
            "__import__('os')",
            "import os",
            "eval('1+1')",
            "open('/etc/passwd')",
            "os.system('ls')",
            "require('fs')",
            "fetch('http://x')",
        ] {
            let node = make_node(NodeType::Script, json!({"code": code, "inputs": {}}));
            let mut state = ProcessState::default();
            let result = ScriptExecutor::new(Arc::new(Dependencies::new()))
                .execute(&node, &mut state, &ProcessContext::new("e1"))
                .await;
            assert!(
                result.is_failure(),
                "expected denylist rejection for: {code}"
            );
            assert_eq!(result.error.unwrap().code, "SCRIPT_BLOCKED");
        }
    }
}
