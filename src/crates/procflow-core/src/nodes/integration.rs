//! Integration executors: HTTP_REQUEST, DATABASE_QUERY, FILE_OPERATION,
//! MESSAGE_QUEUE
//!
//! Everything here talks to the outside world through the injected
//! dependency bundle. File operations are confined to the execution-scoped
//! output directory; rich-format extraction and document rendering are
//! consumed capabilities (injected traits), with plain text and CSV handled
//! natively and images delegated to a vision-capable chat model.

use crate::context::ProcessContext;
use crate::definition::ProcessNode;
use crate::deps::{
    Dependencies, DependencyError, DocumentFormat, HttpBody, HttpClient, HttpRequestSpec,
    QueueKind, ReqwestHttpClient,
};
use crate::error::{ErrorCategory, ExecutionError};
use crate::executor::{config_bool, config_str, config_string_or, config_u64, NodeExecutor};
use crate::llm::{ChatMessage, ChatOptions};
use crate::result::NodeResult;
use crate::state::ProcessState;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----- HTTP_REQUEST -------------------------------------------------------

const DEFAULT_SUCCESS_CODES: [u16; 4] = [200, 201, 202, 204];
const RETRYABLE_HTTP: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Call an external HTTP API
///
/// Config: `method`, `url`, `headers`, `body`, `auth_type`
/// (none|bearer|basic|api_key) + `auth_config`, `response_type`
/// (json|text|binary), `success_codes`, `verify_ssl`, `timeout_seconds`.
pub struct HttpRequestExecutor {
    http: Arc<dyn HttpClient>,
}

impl HttpRequestExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self {
            http: deps
                .http
                .clone()
                .unwrap_or_else(|| Arc::new(ReqwestHttpClient)),
        })
    }

    fn add_auth(
        headers: &mut Vec<(String, String)>,
        auth_type: &str,
        auth_config: &Map<String, Value>,
        state: &ProcessState,
    ) -> Result<(), ExecutionError> {
        let get = |key: &str| -> String {
            let raw = auth_config
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default();
            state
                .interpolate_string(raw)
                .unwrap_or_else(|_| raw.to_string())
        };

        match auth_type {
            "none" | "" => {}
            "bearer" => {
                headers.push(("Authorization".to_string(), format!("Bearer {}", get("token"))));
            }
            "basic" => {
                let credentials = format!("{}:{}", get("username"), get("password"));
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                headers.push(("Authorization".to_string(), format!("Basic {encoded}")));
            }
            "api_key" => {
                let key_name = auth_config
                    .get("key_name")
                    .and_then(Value::as_str)
                    .unwrap_or("X-API-Key")
                    .to_string();
                headers.push((key_name, get("key_value")));
            }
            other => {
                return Err(ExecutionError::new(
                    ErrorCategory::Authentication,
                    "AUTH_CONFIG_ERROR",
                    format!("Unknown auth type: {other}"),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeExecutor for HttpRequestExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "url", "").is_empty() {
            return Some(ExecutionError::validation_error("URL is required"));
        }
        let method = config_string_or(node, "method", "GET").to_uppercase();
        if !["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
            .contains(&method.as_str())
        {
            return Some(ExecutionError::validation_error(format!(
                "Invalid HTTP method: {method}"
            )));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let method = config_string_or(node, "method", "GET").to_uppercase();
        let url_template = config_string_or(node, "url", "");
        let header_config = crate::executor::config_map(node, "headers");
        let body = node.config_value("body").cloned();
        let auth_type = config_string_or(node, "auth_type", "none");
        let auth_config = crate::executor::config_map(node, "auth_config");
        let response_type = config_string_or(node, "response_type", "json");
        let success_codes: Vec<u16> = node
            .config_value("success_codes")
            .and_then(Value::as_array)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|c| c as u16)
                    .collect()
            })
            .unwrap_or_else(|| DEFAULT_SUCCESS_CODES.to_vec());
        let verify_ssl = config_bool(node, "verify_ssl", true);
        let timeout_seconds = config_u64(node, "timeout_seconds", 30);

        let mut logs = vec![format!("HTTP {method} request")];

        let url = match state.interpolate_string(&url_template) {
            Ok(url) => url,
            Err(e) => {
                return NodeResult::failure(
                    ExecutionError::validation_error(format!("Failed to interpolate URL: {e}"))
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
        };
        logs.push(format!("URL: {url}"));

        let mut headers: Vec<(String, String)> = Vec::with_capacity(header_config.len());
        for (name, value) in &header_config {
            let raw = crate::expression::eval::stringify(value);
            match state.interpolate_string(&raw) {
                Ok(value) => headers.push((name.clone(), value)),
                Err(e) => {
                    return NodeResult::failure(
                        ExecutionError::validation_error(format!(
                            "Failed to interpolate headers: {e}"
                        ))
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                }
            }
        }

        if let Err(error) = Self::add_auth(&mut headers, &auth_type, &auth_config, state) {
            return NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs);
        }

        let request_body = if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            match body {
                Some(Value::String(raw)) => {
                    let interpolated = state
                        .interpolate_string(&raw)
                        .unwrap_or_else(|_| raw.clone());
                    logs.push("Body interpolated".to_string());
                    Some(HttpBody::Raw(interpolated))
                }
                Some(value) if !value.is_null() => match state.interpolate_value(&value) {
                    Ok(interpolated) => {
                        logs.push("Body interpolated".to_string());
                        Some(HttpBody::Json(interpolated))
                    }
                    Err(e) => {
                        return NodeResult::failure(
                            ExecutionError::validation_error(format!(
                                "Failed to interpolate body: {e}"
                            ))
                            .with_source_node(&node.id),
                        )
                        .with_logs(logs);
                    }
                },
                _ => None,
            }
        } else {
            None
        };

        let started = Instant::now();
        let response = self
            .http
            .request(HttpRequestSpec {
                method: method.clone(),
                url: url.clone(),
                headers,
                body: request_body,
                verify_ssl,
                timeout: Duration::from_secs(timeout_seconds),
            })
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let category = match &e {
                    DependencyError::Timeout(_) => ErrorCategory::Timeout,
                    _ => ErrorCategory::Connection,
                };
                return NodeResult::failure(
                    ExecutionError::new(category, "HTTP_ERROR", format!("HTTP request failed: {e}"))
                        .retryable(true)
                        .with_retry_after(5)
                        .with_source_node(&node.id),
                )
                .with_duration_ms(duration_ms)
                .with_logs(logs);
            }
        };

        logs.push(format!(
            "Response: {} in {duration_ms:.0}ms",
            response.status
        ));

        let response_data = match response_type.as_str() {
            "binary" => {
                json!(base64::engine::general_purpose::STANDARD.encode(&response.body))
            }
            "text" => json!(response.body_text()),
            _ => {
                let text = response.body_text();
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
        };
        let response_headers: Map<String, Value> = response
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();

        if success_codes.contains(&response.status) {
            let output = json!({
                "status_code": response.status,
                "data": response_data,
                "headers": response_headers,
            });
            let mut result = NodeResult::success(output)
                .with_duration_ms(duration_ms)
                .with_logs(logs);
            if let Some(output_variable) = &node.output_variable {
                result = result.with_variable(output_variable.clone(), response_data);
            }
            result
        } else {
            let preview: String = crate::expression::eval::stringify(&response_data)
                .chars()
                .take(500)
                .collect();
            let mut error = ExecutionError::new(
                ErrorCategory::External,
                format!("HTTP_{}", response.status),
                format!("HTTP request failed with status {}", response.status),
            )
            .with_details(json!({ "status_code": response.status, "response": preview }))
            .retryable(RETRYABLE_HTTP.contains(&response.status))
            .with_source_node(&node.id);
            if error.is_retryable {
                error = error.with_retry_after(5);
            }
            NodeResult::failure(error)
                .with_duration_ms(duration_ms)
                .with_logs(logs)
        }
    }
}

// ----- DATABASE_QUERY -----------------------------------------------------

/// Render a JSON value as a SQL literal, escaping single quotes
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Run a query or a structured mutation against an injected connection
///
/// Config: `connection_id`, `operation` (query|insert|update|delete),
/// `query` (interpolated SQL) or `table` + `data`/`where`, `max_rows`.
pub struct DatabaseQueryExecutor {
    deps: Arc<Dependencies>,
}

impl DatabaseQueryExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }

    fn build_statement(
        operation: &str,
        table: &str,
        data: &Map<String, Value>,
        filter: &Map<String, Value>,
    ) -> Result<String, ExecutionError> {
        if table.is_empty() {
            return Err(ExecutionError::validation_error(
                "table is required for structured operations",
            ));
        }
        let where_clause = || -> Result<String, ExecutionError> {
            if filter.is_empty() {
                return Err(ExecutionError::validation_error(
                    "a where clause is required",
                ));
            }
            Ok(filter
                .iter()
                .map(|(column, value)| format!("{column} = {}", sql_literal(value)))
                .collect::<Vec<_>>()
                .join(" AND "))
        };

        match operation {
            "insert" => {
                if data.is_empty() {
                    return Err(ExecutionError::validation_error("data is required for insert"));
                }
                let columns: Vec<&str> = data.keys().map(String::as_str).collect();
                let values: Vec<String> = data.values().map(sql_literal).collect();
                Ok(format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    columns.join(", "),
                    values.join(", ")
                ))
            }
            "update" => {
                if data.is_empty() {
                    return Err(ExecutionError::validation_error("data is required for update"));
                }
                let assignments: Vec<String> = data
                    .iter()
                    .map(|(column, value)| format!("{column} = {}", sql_literal(value)))
                    .collect();
                Ok(format!(
                    "UPDATE {table} SET {} WHERE {}",
                    assignments.join(", "),
                    where_clause()?
                ))
            }
            "delete" => Ok(format!("DELETE FROM {table} WHERE {}", where_clause()?)),
            other => Err(ExecutionError::validation_error(format!(
                "Unknown operation: {other}"
            ))),
        }
    }
}

#[async_trait]
impl NodeExecutor for DatabaseQueryExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if config_string_or(node, "connection_id", "").is_empty() {
            return Some(ExecutionError::validation_error("connection_id is required"));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let connection_id = config_string_or(node, "connection_id", "");
        let operation = config_string_or(node, "operation", "query");
        let max_rows = config_u64(node, "max_rows", 100) as usize;

        let mut logs = vec![format!("Database {operation} via {connection_id}")];

        let Some(connection) = self.deps.get_db_connection(&connection_id) else {
            return NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::Connection,
                    "DB_CONNECTION_NOT_FOUND",
                    format!("Database connection not found: {connection_id}"),
                )
                .with_source_node(&node.id),
            )
            .with_logs(logs);
        };
        logs.push(format!(
            "Dialect: {:?}",
            connection.descriptor().kind
        ));

        let started = Instant::now();
        let outcome: Result<Value, DependencyError> = if operation == "query" {
            let query = config_string_or(node, "query", "");
            if query.is_empty() {
                return NodeResult::failure(
                    ExecutionError::validation_error("query is required")
                        .with_source_node(&node.id),
                )
                .with_logs(logs);
            }
            let sql = match state.interpolate_string(&query) {
                Ok(sql) => sql,
                Err(e) => {
                    return NodeResult::failure(
                        ExecutionError::validation_error(format!(
                            "Failed to interpolate query: {e}"
                        ))
                        .with_source_node(&node.id),
                    )
                    .with_logs(logs);
                }
            };
            connection.query(&sql, max_rows).await.map(|rows| {
                logs.push(format!("Returned {} rows", rows.len()));
                json!(rows)
            })
        } else {
            let table = config_string_or(node, "table", "");
            let data = match state
                .interpolate_value(&Value::Object(crate::executor::config_map(node, "data")))
            {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            let filter = match state
                .interpolate_value(&Value::Object(crate::executor::config_map(node, "where")))
            {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };

            match Self::build_statement(&operation, &table, &data, &filter) {
                Ok(sql) => connection.execute(&sql).await.map(|affected| {
                    logs.push(format!("Affected {affected} rows"));
                    json!({ "affected_rows": affected })
                }),
                Err(error) => {
                    return NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs);
                }
            }
        };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(output) => {
                let mut result = NodeResult::success(output.clone())
                    .with_duration_ms(duration_ms)
                    .with_logs(logs);
                if let Some(output_variable) = &node.output_variable {
                    result = result.with_variable(output_variable.clone(), output);
                }
                result
            }
            Err(e) => NodeResult::failure(
                ExecutionError::new(
                    ErrorCategory::External,
                    "DB_ERROR",
                    format!("Database operation failed: {e}"),
                )
                .retryable(matches!(
                    e,
                    DependencyError::Connection(_) | DependencyError::Timeout(_)
                ))
                .with_source_node(&node.id),
            )
            .with_duration_ms(duration_ms)
            .with_logs(logs),
        }
    }
}

// ----- FILE_OPERATION -----------------------------------------------------

/// Plain-text MIME families handled without the injected extractor
fn is_plain_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime == "application/json"
        || mime == "application/csv"
        || mime == "text/csv"
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "txt" | "md" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// File operations scoped to the execution's output directory
///
/// Operations: read, write, delete, list, exists, extract_text,
/// generate_document.
pub struct FileOperationExecutor {
    deps: Arc<Dependencies>,
}

impl FileOperationExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        Arc::new(Self { deps })
    }

    /// Base directory for this execution's files
    fn base_dir(&self, context: &ProcessContext) -> PathBuf {
        context
            .output_dir
            .clone()
            .or_else(|| {
                self.deps
                    .output_root
                    .as_ref()
                    .map(|root| root.join(&context.execution_id))
            })
            .unwrap_or_else(|| std::env::temp_dir().join("procflow").join(&context.execution_id))
    }

    /// Resolve a path under the execution directory; traversal is rejected
    fn resolve_path(
        &self,
        raw: &str,
        context: &ProcessContext,
    ) -> Result<PathBuf, ExecutionError> {
        let candidate = Path::new(raw);
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ExecutionError::validation_error(format!(
                "Path must not contain '..': {raw}"
            )));
        }
        let base = self.base_dir(context);
        if candidate.is_absolute() {
            if candidate.starts_with(&base) {
                Ok(candidate.to_path_buf())
            } else {
                Err(ExecutionError::validation_error(format!(
                    "Path is outside the execution directory: {raw}"
                )))
            }
        } else {
            Ok(base.join(candidate))
        }
    }

    async fn extract_one(
        &self,
        path: &Path,
        mime: &str,
        logs: &mut Vec<String>,
    ) -> Result<String, ExecutionError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ExecutionError::new(
                ErrorCategory::Resource,
                "FILE_NOT_FOUND",
                format!("File not found: {}", path.display()),
            ));
        }

        if is_plain_text_mime(mime) {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                ExecutionError::new(
                    ErrorCategory::External,
                    "EXTRACTION_FAILED",
                    format!("Failed to read {}: {e}", path.display()),
                )
            })?;
            logs.push(format!(
                "Extracted {} chars from {}",
                content.len(),
                path.display()
            ));
            return Ok(content);
        }

        if mime.starts_with("image/") {
            let Some(llm) = self.deps.llm.clone().filter(|llm| llm.supports_vision()) else {
                return Err(ExecutionError::new(
                    ErrorCategory::External,
                    "EXTRACTION_FAILED",
                    "Image extraction requires a vision-capable model",
                ));
            };
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                ExecutionError::new(
                    ErrorCategory::External,
                    "EXTRACTION_FAILED",
                    format!("Failed to read {}: {e}", path.display()),
                )
            })?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            let prompt = format!(
                "Extract all text from this image. Return only the extracted text.\n\
                 data:{mime};base64,{encoded}"
            );
            let response = llm
                .chat(vec![ChatMessage::user(prompt)], ChatOptions::default())
                .await
                .map_err(|e| {
                    ExecutionError::new(
                        ErrorCategory::External,
                        "EXTRACTION_FAILED",
                        format!("Vision extraction failed: {e}"),
                    )
                })?;
            logs.push(format!("Vision extraction from {}", path.display()));
            return Ok(response.content);
        }

        let Some(extractor) = &self.deps.extractor else {
            return Err(ExecutionError::new(
                ErrorCategory::External,
                "EXTRACTION_FAILED",
                format!("No extractor available for {mime}"),
            ));
        };
        let content = extractor.extract_text(path, mime).await.map_err(|e| {
            ExecutionError::new(
                ErrorCategory::External,
                "EXTRACTION_FAILED",
                format!("Extraction failed for {}: {e}", path.display()),
            )
        })?;
        logs.push(format!(
            "Extracted {} chars from {}",
            content.len(),
            path.display()
        ));
        Ok(content)
    }

    /// File references for extraction: a single `file`, a `files` array, or
    /// a template-resolved `path`
    fn extraction_sources(
        &self,
        node: &ProcessNode,
        state: &ProcessState,
        context: &ProcessContext,
    ) -> Result<Vec<(PathBuf, String)>, ExecutionError> {
        let mut sources = Vec::new();

        let mut push_ref = |file: &Value| -> Result<(), ExecutionError> {
            let Some(map) = file.as_object() else {
                return Ok(());
            };
            let path = map
                .get("path")
                .or_else(|| map.get("file_path"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ExecutionError::validation_error("file reference is missing a path")
                })?;
            let path = PathBuf::from(path);
            let mime = map
                .get("mime_type")
                .or_else(|| map.get("content_type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| guess_mime(&path).to_string());
            sources.push((path, mime));
            Ok(())
        };

        if let Some(file) = node.config_value("file") {
            push_ref(file)?;
        }
        if let Some(files) = node.config_value("files").and_then(Value::as_array) {
            for file in files {
                push_ref(file)?;
            }
        }
        if sources.is_empty() {
            let raw = config_string_or(node, "path", "");
            if !raw.is_empty() {
                let raw = state.interpolate_string(&raw).unwrap_or(raw);
                let path = self.resolve_path(&raw, context)?;
                let mime = guess_mime(&path).to_string();
                sources.push((path, mime));
            }
        }

        if sources.is_empty() {
            return Err(ExecutionError::validation_error(
                "extract_text requires a file, files, or path",
            ));
        }
        Ok(sources)
    }

    async fn generate_document(
        &self,
        node: &ProcessNode,
        state: &ProcessState,
        context: &ProcessContext,
        logs: &mut Vec<String>,
    ) -> Result<Value, ExecutionError> {
        let format_str = config_string_or(node, "format", "txt");
        let format: DocumentFormat =
            serde_json::from_value(json!(format_str)).map_err(|_| {
                ExecutionError::validation_error(format!("Unknown document format: {format_str}"))
            })?;
        let title = {
            let raw = config_string_or(node, "title", &node.name);
            state.interpolate_string(&raw).unwrap_or(raw)
        };
        let instructions = {
            let raw = config_string_or(node, "instructions", "");
            state.interpolate_string(&raw).unwrap_or(raw)
        };
        let explicit_content = config_str(node, "content").map(str::to_string);

        // Content: explicit config, else drafted by the model, else the
        // instructions themselves
        let content = match explicit_content {
            Some(content) => state.interpolate_string(&content).unwrap_or(content),
            None => match (&self.deps.llm, instructions.is_empty()) {
                (Some(llm), false) => {
                    let response = llm
                        .chat(
                            vec![
                                ChatMessage::system(
                                    "Write the document content as plain structured text.",
                                ),
                                ChatMessage::user(instructions.clone()),
                            ],
                            ChatOptions::default(),
                        )
                        .await
                        .map_err(|e| {
                            ExecutionError::new(
                                ErrorCategory::External,
                                "LLM_ERROR",
                                format!("Document drafting failed: {e}"),
                            )
                            .retryable(true)
                        })?;
                    logs.push("Content drafted by model".to_string());
                    response.content
                }
                _ => instructions.clone(),
            },
        };

        let safe_title: String = title
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let filename = format!("{}.{}", safe_title.trim_matches('_'), format.extension());
        let dir = self.base_dir(context);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ExecutionError::internal_error(format!("Failed to create output dir: {e}"))
        })?;
        let path = dir.join(&filename);

        let size = match format {
            DocumentFormat::Txt => {
                let body = format!("{title}\n\n{content}");
                tokio::fs::write(&path, &body).await.map_err(|e| {
                    ExecutionError::internal_error(format!("Failed to write document: {e}"))
                })?;
                body.len() as u64
            }
            other => {
                let Some(renderer) = &self.deps.renderer else {
                    return Err(ExecutionError::new(
                        ErrorCategory::Configuration,
                        "UNSUPPORTED_STORAGE",
                        format!("No renderer available for {format_str}"),
                    ));
                };
                renderer
                    .render(other, &title, &content, &path)
                    .await
                    .map_err(|e| {
                        ExecutionError::new(
                            ErrorCategory::External,
                            "RENDER_FAILED",
                            format!("Document rendering failed: {e}"),
                        )
                    })?
            }
        };
        logs.push(format!("Generated {} ({size} bytes)", path.display()));

        Ok(json!({
            "title": title,
            "format": format_str,
            "path": path.to_string_lossy(),
            "filename": filename,
            "size": size,
        }))
    }
}

#[async_trait]
impl NodeExecutor for FileOperationExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        let operation = config_string_or(node, "operation", "");
        if operation.is_empty() {
            return Some(ExecutionError::validation_error("operation is required"));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult {
        let operation = config_string_or(node, "operation", "read");
        let mut logs = vec![format!("File operation: {operation}")];

        let resolve = |raw: &str, state: &ProcessState| -> Result<PathBuf, ExecutionError> {
            let interpolated = state
                .interpolate_string(raw)
                .unwrap_or_else(|_| raw.to_string());
            self.resolve_path(&interpolated, context)
        };

        let outcome: Result<Value, ExecutionError> = match operation.as_str() {
            "read" => {
                let raw = config_string_or(node, "path", "");
                match resolve(&raw, state) {
                    Ok(path) => match tokio::fs::read_to_string(&path).await {
                        Ok(content) => Ok(json!({
                            "content": content,
                            "path": path.to_string_lossy(),
                            "size": content.len(),
                        })),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            Err(ExecutionError::new(
                                ErrorCategory::Resource,
                                "FILE_NOT_FOUND",
                                format!("File not found: {}", path.display()),
                            ))
                        }
                        Err(e) => Err(ExecutionError::internal_error(format!(
                            "Failed to read file: {e}"
                        ))),
                    },
                    Err(error) => Err(error),
                }
            }
            "write" => {
                let raw = config_string_or(node, "path", "");
                let content = match node.config_value("content") {
                    Some(Value::String(s)) => state
                        .interpolate_string(s)
                        .unwrap_or_else(|_| s.clone()),
                    Some(other) => state
                        .interpolate_value(other)
                        .map(|v| serde_json::to_string_pretty(&v).unwrap_or_default())
                        .unwrap_or_default(),
                    None => String::new(),
                };
                match resolve(&raw, state) {
                    Ok(path) => {
                        let write = async {
                            if let Some(parent) = path.parent() {
                                tokio::fs::create_dir_all(parent).await?;
                            }
                            tokio::fs::write(&path, &content).await
                        };
                        match write.await {
                            Ok(()) => Ok(json!({
                                "path": path.to_string_lossy(),
                                "size": content.len(),
                            })),
                            Err(e) => Err(ExecutionError::internal_error(format!(
                                "Failed to write file: {e}"
                            ))),
                        }
                    }
                    Err(error) => Err(error),
                }
            }
            "delete" => {
                let raw = config_string_or(node, "path", "");
                match resolve(&raw, state) {
                    Ok(path) => match tokio::fs::remove_file(&path).await {
                        Ok(()) => Ok(json!({ "deleted": true, "path": path.to_string_lossy() })),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            Ok(json!({ "deleted": false, "path": path.to_string_lossy() }))
                        }
                        Err(e) => Err(ExecutionError::internal_error(format!(
                            "Failed to delete file: {e}"
                        ))),
                    },
                    Err(error) => Err(error),
                }
            }
            "exists" => {
                let raw = config_string_or(node, "path", "");
                match resolve(&raw, state) {
                    Ok(path) => Ok(json!({
                        "exists": tokio::fs::try_exists(&path).await.unwrap_or(false),
                        "path": path.to_string_lossy(),
                    })),
                    Err(error) => Err(error),
                }
            }
            "list" => {
                let raw = config_string_or(node, "path", ".");
                match resolve(&raw, state) {
                    Ok(path) => match tokio::fs::read_dir(&path).await {
                        Ok(mut entries) => {
                            let mut names = Vec::new();
                            while let Ok(Some(entry)) = entries.next_entry().await {
                                names.push(json!(entry.file_name().to_string_lossy()));
                            }
                            Ok(json!({ "entries": names, "count": names.len() }))
                        }
                        Err(e) => Err(ExecutionError::new(
                            ErrorCategory::Resource,
                            "FILE_NOT_FOUND",
                            format!("Failed to list {}: {e}", path.display()),
                        )),
                    },
                    Err(error) => Err(error),
                }
            }
            "extract_text" => {
                match self.extraction_sources(node, state, context) {
                    Ok(sources) => {
                        let mut pieces = Vec::new();
                        let mut failure = None;
                        for (path, mime) in &sources {
                            match self.extract_one(path, mime, &mut logs).await {
                                Ok(text) => pieces.push(text),
                                Err(error) => {
                                    failure = Some(error);
                                    break;
                                }
                            }
                        }
                        match failure {
                            Some(error) => Err(error),
                            None => {
                                let combined = pieces.join("\n\n");
                                if combined.trim().is_empty() {
                                    // An empty extraction poisons everything
                                    // downstream; fail loudly instead.
                                    Err(ExecutionError::new(
                                        ErrorCategory::External,
                                        "EXTRACTION_FAILED",
                                        "Extraction produced no text",
                                    )
                                    .with_business_message(
                                        "Could not read content from the uploaded file. The \
                                         file may be corrupted or in an unsupported format.",
                                    ))
                                } else {
                                    Ok(json!({
                                        "text": combined,
                                        "sources": sources.len(),
                                        "chars": combined.len(),
                                    }))
                                }
                            }
                        }
                    }
                    Err(error) => Err(error),
                }
            }
            "generate_document" => {
                self.generate_document(node, state, context, &mut logs).await
            }
            other => Err(ExecutionError::new(
                ErrorCategory::Configuration,
                "UNSUPPORTED_STORAGE",
                format!("Unknown file operation: {other}"),
            )),
        };

        match outcome {
            Ok(output) => {
                let mut result = NodeResult::success(output.clone()).with_logs(logs);
                if let Some(output_variable) = &node.output_variable {
                    result = result.with_variable(output_variable.clone(), output);
                }
                result
            }
            Err(error) => {
                NodeResult::failure(error.with_source_node(&node.id)).with_logs(logs)
            }
        }
    }
}

// ----- MESSAGE_QUEUE ------------------------------------------------------

/// Publish a message to a webhook, Redis pub/sub, or SQS
///
/// Webhook publishing goes through the HTTP client; broker-backed kinds go
/// through the injected publisher.
pub struct MessageQueueExecutor {
    deps: Arc<Dependencies>,
    http: Arc<dyn HttpClient>,
}

impl MessageQueueExecutor {
    pub fn new(deps: Arc<Dependencies>) -> Arc<dyn NodeExecutor> {
        let http = deps
            .http
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient));
        Arc::new(Self { deps, http })
    }
}

#[async_trait]
impl NodeExecutor for MessageQueueExecutor {
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        let queue_type = config_string_or(node, "queue_type", "");
        if queue_type.is_empty() {
            return Some(ExecutionError::validation_error("queue_type is required"));
        }
        None
    }

    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        _context: &ProcessContext,
    ) -> NodeResult {
        let queue_type = config_string_or(node, "queue_type", "webhook");
        let topic = {
            let raw = config_string_or(node, "topic", "");
            state.interpolate_string(&raw).unwrap_or(raw)
        };
        let message = match node.config_value("message") {
            Some(value) => state
                .interpolate_value(value)
                .unwrap_or_else(|_| value.clone()),
            None => Value::Null,
        };
        let config = crate::executor::config_map(node, "config");

        let mut logs = vec![format!("Publishing to {queue_type}: {topic}")];

        let outcome: Result<Value, ExecutionError> = match queue_type.as_str() {
            "webhook" => {
                let url = if topic.is_empty() {
                    config_string_or(node, "url", "")
                } else {
                    topic.clone()
                };
                if url.is_empty() {
                    Err(ExecutionError::validation_error(
                        "webhook publishing requires a url",
                    ))
                } else {
                    let response = self
                        .http
                        .request(HttpRequestSpec {
                            method: "POST".to_string(),
                            url: url.clone(),
                            headers: vec![(
                                "Content-Type".to_string(),
                                "application/json".to_string(),
                            )],
                            body: Some(HttpBody::Json(message.clone())),
                            verify_ssl: true,
                            timeout: Duration::from_secs(30),
                        })
                        .await;
                    match response {
                        Ok(response) if response.status < 300 => {
                            logs.push(format!("Webhook accepted with {}", response.status));
                            Ok(json!({ "published": true, "status_code": response.status }))
                        }
                        Ok(response) => Err(ExecutionError::new(
                            ErrorCategory::External,
                            "QUEUE_ERROR",
                            format!("Webhook rejected with status {}", response.status),
                        )
                        .retryable(RETRYABLE_HTTP.contains(&response.status))),
                        Err(e) => Err(ExecutionError::new(
                            ErrorCategory::Connection,
                            "QUEUE_ERROR",
                            format!("Webhook publish failed: {e}"),
                        )
                        .retryable(true)),
                    }
                }
            }
            "redis" | "sqs" => {
                let kind = if queue_type == "redis" {
                    QueueKind::Redis
                } else {
                    QueueKind::Sqs
                };
                match &self.deps.queue {
                    Some(queue) => match queue.publish(kind, &topic, &message, &config).await {
                        Ok(response) => {
                            logs.push("Message published".to_string());
                            Ok(json!({ "published": true, "result": response }))
                        }
                        Err(e) => Err(ExecutionError::new(
                            ErrorCategory::External,
                            "QUEUE_ERROR",
                            format!("Publish failed: {e}"),
                        )
                        .retryable(true)),
                    },
                    None => Err(ExecutionError::new(
                        ErrorCategory::Configuration,
                        "UNSUPPORTED_QUEUE",
                        format!("No publisher configured for {queue_type}"),
                    )),
                }
            }
            other => Err(ExecutionError::new(
                ErrorCategory::Configuration,
                "UNSUPPORTED_QUEUE",
                format!("Unsupported queue type: {other}"),
            )),
        };

        match outcome {
            Ok(output) => NodeResult::success(output).with_logs(logs),
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
    use crate::deps::HttpResponseData;
    use std::sync::Mutex;

    /// HTTP stub that replays canned responses and records requests
    struct StubHttp {
        responses: Mutex<Vec<HttpResponseData>>,
        seen: Mutex<Vec<HttpRequestSpec>>,
    }

    impl StubHttp {
        fn returning(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(vec![HttpResponseData {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: body.as_bytes().to_vec(),
                }]),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpClient for StubHttp {
        async fn request(
            &self,
            spec: HttpRequestSpec,
        ) -> Result<HttpResponseData, DependencyError> {
            self.seen.lock().unwrap().push(spec);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    fn make_node(node_type: NodeType, type_config: Value) -> ProcessNode {
        ProcessNode {
            id: "i1".to_string(),
            node_type,
            name: "integration".to_string(),
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
    async fn test_http_success_parses_json() {
        let http = StubHttp::returning(200, r#"{"ok": true}"#);
        let deps = Arc::new(Dependencies::new().with_http(http.clone()));
        let node = make_node(
            NodeType::HttpRequest,
            json!({"method": "GET", "url": "https://api.example.com/{{id}}"}),
        );
        let mut state = ProcessState::default();
        state.set("id", json!("42"), "start");

        let result = HttpRequestExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        let output = result.output.unwrap();
        assert_eq!(output["status_code"], json!(200));
        assert_eq!(output["data"]["ok"], json!(true));
        assert_eq!(result.variables_update["out"], json!({"ok": true}));

        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://api.example.com/42");
    }

    #[tokio::test]
    async fn test_http_503_is_retryable() {
        let http = StubHttp::returning(503, "unavailable");
        let deps = Arc::new(Dependencies::new().with_http(http));
        let node = make_node(
            NodeType::HttpRequest,
            json!({"method": "GET", "url": "https://api.example.com"}),
        );
        let mut state = ProcessState::default();

        let result = HttpRequestExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.code, "HTTP_503");
        assert!(error.is_retryable);
    }

    #[tokio::test]
    async fn test_http_404_not_retryable() {
        let http = StubHttp::returning(404, "missing");
        let deps = Arc::new(Dependencies::new().with_http(http));
        let node = make_node(
            NodeType::HttpRequest,
            json!({"method": "GET", "url": "https://api.example.com"}),
        );
        let mut state = ProcessState::default();

        let result = HttpRequestExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert!(!result.error.unwrap().is_retryable);
    }

    #[tokio::test]
    async fn test_http_auth_headers() {
        let http = StubHttp::returning(200, "{}");
        let deps = Arc::new(Dependencies::new().with_http(http.clone()));
        let node = make_node(
            NodeType::HttpRequest,
            json!({
                "method": "POST",
                "url": "https://api.example.com",
                "auth_type": "bearer",
                "auth_config": {"token": "{{token}}"},
                "body": {"q": "{{q}}"}
            }),
        );
        let mut state = ProcessState::default();
        state.set("token", json!("tok-1"), "start");
        state.set("q", json!("find"), "start");

        HttpRequestExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        let seen = http.seen.lock().unwrap();
        assert!(seen[0]
            .headers
            .iter()
            .any(|(name, value)| name == "Authorization" && value == "Bearer tok-1"));
        match &seen[0].body {
            Some(HttpBody::Json(body)) => assert_eq!(body["q"], json!("find")),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_http_validate_rejects_bad_method() {
        let node = make_node(
            NodeType::HttpRequest,
            json!({"method": "TELEPORT", "url": "https://x"}),
        );
        let deps = Arc::new(Dependencies::new());
        assert!(HttpRequestExecutor::new(deps).validate(&node).is_some());
    }

    struct StubDb {
        descriptor: crate::deps::DatabaseDescriptor,
        statements: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::deps::DatabaseConnection for StubDb {
        fn descriptor(&self) -> &crate::deps::DatabaseDescriptor {
            &self.descriptor
        }

        async fn query(
            &self,
            sql: &str,
            max_rows: usize,
        ) -> Result<Vec<Map<String, Value>>, DependencyError> {
            self.statements.lock().unwrap().push(sql.to_string());
            let mut rows = Vec::new();
            for i in 0..max_rows.min(3) {
                let mut row = Map::new();
                row.insert("id".to_string(), json!(i));
                rows.push(row);
            }
            Ok(rows)
        }

        async fn execute(&self, sql: &str) -> Result<u64, DependencyError> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(1)
        }
    }

    fn stub_db() -> Arc<StubDb> {
        Arc::new(StubDb {
            descriptor: crate::deps::DatabaseDescriptor {
                kind: crate::deps::DatabaseKind::Postgres,
                url: "postgres://localhost/test".to_string(),
            },
            statements: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_db_query_enforces_max_rows() {
        let db = stub_db();
        let deps = Arc::new(Dependencies::new().with_db_connection("main", db.clone()));
        let node = make_node(
            NodeType::DatabaseQuery,
            json!({
                "connection_id": "main",
                "operation": "query",
                "query": "SELECT * FROM orders WHERE org = '{{org}}'",
                "max_rows": 2
            }),
        );
        let mut state = ProcessState::default();
        state.set("org", json!("acme"), "start");

        let result = DatabaseQueryExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.output.unwrap().as_array().unwrap().len(), 2);
        assert!(db.statements.lock().unwrap()[0].contains("'acme'"));
    }

    #[tokio::test]
    async fn test_db_structured_insert() {
        let db = stub_db();
        let deps = Arc::new(Dependencies::new().with_db_connection("main", db.clone()));
        let node = make_node(
            NodeType::DatabaseQuery,
            json!({
                "connection_id": "main",
                "operation": "insert",
                "table": "audit",
                "data": {"actor": "{{user}}", "n": 3}
            }),
        );
        let mut state = ProcessState::default();
        state.set("user", json!("o'neil"), "start");

        let result = DatabaseQueryExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        let statement = db.statements.lock().unwrap()[0].clone();
        assert!(statement.starts_with("INSERT INTO audit"));
        assert!(statement.contains("'o''neil'"));
    }

    #[tokio::test]
    async fn test_db_missing_connection() {
        let node = make_node(
            NodeType::DatabaseQuery,
            json!({"connection_id": "ghost", "operation": "query", "query": "SELECT 1"}),
        );
        let mut state = ProcessState::default();

        let result = DatabaseQueryExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.error.unwrap().code, "DB_CONNECTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_db_update_requires_where() {
        let deps = Arc::new(Dependencies::new().with_db_connection("main", stub_db()));
        let node = make_node(
            NodeType::DatabaseQuery,
            json!({
                "connection_id": "main",
                "operation": "update",
                "table": "audit",
                "data": {"x": 1}
            }),
        );
        let mut state = ProcessState::default();

        let result = DatabaseQueryExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert!(result.is_failure());
    }

    fn file_ctx(dir: &Path) -> ProcessContext {
        ProcessContext::new("e1").with_output_dir(dir)
    }

    #[tokio::test]
    async fn test_file_write_read_exists_delete() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        let deps = Arc::new(Dependencies::new());
        let ctx = file_ctx(&dir);
        let mut state = ProcessState::default();
        state.set("name", json!("report"), "start");

        let write = make_node(
            NodeType::FileOperation,
            json!({"operation": "write", "path": "{{name}}.txt", "content": "hello {{name}}"}),
        );
        let result = FileOperationExecutor::new(deps.clone())
            .execute(&write, &mut state, &ctx)
            .await;
        assert!(result.is_success());

        let read = make_node(
            NodeType::FileOperation,
            json!({"operation": "read", "path": "report.txt"}),
        );
        let result = FileOperationExecutor::new(deps.clone())
            .execute(&read, &mut state, &ctx)
            .await;
        assert_eq!(
            result.output.as_ref().unwrap()["content"],
            json!("hello report")
        );

        let exists = make_node(
            NodeType::FileOperation,
            json!({"operation": "exists", "path": "report.txt"}),
        );
        let result = FileOperationExecutor::new(deps.clone())
            .execute(&exists, &mut state, &ctx)
            .await;
        assert_eq!(result.output.unwrap()["exists"], json!(true));

        let delete = make_node(
            NodeType::FileOperation,
            json!({"operation": "delete", "path": "report.txt"}),
        );
        let result = FileOperationExecutor::new(deps)
            .execute(&delete, &mut state, &ctx)
            .await;
        assert_eq!(result.output.unwrap()["deleted"], json!(true));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_file_traversal_rejected() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        let node = make_node(
            NodeType::FileOperation,
            json!({"operation": "read", "path": "../outside.txt"}),
        );
        let mut state = ProcessState::default();

        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_file_read_missing_is_classified() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        let node = make_node(
            NodeType::FileOperation,
            json!({"operation": "read", "path": "ghost.txt"}),
        );
        let mut state = ProcessState::default();

        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;
        assert_eq!(result.error.unwrap().code, "FILE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_extract_text_concatenates_and_rejects_empty() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let a = dir.join("a.txt");
        let b = dir.join("b.csv");
        tokio::fs::write(&a, "first part").await.unwrap();
        tokio::fs::write(&b, "col1,col2\n1,2").await.unwrap();

        let node = make_node(
            NodeType::FileOperation,
            json!({
                "operation": "extract_text",
                "files": [
                    {"path": a.to_string_lossy(), "mime_type": "text/plain"},
                    {"path": b.to_string_lossy()}
                ]
            }),
        );
        let mut state = ProcessState::default();

        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;

        let output = result.output.unwrap();
        let text = output["text"].as_str().unwrap();
        assert!(text.contains("first part"));
        assert!(text.contains("col1,col2"));

        // Empty file yields a classified failure
        let empty = dir.join("empty.txt");
        tokio::fs::write(&empty, "  ").await.unwrap();
        let node = make_node(
            NodeType::FileOperation,
            json!({
                "operation": "extract_text",
                "file": {"path": empty.to_string_lossy(), "mime_type": "text/plain"}
            }),
        );
        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;
        assert_eq!(result.error.unwrap().code, "EXTRACTION_FAILED");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_generate_document_txt() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        let node = make_node(
            NodeType::FileOperation,
            json!({
                "operation": "generate_document",
                "format": "txt",
                "title": "Summary",
                "content": "total is {{total}}"
            }),
        );
        let mut state = ProcessState::default();
        state.set("total", json!(99), "start");

        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;

        let output = result.output.unwrap();
        assert_eq!(output["format"], json!("txt"));
        assert_eq!(output["filename"], json!("Summary.txt"));
        let written = tokio::fs::read_to_string(output["path"].as_str().unwrap())
            .await
            .unwrap();
        assert!(written.contains("total is 99"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_generate_document_rich_format_needs_renderer() {
        let dir = std::env::temp_dir().join(format!("procflow-test-{}", uuid::Uuid::new_v4()));
        let node = make_node(
            NodeType::FileOperation,
            json!({"operation": "generate_document", "format": "pdf", "content": "x"}),
        );
        let mut state = ProcessState::default();

        let result = FileOperationExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &file_ctx(&dir))
            .await;
        assert_eq!(result.error.unwrap().code, "UNSUPPORTED_STORAGE");
    }

    #[tokio::test]
    async fn test_queue_webhook_posts_message() {
        let http = StubHttp::returning(202, "{}");
        let deps = Arc::new(Dependencies::new().with_http(http.clone()));
        let node = make_node(
            NodeType::MessageQueue,
            json!({
                "queue_type": "webhook",
                "topic": "https://hooks.example.com/{{channel}}",
                "message": {"text": "done"}
            }),
        );
        let mut state = ProcessState::default();
        state.set("channel", json!("ops"), "start");

        let result = MessageQueueExecutor::new(deps)
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;

        assert!(result.is_success());
        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://hooks.example.com/ops");
    }

    #[tokio::test]
    async fn test_queue_unsupported_kind() {
        let node = make_node(
            NodeType::MessageQueue,
            json!({"queue_type": "kafka", "topic": "t"}),
        );
        let mut state = ProcessState::default();

        let result = MessageQueueExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.error.unwrap().code, "UNSUPPORTED_QUEUE");
    }

    #[tokio::test]
    async fn test_queue_redis_without_publisher() {
        let node = make_node(
            NodeType::MessageQueue,
            json!({"queue_type": "redis", "topic": "events"}),
        );
        let mut state = ProcessState::default();

        let result = MessageQueueExecutor::new(Arc::new(Dependencies::new()))
            .execute(&node, &mut state, &ProcessContext::new("e1"))
            .await;
        assert_eq!(result.error.unwrap().code, "UNSUPPORTED_QUEUE");
    }
}
