//! Injected dependencies for node executors
//!
//! Every external capability the engine touches - LLM, tools, HTTP, database
//! connections, notifications, the user directory, message queues, document
//! services, sub-process invocation - enters through the [`Dependencies`]
//! bundle. The engine holds no global singletons; a bundle is assembled per
//! host and shared across executions (`Arc` all the way down), so every
//! implementation must be safe for concurrent use.
//!
//! All traits here are *consumed* interfaces: the engine defines the shape,
//! the host provides the implementation. The one concrete implementation
//! shipped is [`ReqwestHttpClient`], since the HTTP_REQUEST node and webhook
//! publishing are core engine features rather than host capabilities.

use crate::llm::ChatModel;
use crate::result::ExecutionStatus;
use crate::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure from an injected dependency
///
/// Executors translate these into classified [`ExecutionError`]s
/// (category, stable code, retryability) at the call site, where the node
/// context is known.
///
/// [`ExecutionError`]: crate::error::ExecutionError
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("dependency not configured: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

// ----- HTTP ---------------------------------------------------------------

/// Body of an outgoing HTTP request
#[derive(Debug, Clone)]
pub enum HttpBody {
    Json(Value),
    Raw(String),
}

/// An outgoing HTTP request, fully resolved (URL and headers interpolated)
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HttpBody>,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

/// A received HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponseData {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponseData {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Minimal async HTTP client interface
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, spec: HttpRequestSpec) -> Result<HttpResponseData, DependencyError>;
}

/// Default [`HttpClient`] backed by `reqwest`
pub struct ReqwestHttpClient;

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn request(&self, spec: HttpRequestSpec) -> Result<HttpResponseData, DependencyError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!spec.verify_ssl)
            .timeout(spec.timeout)
            .build()
            .map_err(|e| DependencyError::Failed(e.to_string()))?;

        let method = reqwest::Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| DependencyError::Failed(format!("invalid method '{}'", spec.method)))?;

        let mut request = client.request(method, &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        request = match spec.body {
            Some(HttpBody::Json(json)) => request.json(&json),
            Some(HttpBody::Raw(raw)) => request.body(raw),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DependencyError::Timeout(spec.timeout)
            } else if e.is_connect() {
                DependencyError::Connection(e.to_string())
            } else {
                DependencyError::Failed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| DependencyError::Failed(e.to_string()))?
            .to_vec();

        Ok(HttpResponseData {
            status,
            headers,
            body,
        })
    }
}

// ----- Database -----------------------------------------------------------

/// Database dialect of an injected connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Postgres,
    Mysql,
    Sqlite,
}

/// Descriptor of an injected database connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    pub url: String,
}

/// An injected database connection, resolved by `connection_id`
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    fn descriptor(&self) -> &DatabaseDescriptor;

    /// Run a SELECT-shaped statement, returning at most `max_rows` rows
    async fn query(
        &self,
        sql: &str,
        max_rows: usize,
    ) -> Result<Vec<Map<String, Value>>, DependencyError>;

    /// Run a mutating statement, returning the affected-row count
    async fn execute(&self, sql: &str) -> Result<u64, DependencyError>;
}

// ----- Notifications ------------------------------------------------------

/// Outgoing notification request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: String,
    pub recipients: Vec<String>,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: Map<String, Value>,
    pub priority: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Injected notification channel (email, chat, webhook, in-app)
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, request: NotificationRequest) -> Result<Value, DependencyError>;
}

// ----- User directory -----------------------------------------------------

/// Kinds of assignee resolution the directory supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeDescriptorKind {
    /// The requester's manager
    #[default]
    DynamicManager,
    /// Manager of a specific department
    DepartmentManager,
    /// All users of a department, looked up by name
    DepartmentByName,
    /// N levels up the requester's management chain
    ManagementChain,
    /// Members of a role
    Role,
    /// Members of a group
    Group,
    /// Custom directory expression
    Expression,
}

/// Typed directive the directory resolves to a set of user ids
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssigneeDescriptor {
    #[serde(rename = "type")]
    pub kind: AssigneeDescriptorKind,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_name: Option<String>,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub expression: String,
}

fn default_level() -> u32 {
    1
}

/// Directory attributes of a user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAttributes {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Injected identity-directory resolver
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve an assignee descriptor to user ids; empty means no match
    async fn resolve_process_assignee(
        &self,
        descriptor: &AssigneeDescriptor,
        process_context: &Value,
        org_id: &str,
    ) -> Result<Vec<String>, DependencyError>;

    /// Look up a user's directory attributes
    async fn get_user(
        &self,
        user_id: &str,
        org_id: &str,
    ) -> Result<Option<UserAttributes>, DependencyError>;
}

// ----- Message queues -----------------------------------------------------

/// Broker-backed queue families (webhook publishing goes through HTTP)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Redis,
    Sqs,
}

/// Injected queue publisher
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(
        &self,
        kind: QueueKind,
        topic: &str,
        message: &Value,
        config: &Map<String, Value>,
    ) -> Result<Value, DependencyError>;
}

// ----- Document services --------------------------------------------------

/// Injected text extraction for rich file formats (pdf, docx, xlsx, pptx)
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract_text(&self, path: &Path, mime: &str) -> Result<String, DependencyError>;
}

/// Output formats for generated documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Docx,
    Pdf,
    Xlsx,
    Pptx,
    Txt,
}

impl DocumentFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Xlsx => "xlsx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Txt => "txt",
        }
    }
}

/// Injected document renderer; returns the written file size in bytes
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        format: DocumentFormat,
        title: &str,
        content: &str,
        path: &Path,
    ) -> Result<u64, DependencyError>;
}

// ----- Sub-processes ------------------------------------------------------

/// Request to start a child execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessRequest {
    pub process_id: String,
    pub input: Map<String, Value>,
    pub parent_execution_id: String,
    pub parent_node_id: String,
    pub execution_depth: u32,
    pub wait_for_completion: bool,
    pub timeout_seconds: u64,
}

/// Result of a sub-process invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessOutcome {
    /// Child execution id
    pub execution_id: String,
    /// Terminal status when `wait_for_completion` was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    /// Child output when `wait_for_completion` was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Injected child-execution runner (implemented by the service layer)
#[async_trait]
pub trait SubProcessRunner: Send + Sync {
    async fn start(&self, request: SubProcessRequest) -> Result<SubProcessOutcome, DependencyError>;
}

// ----- The bundle ---------------------------------------------------------

/// All external services available to node executors
///
/// Assembled once per host with the builder methods and shared across
/// executions. Missing optional services surface as classified configuration
/// errors when a node actually needs them.
#[derive(Clone, Default)]
pub struct Dependencies {
    pub llm: Option<Arc<dyn ChatModel>>,
    pub tools: HashMap<String, Arc<dyn Tool>>,
    pub http: Option<Arc<dyn HttpClient>>,
    pub db_connections: HashMap<String, Arc<dyn DatabaseConnection>>,
    pub notifications: Option<Arc<dyn NotificationService>>,
    pub user_directory: Option<Arc<dyn UserDirectory>>,
    pub queue: Option<Arc<dyn QueuePublisher>>,
    pub extractor: Option<Arc<dyn DocumentExtractor>>,
    pub renderer: Option<Arc<dyn DocumentRenderer>>,
    pub sub_processes: Option<Arc<dyn SubProcessRunner>>,
    /// Root directory for execution-scoped file output
    pub output_root: Option<PathBuf>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn ChatModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool_id.into(), tool);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_db_connection(
        mut self,
        connection_id: impl Into<String>,
        connection: Arc<dyn DatabaseConnection>,
    ) -> Self {
        self.db_connections.insert(connection_id.into(), connection);
        self
    }

    pub fn with_notifications(mut self, service: Arc<dyn NotificationService>) -> Self {
        self.notifications = Some(service);
        self
    }

    pub fn with_user_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.user_directory = Some(directory);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueuePublisher>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_sub_processes(mut self, runner: Arc<dyn SubProcessRunner>) -> Self {
        self.sub_processes = Some(runner);
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(root.into());
        self
    }

    /// Look up a tool by id
    pub fn get_tool(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    /// Look up a database connection by id
    pub fn get_db_connection(&self, connection_id: &str) -> Option<Arc<dyn DatabaseConnection>> {
        self.db_connections.get(connection_id).cloned()
    }
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("has_llm", &self.llm.is_some())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("has_http", &self.http.is_some())
            .field(
                "db_connections",
                &self.db_connections.keys().collect::<Vec<_>>(),
            )
            .field("has_notifications", &self.notifications.is_some())
            .field("has_user_directory", &self.user_directory.is_some())
            .field("has_queue", &self.queue.is_some())
            .field("has_sub_processes", &self.sub_processes.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutcome;

    struct Nop;

    #[async_trait]
    impl Tool for Nop {
        async fn execute(&self, _args: Map<String, Value>) -> ToolOutcome {
            ToolOutcome::ok(Value::Null)
        }
    }

    #[test]
    fn test_bundle_builder() {
        let deps = Dependencies::new()
            .with_tool("echo", Arc::new(Nop))
            .with_output_root("/tmp/procflow");

        assert!(deps.get_tool("echo").is_some());
        assert!(deps.get_tool("missing").is_none());
        assert!(deps.llm.is_none());
    }

    #[test]
    fn test_document_format_extension() {
        assert_eq!(DocumentFormat::Xlsx.extension(), "xlsx");
    }
}
