//! Node executor contract, execution envelopes, and the registry
//!
//! Every node type has an executor implementing [`NodeExecutor`]:
//! `validate` runs synchronously before execution, `execute` does the work.
//! Executors are stateless; everything mutable lives in
//! [`ProcessState`](crate::state::ProcessState).
//!
//! The retry and timeout envelopes are free functions rather than trait
//! methods - the engine composes them around any executor:
//!
//! ```text
//! execute_with_timeout
//!   └── tokio::time::timeout( node.config.timeout.seconds )
//!         └── execute_with_retry
//!               └── executor.execute()   (attempt 0..max_attempts)
//!                     delay = delay_seconds * multiplier^attempt (jittered)
//! ```
//!
//! Only failures whose error is `is_retryable` are retried; waiting and
//! skipped results pass straight through.

use crate::context::ProcessContext;
use crate::definition::{NodeType, ProcessNode, TimeoutAction};
use crate::deps::Dependencies;
use crate::error::{ErrorCategory, ExecutionError};
use crate::result::NodeResult;
use crate::state::ProcessState;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Contract implemented by every node executor
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Validate node configuration before execution
    ///
    /// Returns an error to abort the node without executing it.
    fn validate(&self, node: &ProcessNode) -> Option<ExecutionError> {
        if node.id.is_empty() {
            return Some(ExecutionError::validation_error("Node ID is required"));
        }
        None
    }

    /// Execute the node
    async fn execute(
        &self,
        node: &ProcessNode,
        state: &mut ProcessState,
        context: &ProcessContext,
    ) -> NodeResult;
}

/// Execute a node with retry handling per its retry config
pub async fn execute_with_retry(
    executor: &dyn NodeExecutor,
    node: &ProcessNode,
    state: &mut ProcessState,
    context: &ProcessContext,
) -> NodeResult {
    let retry = &node.config.retry;
    let max_attempts = if retry.enabled { retry.max_attempts.max(1) } else { 1 };

    let mut last_error: Option<ExecutionError> = None;

    for attempt in 0..max_attempts {
        let started = std::time::Instant::now();
        let mut result = executor.execute(node, state, context).await;
        if result.duration_ms == 0.0 {
            result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        }

        if result.is_success() || result.is_waiting() || result.is_skipped() {
            return result;
        }

        if let Some(error) = &result.error {
            if !error.is_retryable {
                return result;
            }
            last_error = result.error.clone();
        } else {
            return result;
        }

        if attempt + 1 < max_attempts {
            let delay = retry.delay_seconds * retry.backoff_multiplier.powi(attempt as i32);
            let jitter = rand::thread_rng().gen_range(0.5..=1.5);
            let delay = Duration::from_secs_f64((delay * jitter).max(0.0));
            debug!(
                node_id = %node.id,
                attempt = attempt + 2,
                max_attempts,
                ?delay,
                "retrying node"
            );
            tokio::time::sleep(delay).await;
        }
    }

    let error = last_error
        .unwrap_or_else(|| ExecutionError::internal_error("Max retries exceeded"))
        .with_source_node(&node.id);
    NodeResult::failure(error).log(format!("Failed after {max_attempts} attempts"))
}

/// Execute a node with timeout handling wrapping the retry envelope
pub async fn execute_with_timeout(
    executor: &dyn NodeExecutor,
    node: &ProcessNode,
    state: &mut ProcessState,
    context: &ProcessContext,
) -> NodeResult {
    let timeout = &node.config.timeout;
    if !timeout.enabled {
        return execute_with_retry(executor, node, state, context).await;
    }

    match tokio::time::timeout(
        Duration::from_secs(timeout.seconds),
        execute_with_retry(executor, node, state, context),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(node_id = %node.id, seconds = timeout.seconds, "node timed out");
            let mut error = ExecutionError::timeout_error(
                format!("Node {} timed out after {}s", node.id, timeout.seconds),
                timeout.seconds,
            )
            .with_source_node(&node.id);

            match timeout.action {
                TimeoutAction::Skip => NodeResult::skipped("Timeout - skipped"),
                TimeoutAction::Retry => {
                    error.is_retryable = true;
                    NodeResult::failure(error)
                }
                TimeoutAction::Fail => {
                    error.is_retryable = false;
                    NodeResult::failure(error)
                }
            }
        }
    }
}

/// Constructor for an executor, given the shared dependency bundle
pub type ExecutorConstructor =
    Box<dyn Fn(Arc<Dependencies>) -> Arc<dyn NodeExecutor> + Send + Sync>;

/// Registry mapping node type to executor constructor
///
/// A node type without a registered constructor fails execution with a
/// `NO_EXECUTOR` configuration error.
pub struct ExecutorRegistry {
    constructors: HashMap<NodeType, ExecutorConstructor>,
}

impl ExecutorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in executor registered
    pub fn standard() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_standard(&mut registry);
        registry
    }

    /// Register a constructor for a node type (replacing any previous one)
    pub fn register(
        &mut self,
        node_type: NodeType,
        constructor: impl Fn(Arc<Dependencies>) -> Arc<dyn NodeExecutor> + Send + Sync + 'static,
    ) {
        self.constructors.insert(node_type, Box::new(constructor));
    }

    /// Create an executor instance for a node type
    pub fn create(
        &self,
        node_type: NodeType,
        deps: Arc<Dependencies>,
    ) -> Option<Arc<dyn NodeExecutor>> {
        self.constructors.get(&node_type).map(|ctor| ctor(deps))
    }

    /// Whether a node type has a registered executor
    pub fn is_registered(&self, node_type: NodeType) -> bool {
        self.constructors.contains_key(&node_type)
    }

    /// All registered node types
    pub fn registered_types(&self) -> Vec<NodeType> {
        self.constructors.keys().copied().collect()
    }

    /// Classified error for an unregistered node type
    pub fn no_executor_error(node_type: NodeType) -> ExecutionError {
        ExecutionError::new(
            ErrorCategory::Configuration,
            "NO_EXECUTOR",
            format!(
                "No executor registered for node type: {}",
                node_type.as_str()
            ),
        )
        .user_fixable(false)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ----- type_config accessors ----------------------------------------------

/// String config value
pub fn config_str<'a>(node: &'a ProcessNode, key: &str) -> Option<&'a str> {
    node.config_value(key).and_then(Value::as_str)
}

/// String config value with default
pub fn config_string_or(node: &ProcessNode, key: &str, default: &str) -> String {
    config_str(node, key).unwrap_or(default).to_string()
}

/// Boolean config value with default
pub fn config_bool(node: &ProcessNode, key: &str, default: bool) -> bool {
    node.config_value(key)
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

/// Unsigned integer config value with default
pub fn config_u64(node: &ProcessNode, key: &str, default: u64) -> u64 {
    node.config_value(key)
        .and_then(Value::as_u64)
        .unwrap_or(default)
}

/// Float config value with default
pub fn config_f64(node: &ProcessNode, key: &str, default: f64) -> f64 {
    node.config_value(key)
        .and_then(Value::as_f64)
        .unwrap_or(default)
}

/// Array config value (empty when absent)
pub fn config_array<'a>(node: &'a ProcessNode, key: &str) -> Vec<&'a Value> {
    node.config_value(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

/// Object config value (empty when absent)
pub fn config_map(node: &ProcessNode, key: &str) -> Map<String, Value> {
    node.config_value(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// String list config value, tolerating single strings and mixed arrays
pub fn config_string_list(node: &ProcessNode, key: &str) -> Vec<String> {
    match node.config_value(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeConfig, RetryConfig, TimeoutConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_node(retry: RetryConfig, timeout: TimeoutConfig) -> ProcessNode {
        ProcessNode {
            id: "n1".to_string(),
            node_type: NodeType::Script,
            name: "n1".to_string(),
            config: NodeConfig {
                enabled: true,
                retry,
                timeout,
                skip_on_error: false,
                type_config: Map::new(),
            },
            input_mapping: None,
            output_variable: None,
            next: None,
        }
    }

    struct FlakyExecutor {
        calls: AtomicU32,
        succeed_on: u32,
        retryable: bool,
    }

    #[async_trait]
    impl NodeExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _node: &ProcessNode,
            _state: &mut ProcessState,
            _context: &ProcessContext,
        ) -> NodeResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                NodeResult::success(json!({"call": call}))
            } else {
                NodeResult::failure(
                    ExecutionError::connection_error("transient").retryable(self.retryable),
                )
            }
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl NodeExecutor for SlowExecutor {
        async fn execute(
            &self,
            _node: &ProcessNode,
            _state: &mut ProcessState,
            _context: &ProcessContext,
        ) -> NodeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            NodeResult::success(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let executor = FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: 2,
            retryable: true,
        };
        let node = test_node(
            RetryConfig {
                enabled: true,
                max_attempts: 3,
                delay_seconds: 0.001,
                backoff_multiplier: 1.0,
            },
            TimeoutConfig::default(),
        );
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_retry(&executor, &node, &mut state, &ctx).await;
        assert!(result.is_success());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_bounded_by_max_attempts() {
        let executor = FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
            retryable: true,
        };
        let node = test_node(
            RetryConfig {
                enabled: true,
                max_attempts: 3,
                delay_seconds: 0.001,
                backoff_multiplier: 1.0,
            },
            TimeoutConfig::default(),
        );
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_retry(&executor, &node, &mut state, &ctx).await;
        assert!(result.is_failure());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.error.as_ref().unwrap().source_node_id.as_deref(),
            Some("n1")
        );
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let executor = FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
            retryable: false,
        };
        let node = test_node(
            RetryConfig {
                enabled: true,
                max_attempts: 5,
                delay_seconds: 0.001,
                backoff_multiplier: 1.0,
            },
            TimeoutConfig::default(),
        );
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_retry(&executor, &node, &mut state, &ctx).await;
        assert!(result.is_failure());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled_single_attempt() {
        let executor = FlakyExecutor {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
            retryable: true,
        };
        let node = test_node(RetryConfig::default(), TimeoutConfig::default());
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_retry(&executor, &node, &mut state, &ctx).await;
        assert!(result.is_failure());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_skip_action() {
        let node = test_node(
            RetryConfig::default(),
            TimeoutConfig {
                enabled: true,
                seconds: 1,
                action: TimeoutAction::Skip,
            },
        );
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_timeout(&SlowExecutor, &node, &mut state, &ctx).await;
        assert!(result.is_skipped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retry_action_marks_retryable() {
        let node = test_node(
            RetryConfig::default(),
            TimeoutConfig {
                enabled: true,
                seconds: 1,
                action: TimeoutAction::Retry,
            },
        );
        let mut state = ProcessState::default();
        let ctx = ProcessContext::new("e1");

        let result = execute_with_timeout(&SlowExecutor, &node, &mut state, &ctx).await;
        assert!(result.is_failure());
        assert!(result.error.unwrap().is_retryable);
    }

    #[test]
    fn test_registry_no_executor_error() {
        let registry = ExecutorRegistry::new();
        assert!(!registry.is_registered(NodeType::AiTask));
        let error = ExecutorRegistry::no_executor_error(NodeType::AiTask);
        assert_eq!(error.code, "NO_EXECUTOR");
    }

    #[test]
    fn test_config_accessors() {
        let mut node = test_node(RetryConfig::default(), TimeoutConfig::default());
        node.config.type_config.insert("url".to_string(), json!("http://x"));
        node.config.type_config.insert("n".to_string(), json!(7));
        node.config
            .type_config
            .insert("ids".to_string(), json!(["a", 2]));

        assert_eq!(config_str(&node, "url"), Some("http://x"));
        assert_eq!(config_u64(&node, "n", 0), 7);
        assert_eq!(config_string_or(&node, "missing", "d"), "d");
        assert_eq!(config_string_list(&node, "ids"), vec!["a", "2"]);
    }
}
