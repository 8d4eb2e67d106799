//! Process definition model
//!
//! A [`ProcessDefinition`] is the immutable graph a single execution walks:
//! typed nodes, directed (optionally conditional) edges, declared variables,
//! trigger descriptors, and execution settings. Definitions are built from
//! JSON documents and validated strictly at construction time - unknown node
//! types, duplicate node ids, dangling edges, and a missing START node are
//! all rejected before the engine ever sees the graph.
//!
//! The definition is snapshotted into every execution record so that in-flight
//! executions survive later edits to the process.

use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// All node types the engine understands
///
/// Unknown types fail deserialization, which is how invalid definitions are
/// rejected up front rather than at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    // Flow
    Start,
    End,
    Merge,
    // Logic
    Condition,
    Switch,
    Loop,
    While,
    Parallel,
    SubProcess,
    // Task
    AiTask,
    ToolCall,
    Script,
    // Integration
    HttpRequest,
    DatabaseQuery,
    FileOperation,
    MessageQueue,
    // Human
    Approval,
    HumanTask,
    Notification,
    // Data
    Transform,
    Validate,
    Filter,
    Map,
    Aggregate,
    // Timing
    Delay,
    Schedule,
    EventWait,
}

impl NodeType {
    /// Stable wire name (matches the serde representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Merge => "merge",
            NodeType::Condition => "condition",
            NodeType::Switch => "switch",
            NodeType::Loop => "loop",
            NodeType::While => "while",
            NodeType::Parallel => "parallel",
            NodeType::SubProcess => "sub_process",
            NodeType::AiTask => "ai_task",
            NodeType::ToolCall => "tool_call",
            NodeType::Script => "script",
            NodeType::HttpRequest => "http_request",
            NodeType::DatabaseQuery => "database_query",
            NodeType::FileOperation => "file_operation",
            NodeType::MessageQueue => "message_queue",
            NodeType::Approval => "approval",
            NodeType::HumanTask => "human_task",
            NodeType::Notification => "notification",
            NodeType::Transform => "transform",
            NodeType::Validate => "validate",
            NodeType::Filter => "filter",
            NodeType::Map => "map",
            NodeType::Aggregate => "aggregate",
            NodeType::Delay => "delay",
            NodeType::Schedule => "schedule",
            NodeType::EventWait => "event_wait",
        }
    }
}

/// Retry policy attached to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            delay_seconds: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// What to do when a node-level timeout fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    Retry,
    Skip,
}

/// Per-node timeout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_timeout_seconds")]
    pub seconds: u64,
    #[serde(default)]
    pub action: TimeoutAction,
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seconds: default_timeout_seconds(),
            action: TimeoutAction::Fail,
        }
    }
}

/// Shared node configuration plus the type-specific config bag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub skip_on_error: bool,
    /// Type-specific configuration (prompt, url, expression, branches, ...)
    #[serde(default)]
    pub type_config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

/// A typed vertex in the process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: NodeConfig,
    /// Maps trigger-input fields into variables (START nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<Map<String, Value>>,
    /// Variable that receives this node's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    /// Explicit next-node override, bypassing edge evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl ProcessNode {
    /// Read a value from the type-specific config
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.type_config.get(key)
    }
}

/// A directed, optionally conditional connector between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEdge {
    pub source: String,
    pub target: String,
    /// Expression gating this edge; edges without one act as fallbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// `"default"` marks the explicit fallback edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
}

/// A declared process variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessVariable {
    pub name: String,
    #[serde(default, rename = "type")]
    pub var_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Sensitive values are masked in every externally exported payload
    #[serde(default)]
    pub sensitive: bool,
}

/// How an execution of this process can be started
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Engine limits and checkpointing cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default = "default_max_node_executions")]
    pub max_node_executions: u64,
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_seconds: u64,
    #[serde(default = "default_enabled")]
    pub checkpoint_enabled: bool,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_nodes: u64,
}

fn default_max_node_executions() -> u64 {
    100
}
fn default_max_execution_time() -> u64 {
    3600
}
fn default_checkpoint_interval() -> u64 {
    5
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            max_node_executions: default_max_node_executions(),
            max_execution_time_seconds: default_max_execution_time(),
            checkpoint_enabled: true,
            checkpoint_interval_nodes: default_checkpoint_interval(),
        }
    }
}

/// The immutable process graph an execution walks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<ProcessNode>,
    #[serde(default)]
    pub edges: Vec<ProcessEdge>,
    #[serde(default)]
    pub variables: Vec<ProcessVariable>,
    #[serde(default)]
    pub triggers: Vec<ProcessTrigger>,
    #[serde(default)]
    pub settings: ProcessSettings,

    /// node id -> index into `nodes`, built at construction
    #[serde(skip)]
    node_index: HashMap<String, usize>,
}

fn default_version() -> u32 {
    1
}

impl ProcessDefinition {
    /// Parse a definition from a JSON document and validate it
    pub fn from_json(document: &Value) -> Result<Self, DefinitionError> {
        let mut definition: ProcessDefinition = serde_json::from_value(document.clone())?;
        definition.build_index()?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a definition from a JSON string and validate it
    pub fn from_json_str(document: &str) -> Result<Self, DefinitionError> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_json(&value)
    }

    /// Construct from already-built parts (used by tests and builders)
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<ProcessNode>,
        edges: Vec<ProcessEdge>,
    ) -> Result<Self, DefinitionError> {
        let mut definition = Self {
            id: String::new(),
            name: name.into(),
            version: 1,
            nodes,
            edges,
            variables: Vec::new(),
            triggers: Vec::new(),
            settings: ProcessSettings::default(),
            node_index: HashMap::new(),
        };
        definition.build_index()?;
        definition.validate()?;
        Ok(definition)
    }

    fn build_index(&mut self) -> Result<(), DefinitionError> {
        self.node_index.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            if self
                .node_index
                .insert(node.id.clone(), i)
                .is_some()
            {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
        }
        Ok(())
    }

    /// Structural validation: START present and unique, edge endpoints exist
    fn validate(&self) -> Result<(), DefinitionError> {
        let start_count = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        if start_count == 0 {
            return Err(DefinitionError::NoStartNode);
        }
        if start_count > 1 {
            return Err(DefinitionError::Validation(format!(
                "process has {start_count} START nodes, expected exactly one"
            )));
        }

        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(DefinitionError::Validation(
                    "node id must not be empty".to_string(),
                ));
            }
        }

        for edge in &self.edges {
            if !self.node_index.contains_key(&edge.source) {
                return Err(DefinitionError::DanglingEdge(edge.source.clone()));
            }
            if !self.node_index.contains_key(&edge.target) {
                return Err(DefinitionError::DanglingEdge(edge.target.clone()));
            }
        }

        Ok(())
    }

    /// Look up a node by id
    pub fn get_node(&self, node_id: &str) -> Option<&ProcessNode> {
        self.node_index.get(node_id).map(|&i| &self.nodes[i])
    }

    /// The unique START node
    pub fn get_start_node(&self) -> Option<&ProcessNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    /// Outgoing edges of a node, in definition order
    pub fn get_outgoing_edges(&self, node_id: &str) -> Vec<&ProcessEdge> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id)
            .collect()
    }

    /// Names of variables declared sensitive
    pub fn sensitive_variable_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|v| v.sensitive)
            .map(|v| v.name.clone())
            .collect()
    }

    /// Initial variable map from declared defaults
    pub fn initial_variables(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        for var in &self.variables {
            if let Some(default) = &var.default {
                vars.insert(var.name.clone(), default.clone());
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType) -> ProcessNode {
        ProcessNode {
            id: id.to_string(),
            node_type,
            name: id.to_string(),
            config: NodeConfig::default(),
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

    #[test]
    fn test_minimal_definition() {
        let def = ProcessDefinition::new(
            "linear",
            vec![node("start", NodeType::Start), node("end", NodeType::End)],
            vec![edge("start", "end")],
        )
        .unwrap();

        assert_eq!(def.get_start_node().unwrap().id, "start");
        assert_eq!(def.get_outgoing_edges("start").len(), 1);
        assert!(def.get_node("missing").is_none());
    }

    #[test]
    fn test_missing_start_rejected() {
        let err = ProcessDefinition::new("bad", vec![node("end", NodeType::End)], vec![])
            .unwrap_err();
        assert!(matches!(err, DefinitionError::NoStartNode));
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let err = ProcessDefinition::new(
            "bad",
            vec![node("a", NodeType::Start), node("a", NodeType::End)],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let err = ProcessDefinition::new(
            "bad",
            vec![node("start", NodeType::Start)],
            vec![edge("start", "ghost")],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::DanglingEdge(id) if id == "ghost"));
    }

    #[test]
    fn test_two_start_nodes_rejected() {
        let err = ProcessDefinition::new(
            "bad",
            vec![node("s1", NodeType::Start), node("s2", NodeType::Start)],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::Validation(_)));
    }

    #[test]
    fn test_from_json_document() {
        let doc = json!({
            "name": "review",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "check", "type": "condition", "config": {
                    "type_config": {"expression": "{{x}} > 1", "true_branch": "end", "false_branch": "end"}
                }},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "check"},
                {"source": "check", "target": "end"}
            ],
            "variables": [
                {"name": "x", "type": "number", "default": 0},
                {"name": "api_key", "sensitive": true}
            ],
            "settings": {"max_node_executions": 10}
        });

        let def = ProcessDefinition::from_json(&doc).unwrap();
        assert_eq!(def.settings.max_node_executions, 10);
        assert_eq!(def.settings.checkpoint_interval_nodes, 5);
        assert_eq!(def.sensitive_variable_names(), vec!["api_key"]);
        assert_eq!(def.initial_variables()["x"], json!(0));
        assert_eq!(
            def.get_node("check").unwrap().node_type,
            NodeType::Condition
        );
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let doc = json!({
            "name": "bad",
            "nodes": [{"id": "start", "type": "teleport"}],
            "edges": []
        });
        assert!(matches!(
            ProcessDefinition::from_json(&doc),
            Err(DefinitionError::Parse(_))
        ));
    }

    #[test]
    fn test_node_type_wire_names() {
        assert_eq!(NodeType::SubProcess.as_str(), "sub_process");
        assert_eq!(
            serde_json::to_string(&NodeType::EventWait).unwrap(),
            "\"event_wait\""
        );
    }
}
