//! # procflow-core
//!
//! Core engine for durable, resumable process execution. A process is a
//! directed graph of heterogeneous nodes - conditions, loops, AI calls, tool
//! invocations, HTTP requests, human approvals, data operations, delays,
//! sub-processes - walked step by step by [`ProcessEngine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ProcessEngine                                               │
//! │  • step loop: quota → validate → execute → bookkeeping       │
//! │  • retry/timeout envelopes around every executor             │
//! │  • checkpoints + waiting results (durable pauses)            │
//! │  • LOOP / WHILE / PARALLEL / SUB_PROCESS driven here         │
//! └───────┬──────────────────────┬───────────────────────────────┘
//!         │                      │
//!         ▼                      ▼
//! ┌──────────────────┐   ┌─────────────────────────────────────┐
//! │  ProcessState    │   │  ExecutorRegistry                   │
//! │  • variables     │   │  node type → NodeExecutor           │
//! │  • frames        │   │  (flow/logic/task/integration/      │
//! │  • checkpoints   │   │   human/data/timing families)       │
//! │  • masking       │   └───────────────┬─────────────────────┘
//! └──────────────────┘                   │
//!                                        ▼
//!                        ┌─────────────────────────────────────┐
//!                        │  Dependencies (injected)            │
//!                        │  LLM · tools · HTTP · DB · queue ·  │
//!                        │  notifications · user directory ·   │
//!                        │  document services · sub-processes  │
//!                        └─────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use procflow_core::{Dependencies, ProcessContext, ProcessDefinition, ProcessEngine};
//! use std::sync::Arc;
//!
//! let definition = ProcessDefinition::from_json(&document)?;
//! let deps = Arc::new(Dependencies::new().with_llm(my_model));
//! let mut engine = ProcessEngine::new(definition, ProcessContext::new("exec-1"), deps);
//!
//! let result = engine.execute(trigger_input).await;
//! if result.is_waiting() {
//!     // persist engine.checkpoint(); resume later with engine.resume(...)
//! }
//! ```

pub mod context;
pub mod definition;
pub mod deps;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod expression;
pub mod llm;
pub mod nodes;
pub mod result;
pub mod state;
pub mod tool;

pub use context::ProcessContext;
pub use definition::{
    NodeConfig, NodeType, ProcessDefinition, ProcessEdge, ProcessNode, ProcessSettings,
    ProcessTrigger, ProcessVariable, RetryConfig, TimeoutAction, TimeoutConfig,
};
pub use deps::{
    AssigneeDescriptor, AssigneeDescriptorKind, DatabaseConnection, DatabaseDescriptor,
    DatabaseKind, Dependencies, DependencyError, DocumentExtractor, DocumentFormat,
    DocumentRenderer, HttpBody, HttpClient, HttpRequestSpec, HttpResponseData,
    NotificationRequest, NotificationService, QueueKind, QueuePublisher, ReqwestHttpClient,
    SubProcessOutcome, SubProcessRequest, SubProcessRunner, UserAttributes, UserDirectory,
};
pub use engine::{CheckpointSink, EngineOptions, ProcessEngine};
pub use error::{DefinitionError, ErrorCategory, ExecutionError};
pub use event::{ProcessEvent, ProcessEventType};
pub use executor::{execute_with_retry, execute_with_timeout, ExecutorRegistry, NodeExecutor};
pub use expression::ExpressionError;
pub use llm::{ChatMessage, ChatModel, ChatOptions, ChatResponse, MessageRole};
pub use result::{ExecutionStatus, NodeResult, ProcessResult, WaitingKind};
pub use state::{LoopFrame, ParallelFrame, ProcessState, REDACTED};
pub use tool::{Tool, ToolOutcome};
