//! Error taxonomy for process execution
//!
//! This module defines the two error shapes the engine works with:
//!
//! - [`ExecutionError`] - the *domain* error attached to node and process
//!   results. It is a plain serializable struct (not a `std::error::Error`
//!   chain) because it travels: it is persisted on execution records,
//!   rendered to end users, and replayed on resume.
//! - [`DefinitionError`] - construction-time validation failures for process
//!   definitions, via `thiserror`.
//!
//! # Dual rendering
//!
//! Every `ExecutionError` can be rendered two ways:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  ExecutionError                                      │
//! │  • category: external                               │
//! │  • code: "HTTP_503"                                  │
//! │  • message: "HTTP request failed with status 503"    │
//! │  • is_retryable: true                                │
//! └────────────┬─────────────────────────┬───────────────┘
//!              │ to_technical_json()     │ to_user_json()
//!              ▼                         ▼
//!   logs / audit trail        "Service Error" +
//!   (full detail)             "The service is temporarily
//!                              unavailable. Please try again later."
//! ```
//!
//! The user rendering never exposes technical detail; it maps the stable
//! `code` to a plain-language title, message, and action hint. Sensitive
//! variable values are scrubbed by the state container before any error
//! text leaves the engine (see [`crate::state::ProcessState::mask_text`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Category of an execution error
///
/// Categories drive the user-facing title and coarse-grained handling
/// (e.g. authorization failures are never retried).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input validation failed
    Validation,
    /// Misconfiguration
    Configuration,
    /// Network/connection error
    Connection,
    /// Auth failed
    Authentication,
    /// Permission denied
    Authorization,
    /// Operation timed out
    Timeout,
    /// Rate limited
    RateLimit,
    /// Resource missing or exhausted
    Resource,
    /// Business rule violation
    BusinessLogic,
    /// Internal error
    Internal,
    /// External service error
    External,
    /// User cancelled
    UserCancelled,
}

impl ErrorCategory {
    /// Business-friendly title for this category
    pub fn user_title(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "Validation Issue",
            ErrorCategory::Configuration => "Setup Problem",
            ErrorCategory::Connection => "Connection Problem",
            ErrorCategory::Authentication => "Authentication Issue",
            ErrorCategory::Authorization => "Permission Issue",
            ErrorCategory::Timeout => "Taking Too Long",
            ErrorCategory::RateLimit => "Too Many Requests",
            ErrorCategory::Resource => "Limit Reached",
            ErrorCategory::BusinessLogic => "Check Failed",
            ErrorCategory::Internal => "Something Went Wrong",
            ErrorCategory::External => "Service Error",
            ErrorCategory::UserCancelled => "Cancelled",
        }
    }
}

/// Detailed error information attached to node and process results
///
/// Carries both a technical message (for logs and the audit trail) and an
/// optional business message (plain language, for end users). The stable
/// `code` is the programmatic handle; new codes must be added to
/// [`ExecutionError::user_message`] when they have a user-facing meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Error category
    pub category: ErrorCategory,

    /// Stable code for programmatic handling (e.g. `CONDITION_EVAL_FAILED`)
    pub code: String,

    /// Technical, human-readable message
    pub message: String,

    /// Additional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Plain-language explanation for business users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_message: Option<String>,

    /// Whether the user can fix this (config issue) vs needs IT (bug)
    #[serde(default = "default_true")]
    pub is_user_fixable: bool,

    /// Whether the failed operation may be retried
    #[serde(default)]
    pub is_retryable: bool,

    /// Suggested retry delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,

    /// Node that produced the error, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node_id: Option<String>,

    /// Captured backtrace or upstream error chain, for debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,

    /// When the error occurred
    pub occurred_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ExecutionError {
    /// Create an error with category and code; remaining fields defaulted
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            details: None,
            business_message: None,
            is_user_fixable: true,
            is_retryable: false,
            retry_after_seconds: None,
            source_node_id: None,
            stack_trace: None,
            occurred_at: Utc::now(),
        }
    }

    /// Create a validation error
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, "VALIDATION_ERROR", message)
    }

    /// Create a connection error (retryable by default)
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, "CONNECTION_ERROR", message)
            .retryable(true)
            .with_retry_after(5)
    }

    /// Create a timeout error
    pub fn timeout_error(message: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::new(ErrorCategory::Timeout, "TIMEOUT_ERROR", message)
            .with_details(json!({ "timeout_seconds": timeout_seconds }))
            .retryable(true)
            .with_retry_after(10)
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, "INTERNAL_ERROR", message).user_fixable(false)
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a plain-language message for end users
    pub fn with_business_message(mut self, message: impl Into<String>) -> Self {
        self.business_message = Some(message.into());
        self
    }

    /// Set retryability
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }

    /// Suggest a retry delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    /// Set user-fixability
    pub fn user_fixable(mut self, fixable: bool) -> Self {
        self.is_user_fixable = fixable;
        self
    }

    /// Record the node that raised the error
    pub fn with_source_node(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = Some(node_id.into());
        self
    }

    /// Attach an upstream error chain for debugging
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Business-friendly title (derived from category)
    pub fn user_title(&self) -> &'static str {
        self.category.user_title()
    }

    /// Business-friendly message
    ///
    /// Uses the explicit `business_message` when set, otherwise maps the
    /// stable code to a canned message. `HTTP_4xx`/`HTTP_5xx` codes fall
    /// back to a class-level message; everything else falls back to a
    /// generic line that leaks nothing technical.
    pub fn user_message(&self) -> String {
        if let Some(msg) = &self.business_message {
            return msg.clone();
        }

        let canned = match self.code.as_str() {
            "NO_LLM" => "The AI service is not configured. Please contact your administrator.",
            "LLM_ERROR" => "The AI couldn't process your request. Please try again.",
            "INVALID_JSON" => {
                "The AI step could not produce structured data from the input. \
                 The extracted content may not match what was expected."
            }
            "AI_HALLUCINATION" => {
                "The AI generated data that doesn't match the actual input. \
                 The step has been stopped to prevent incorrect results."
            }
            "TOOL_ACCESS_DENIED" => "You don't have permission to use this feature.",
            "TOOL_NOT_AVAILABLE" => "This feature is not available for this workflow.",
            "TOOL_NOT_FOUND" => "The selected tool was not found.",
            "TOOL_ERROR" => "The tool encountered an error. Please try again.",
            "DB_CONNECTION_NOT_FOUND" => {
                "Database connection not found. Please check your settings."
            }
            "DB_ERROR" => "Could not access the database. Please try again.",
            "HTTP_ERROR" => "Could not connect to the service. Please check your connection.",
            "CONNECTION_ERROR" => "Connection failed. Please check your network.",
            "AUTH_CONFIG_ERROR" => "Authentication settings are incorrect.",
            "AUTHENTICATION_FAILED" => "Login failed. Please check your credentials.",
            "MAX_NODES_EXCEEDED" => "This workflow is too complex. Please simplify it.",
            "TIMEOUT_ERROR" => "The operation took too long. Please try again.",
            "NO_EXECUTOR" => "This step type is not supported.",
            "UNSUPPORTED_STORAGE" => "This storage type is not supported.",
            "UNSUPPORTED_QUEUE" => "This message queue type is not supported.",
            "FILE_NOT_FOUND" => {
                "The uploaded file could not be found on the server. \
                 Please re-upload and try again."
            }
            "EXTRACTION_FAILED" => {
                "Could not read content from the uploaded file. \
                 The file may be corrupted or in an unsupported format."
            }
            "NO_RECIPIENTS" => {
                "The notification could not be sent because no valid recipient was configured."
            }
            "QUEUE_ERROR" => "Could not send the message. Please try again.",
            "VALIDATION_FAILED" => "The data didn't pass the required checks.",
            "VALIDATION_ERROR" => "The step configuration is incomplete or incorrect.",
            _ => "",
        };
        if !canned.is_empty() {
            return canned.to_string();
        }

        if let Some(status) = self.code.strip_prefix("HTTP_") {
            if status.starts_with('4') {
                return "The service rejected the request. Please check your settings."
                    .to_string();
            }
            if status.starts_with('5') {
                return "The service is temporarily unavailable. Please try again later."
                    .to_string();
            }
        }

        "An error occurred. Please try again or contact support.".to_string()
    }

    /// Short hint telling the user what to do next
    pub fn action_hint(&self) -> &'static str {
        if self.is_user_fixable {
            "You may be able to fix this by updating the workflow configuration."
        } else {
            "This appears to be a technical issue. Please share the technical \
             details with your IT team for investigation."
        }
    }

    /// Technical rendering for logs and the audit trail
    pub fn to_technical_json(&self) -> Value {
        json!({
            "category": self.category,
            "code": self.code,
            "message": self.message,
            "details": self.details,
            "business_message": self.business_message,
            "is_user_fixable": self.is_user_fixable,
            "is_retryable": self.is_retryable,
            "retry_after_seconds": self.retry_after_seconds,
            "source_node_id": self.source_node_id,
            "occurred_at": self.occurred_at.to_rfc3339(),
        })
    }

    /// User-facing rendering: friendly title/message plus an action hint
    pub fn to_user_json(&self) -> Value {
        json!({
            "title": self.user_title(),
            "message": self.user_message(),
            "can_retry": self.is_retryable,
            "is_user_fixable": self.is_user_fixable,
            "action_hint": self.action_hint(),
        })
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors raised while constructing or validating a process definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Definition JSON could not be parsed
    #[error("invalid process definition: {0}")]
    Parse(#[from] serde_json::Error),

    /// Structural validation failed (dangling edge, missing START, ...)
    #[error("process definition validation failed: {0}")]
    Validation(String),

    /// Two nodes share an id
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    /// An edge references a node that does not exist
    #[error("edge references unknown node '{0}'")]
    DanglingEdge(String),

    /// No START node present
    #[error("process has no START node")]
    NoStartNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let err = ExecutionError::new(ErrorCategory::External, "HTTP_503", "upstream down")
            .retryable(true)
            .with_retry_after(5)
            .with_source_node("fetch");

        assert!(err.is_retryable);
        assert_eq!(err.retry_after_seconds, Some(5));
        assert_eq!(err.source_node_id.as_deref(), Some("fetch"));
    }

    #[test]
    fn test_user_message_known_code() {
        let err = ExecutionError::new(ErrorCategory::Configuration, "NO_LLM", "llm missing");
        assert!(err.user_message().contains("not configured"));
        assert_eq!(err.user_title(), "Setup Problem");
    }

    #[test]
    fn test_user_message_http_classes() {
        let e4 = ExecutionError::new(ErrorCategory::External, "HTTP_404", "not found");
        assert!(e4.user_message().contains("rejected the request"));

        let e5 = ExecutionError::new(ErrorCategory::External, "HTTP_503", "unavailable");
        assert!(e5.user_message().contains("temporarily unavailable"));
    }

    #[test]
    fn test_business_message_takes_precedence() {
        let err = ExecutionError::validation_error("missing field")
            .with_business_message("Please fill in the amount field.");
        assert_eq!(err.user_message(), "Please fill in the amount field.");
    }

    #[test]
    fn test_user_json_has_no_technical_fields() {
        let err = ExecutionError::internal_error("stack overflow in reducer");
        let rendered = err.to_user_json();
        assert!(rendered.get("message").is_some());
        assert!(rendered.get("stack_trace").is_none());
        assert!(!rendered["message"]
            .as_str()
            .unwrap()
            .contains("stack overflow"));
    }

    #[test]
    fn test_serde_round_trip() {
        let err = ExecutionError::timeout_error("node timed out", 30);
        let json = serde_json::to_string(&err).unwrap();
        let back: ExecutionError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, "TIMEOUT_ERROR");
        assert!(back.is_retryable);
    }
}
