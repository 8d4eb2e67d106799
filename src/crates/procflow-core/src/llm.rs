//! LLM client trait and message types
//!
//! The engine is an orchestration framework, not an LLM client library: this
//! module defines only the trait the AI_TASK executor consumes. Providers
//! (OpenAI, Anthropic, Ollama, a local server, a test stub) implement
//! [`ChatModel`] and are injected through
//! [`Dependencies`](crate::deps::Dependencies) as `Arc<dyn ChatModel>`.

use crate::deps::DependencyError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Response from a chat completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant message content
    pub content: String,
    /// Total tokens consumed by the call
    pub total_tokens: u64,
}

/// Options for a chat completion
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Provider model override from node config
    pub model: Option<String>,
}

/// Provider-agnostic chat model interface
///
/// Implementations must be `Send + Sync`; they are shared across concurrent
/// executions as `Arc<dyn ChatModel>`.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a completion for the message sequence
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChatResponse, DependencyError>;

    /// Whether this model can describe images (OCR delegation)
    fn supports_vision(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("be brief");
        assert_eq!(msg.role, MessageRole::System);
        assert_eq!(msg.content, "be brief");
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
