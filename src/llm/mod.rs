//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over LLM providers. Each
//! backend (OpenAI-compatible, Azure, Ollama, Claude, Bedrock) implements
//! [`LlmClient`]; the [`ModelGateway`] wraps one text backend and an optional
//! vision backend with token budgeting, timeouts and retries.
//!
//! Supports multimodal content (text + images) for vision-capable models.

mod anthropic;
mod bedrock;
mod error;
mod gateway;
mod openai;
pub mod tokens;

pub use anthropic::AnthropicClient;
pub use bedrock::BedrockClient;
pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use gateway::{GatewayUsage, ModelGateway};
pub use openai::{OpenAiClient, OpenAiFlavor};
pub use tokens::TokenBudget;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, LlmProfile};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Content part for multimodal messages (text or image).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content
    Text { text: String },
    /// Image URL content (for vision models)
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL wrapper for vision content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    /// `https://` URL or `data:image/png;base64,...`
    pub url: String,
}

impl ContentPart {
    /// Create a text content part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Create an image URL content part.
    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message content - either simple text or multimodal (text + images).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content (most common case)
    Text(String),
    /// Multimodal content array (for vision models)
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Create simple text content.
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(text.into())
    }

    /// Concatenated text of all text parts.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            MessageContent::Text(_) => 0,
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(MessageContent::text(content)),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool result, optionally carrying images.
    pub fn tool_result(tool_call_id: impl Into<String>, text: String, images: &[String]) -> Self {
        let content = if images.is_empty() {
            MessageContent::Text(text)
        } else {
            let mut parts = vec![ContentPart::text(text)];
            parts.extend(images.iter().map(ContentPart::image_url));
            MessageContent::Parts(parts)
        };
        ChatMessage {
            role: Role::Tool,
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Get the text content of this message.
    pub fn text_content(&self) -> String {
        self.content
            .as_ref()
            .map(|c| c.joined_text())
            .unwrap_or_default()
    }

    pub fn has_images(&self) -> bool {
        self.content.as_ref().map_or(false, |c| c.image_count() > 0)
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: String) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Function definition with schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Generation parameters shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    /// Model context size the prompt plus completion must fit in.
    pub max_tokens: u64,
    /// Tokens held back for the completion.
    pub reserved_tokens: u64,
}

impl GenerationParams {
    /// Tokens available for the prompt.
    pub fn context_budget(&self) -> u64 {
        self.max_tokens.saturating_sub(self.reserved_tokens)
    }
}

/// A request to a backend: bounded history plus generation parameters.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub params: GenerationParams,
}

/// Response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    /// Provider that produced the response.
    pub provider: String,
}

/// Capability implemented once per backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider identifier (`openai`, `claude`, ...).
    fn provider(&self) -> &str;

    /// Model name requests go to.
    fn model(&self) -> &str;

    /// Send one chat completion request. No retries at this layer.
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError>;
}

/// Build the backend for a configured profile.
pub fn create_client(profile: &LlmProfile) -> Result<Arc<dyn LlmClient>, ConfigError> {
    let timeout = std::time::Duration::from_secs(profile.timeout);
    let client: Arc<dyn LlmClient> = match profile.api_type.as_str() {
        "openai" => Arc::new(OpenAiClient::new(OpenAiFlavor::OpenAi, profile, timeout)?),
        "azure" => Arc::new(OpenAiClient::new(OpenAiFlavor::Azure, profile, timeout)?),
        "ollama" => Arc::new(OpenAiClient::new(OpenAiFlavor::Ollama, profile, timeout)?),
        "ppio" => Arc::new(OpenAiClient::new(OpenAiFlavor::Ppio, profile, timeout)?),
        "claude" | "anthropic" => Arc::new(AnthropicClient::new(profile, timeout)?),
        "aws" | "bedrock" => Arc::new(BedrockClient::new(profile, timeout)?),
        other => {
            return Err(ConfigError::Invalid(format!(
                "unsupported llm api_type '{}'",
                other
            )))
        }
    };
    tracing::info!(
        "Created {} backend for model {}",
        client.provider(),
        client.model()
    );
    Ok(client)
}

/// Build a `reqwest` client with the profile's timeout.
pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn parse_retry_after(
    headers: &reqwest::header::HeaderMap,
) -> Option<std::time::Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}
