//! Claude backend over the Anthropic Messages API.
//!
//! The chat history is converted on the way out: system messages become the
//! top-level `system` field, tool calls become `tool_use` blocks and tool
//! results become `tool_result` blocks inside a user turn.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    http_client, parse_retry_after, ChatMessage, ContentPart, LlmClient, LlmError,
    MessageContent, ModelRequest, ModelResponse, Role, TokenUsage, ToolCall,
};
use crate::config::{ConfigError, LlmProfile};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(profile: &LlmProfile, timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = profile
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Invalid("claude backend requires llm.api_key".into()))?;
        let base = profile
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_API_URL)
            .trim_end_matches('/');
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: format!("{}/v1/messages", base),
            api_key,
            model: profile.model.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "claude"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let body = build_body(&self.model, request);
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            // 529 is Anthropic's "overloaded"
            return Err(LlmError::from_status(status.as_u16(), &text, retry_after));
        }

        parse_response(&text, &self.model)
    }
}

fn build_body(model: &str, request: &ModelRequest) -> Value {
    let system: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(ChatMessage::text_content)
        .collect();

    let mut messages: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = convert_message(message);
        if blocks.is_empty() {
            continue;
        }
        // Consecutive turns of the same role must be merged.
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => messages.push(json!({ "role": role, "content": blocks })),
        }
    }

    let mut body = json!({
        "model": model,
        "max_tokens": request.params.reserved_tokens,
        "temperature": request.params.temperature,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "input_schema": t.function.parameters,
                    })
                })
                .collect(),
        );
    }
    body
}

fn convert_message(message: &ChatMessage) -> (&'static str, Vec<Value>) {
    match message.role {
        Role::Tool => {
            let content = message
                .content
                .as_ref()
                .map(content_blocks)
                .unwrap_or_default();
            let block = json!({
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": content,
            });
            ("user", vec![block])
        }
        Role::Assistant => {
            let mut blocks = message
                .content
                .as_ref()
                .map(content_blocks)
                .unwrap_or_default();
            for call in message.tool_calls.iter().flatten() {
                let input: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
            ("assistant", blocks)
        }
        Role::User | Role::System => (
            "user",
            message
                .content
                .as_ref()
                .map(content_blocks)
                .unwrap_or_default(),
        ),
    }
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![json!({ "type": "text", "text": text })],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect(),
    }
}

fn image_block(url: &str) -> Value {
    // data:image/png;base64,AAAA
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((meta, data)) = rest.split_once(',') {
            let media_type = meta.trim_end_matches(";base64");
            return json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            });
        }
    }
    json!({ "type": "image", "source": { "type": "url", "url": url } })
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_response(body: &str, model: &str) -> Result<ModelResponse, LlmError> {
    let parsed: MessagesResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse(format!(
            "Failed to parse Claude response: {}, body: {}",
            e,
            &body[..body.len().min(500)]
        ))
    })?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in parsed.content {
        match block {
            ResponseBlock::Text { text: t } => text.push(t),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::function(id, name, input.to_string()))
            }
            ResponseBlock::Other => {}
        }
    }
    let content = text.join("\n");

    Ok(ModelResponse {
        content: if content.is_empty() { None } else { Some(content) },
        tool_calls,
        finish_reason: parsed.stop_reason,
        usage: parsed
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
        model: parsed.model.or_else(|| Some(model.to_string())),
        provider: "claude".to_string(),
    })
}
