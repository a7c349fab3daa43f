//! AWS Bedrock backend over the Converse API.
//!
//! Authenticates with a Bedrock API key (bearer token), so no SigV4 signing
//! is needed. The endpoint is derived from the region unless `base_url`
//! overrides it.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    http_client, parse_retry_after, ChatMessage, ContentPart, LlmClient, LlmError,
    MessageContent, ModelRequest, ModelResponse, Role, TokenUsage, ToolCall,
};
use crate::config::{ConfigError, LlmProfile};

const DEFAULT_REGION: &str = "us-east-1";

pub struct BedrockClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl BedrockClient {
    pub fn new(profile: &LlmProfile, timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = profile.api_key.clone().ok_or_else(|| {
            ConfigError::Invalid("bedrock backend requires llm.api_key".into())
        })?;
        let base = match profile.base_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://bedrock-runtime.{}.amazonaws.com",
                profile.region.as_deref().unwrap_or(DEFAULT_REGION)
            ),
        };
        Ok(Self {
            client: http_client(timeout)?,
            endpoint: format!(
                "{}/model/{}/converse",
                base,
                urlencoding::encode(&profile.model)
            ),
            api_key,
            model: profile.model.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for BedrockClient {
    fn provider(&self) -> &str {
        "bedrock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&build_body(request))
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text, retry_after));
        }
        parse_response(&text, &self.model)
    }
}

fn build_body(request: &ModelRequest) -> Value {
    let system: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| json!({ "text": m.text_content() }))
        .collect();

    let mut messages: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = convert_message(message);
        if blocks.is_empty() {
            continue;
        }
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
        "messages": messages,
        "inferenceConfig": {
            "maxTokens": request.params.reserved_tokens,
            "temperature": request.params.temperature,
        },
    });
    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "toolSpec": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "inputSchema": { "json": t.function.parameters },
                    }
                })
            })
            .collect();
        body["toolConfig"] = json!({ "tools": tools });
    }
    body
}

fn convert_message(message: &ChatMessage) -> (&'static str, Vec<Value>) {
    let blocks = message
        .content
        .as_ref()
        .map(content_blocks)
        .unwrap_or_default();
    match message.role {
        Role::Tool => {
            let block = json!({
                "toolResult": {
                    "toolUseId": message.tool_call_id.clone().unwrap_or_default(),
                    "content": blocks,
                }
            });
            ("user", vec![block])
        }
        Role::Assistant => {
            let mut blocks = blocks;
            for call in message.tool_calls.iter().flatten() {
                let input: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                blocks.push(json!({
                    "toolUse": { "toolUseId": call.id, "name": call.function.name, "input": input }
                }));
            }
            ("assistant", blocks)
        }
        Role::User | Role::System => ("user", blocks),
    }
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![json!({ "text": text })],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({ "text": text })),
                ContentPart::ImageUrl { image_url } => image_block(&image_url.url),
            })
            .collect(),
    }
}

/// Converse only accepts inline bytes; remote URLs are described as text.
fn image_block(url: &str) -> Option<Value> {
    let Some((meta, data)) = url.strip_prefix("data:").and_then(|r| r.split_once(',')) else {
        return Some(json!({ "text": format!("[image: {}]", url) }));
    };
    let format = meta
        .trim_end_matches(";base64")
        .strip_prefix("image/")
        .unwrap_or("png");
    // Validate before shipping; a bad payload would fail the whole request.
    base64::engine::general_purpose::STANDARD.decode(data).ok()?;
    Some(json!({ "image": { "format": format, "source": { "bytes": data } } }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ConverseUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ConverseMessage,
}

#[derive(Debug, Deserialize)]
struct ConverseMessage {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
    input_tokens: u64,
    output_tokens: u64,
}

fn parse_response(body: &str, model: &str) -> Result<ModelResponse, LlmError> {
    let parsed: ConverseResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse(format!(
            "Failed to parse Bedrock response: {}, body: {}",
            e,
            &body[..body.len().min(500)]
        ))
    })?;

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in parsed.output.message.content {
        if let Some(t) = block.get("text").and_then(Value::as_str) {
            text.push(t.to_string());
        } else if let Some(tool_use) = block.get("toolUse") {
            let id = tool_use["toolUseId"].as_str().unwrap_or_default();
            let name = tool_use["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                return Err(LlmError::parse("toolUse block without a name"));
            }
            tool_calls.push(ToolCall::function(id, name, tool_use["input"].to_string()));
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
        model: Some(model.to_string()),
        provider: "bedrock".to_string(),
    })
}
