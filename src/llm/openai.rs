//! OpenAI-compatible chat completions client.
//!
//! Serves four flavors that share the wire format:
//! - `openai`: `{base_url}/chat/completions` with a bearer key
//! - `azure`: `{base_url}/openai/deployments/{model}/chat/completions?api-version=...`
//!   with an `api-key` header
//! - `ollama`: local OpenAI-compatible endpoint, no key
//! - `ppio`: PPIO's OpenAI-compatible endpoint; `base_url` and key required

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    http_client, parse_retry_after, ChatMessage, LlmClient, LlmError, ModelRequest,
    ModelResponse, TokenUsage, ToolCall, ToolDefinition,
};
use crate::config::{ConfigError, LlmProfile};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const OLLAMA_API_URL: &str = "http://localhost:11434/v1";
const AZURE_DEFAULT_API_VERSION: &str = "2024-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenAi,
    Azure,
    Ollama,
    Ppio,
}

impl OpenAiFlavor {
    fn provider(&self) -> &'static str {
        match self {
            OpenAiFlavor::OpenAi => "openai",
            OpenAiFlavor::Azure => "azure",
            OpenAiFlavor::Ollama => "ollama",
            OpenAiFlavor::Ppio => "ppio",
        }
    }
}

/// Client for OpenAI-style chat completion endpoints.
pub struct OpenAiClient {
    client: Client,
    flavor: OpenAiFlavor,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        flavor: OpenAiFlavor,
        profile: &LlmProfile,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let endpoint = match flavor {
            OpenAiFlavor::OpenAi => format!(
                "{}/chat/completions",
                profile
                    .base_url
                    .as_deref()
                    .unwrap_or(OPENAI_API_URL)
                    .trim_end_matches('/')
            ),
            OpenAiFlavor::Ollama => format!(
                "{}/chat/completions",
                profile
                    .base_url
                    .as_deref()
                    .unwrap_or(OLLAMA_API_URL)
                    .trim_end_matches('/')
            ),
            OpenAiFlavor::Ppio => {
                let base = profile.base_url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("ppio backend requires llm.base_url".into())
                })?;
                format!("{}/chat/completions", base.trim_end_matches('/'))
            }
            OpenAiFlavor::Azure => {
                let base = profile.base_url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("azure backend requires llm.base_url".into())
                })?;
                format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    base.trim_end_matches('/'),
                    profile.model,
                    profile
                        .api_version
                        .as_deref()
                        .unwrap_or(AZURE_DEFAULT_API_VERSION)
                )
            }
        };
        if flavor != OpenAiFlavor::Ollama && profile.api_key.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} backend requires llm.api_key",
                flavor.provider()
            )));
        }

        Ok(Self {
            client: http_client(timeout)?,
            flavor,
            endpoint,
            api_key: profile.api_key.clone(),
            model: profile.model.clone(),
        })
    }

    fn build_request<'a>(&'a self, request: &'a ModelRequest) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(&request.tools)
            },
            temperature: request.params.temperature,
            max_tokens: request.params.reserved_tokens,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &str {
        self.flavor.provider()
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let body = self.build_request(request);
        let mut builder = self.client.post(&self.endpoint).json(&body);
        builder = match (self.flavor, self.api_key.as_deref()) {
            (OpenAiFlavor::Azure, Some(key)) => builder.header("api-key", key),
            (_, Some(key)) => builder.bearer_auth(key),
            (_, None) => builder,
        };

        let response = builder.send().await.map_err(LlmError::from_reqwest)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(LlmError::from_reqwest)?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text, retry_after));
        }

        parse_response(&text, self.flavor.provider(), &self.model)
    }
}

fn parse_response(body: &str, provider: &str, model: &str) -> Result<ModelResponse, LlmError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse(format!(
            "Failed to parse response: {}, body: {}",
            e,
            &body[..body.len().min(500)]
        ))
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse("No choices in response"))?;

    Ok(ModelResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        finish_reason: choice.finish_reason,
        usage: parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        model: parsed.model.or_else(|| Some(model.to_string())),
        provider: provider.to_string(),
    })
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    temperature: f64,
    max_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(api_type: &str) -> LlmProfile {
        LlmProfile {
            api_type: api_type.to_string(),
            model: "gpt-test".to_string(),
            api_key: Some("sk-test".to_string()),
            ..LlmProfile::default()
        }
    }

    #[test]
    fn test_endpoints() {
        let timeout = Duration::from_secs(5);
        let openai = OpenAiClient::new(OpenAiFlavor::OpenAi, &profile("openai"), timeout).unwrap();
        assert_eq!(openai.endpoint, "https://api.openai.com/v1/chat/completions");

        let mut azure_profile = profile("azure");
        azure_profile.base_url = Some("https://acme.openai.azure.com/".to_string());
        let azure = OpenAiClient::new(OpenAiFlavor::Azure, &azure_profile, timeout).unwrap();
        assert_eq!(
            azure.endpoint,
            "https://acme.openai.azure.com/openai/deployments/gpt-test/chat/completions?api-version=2024-06-01"
        );

        let mut ollama_profile = profile("ollama");
        ollama_profile.api_key = None;
        let ollama = OpenAiClient::new(OpenAiFlavor::Ollama, &ollama_profile, timeout).unwrap();
        assert_eq!(ollama.endpoint, "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_key_required_for_hosted() {
        let mut p = profile("openai");
        p.api_key = None;
        assert!(OpenAiClient::new(OpenAiFlavor::OpenAi, &p, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_ppio_endpoint_and_request() {
        let timeout = Duration::from_secs(5);
        let mut p = profile("ppio");
        p.model = "deepseek/deepseek-v3-0324".to_string();
        assert!(OpenAiClient::new(OpenAiFlavor::Ppio, &p, timeout).is_err());

        p.base_url = Some("https://api.ppinfra.com/v3/openai/".to_string());
        let ppio = OpenAiClient::new(OpenAiFlavor::Ppio, &p, timeout).unwrap();
        assert_eq!(ppio.endpoint, "https://api.ppinfra.com/v3/openai/chat/completions");
        assert_eq!(ppio.provider(), "ppio");

        let request = ModelRequest {
            messages: vec![ChatMessage::new(crate::llm::Role::User, "hi")],
            tools: Vec::new(),
            params: crate::llm::GenerationParams {
                temperature: 0.2,
                max_tokens: 16_000,
                reserved_tokens: 2_000,
            },
        };
        let body = serde_json::to_value(ppio.build_request(&request)).unwrap();
        assert_eq!(body["model"], "deepseek/deepseek-v3-0324");
        assert_eq!(body["max_tokens"], 2_000);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("tools").is_none());

        p.api_key = None;
        assert!(OpenAiClient::new(OpenAiFlavor::Ppio, &p, timeout).is_err());
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = r#"{
            "model": "gpt-test",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        }"#;
        let response = parse_response(body, "openai", "gpt-test").unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "read_file");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_empty_choices() {
        let err = parse_response(r#"{"choices": []}"#, "openai", "m").unwrap_err();
        assert_eq!(err.kind, super::super::LlmErrorKind::Parse);
    }
}
