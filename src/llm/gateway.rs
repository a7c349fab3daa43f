//! Model gateway: one call shape over a text backend and an optional vision
//! backend.
//!
//! Every request is fitted to the backend's token budget before dispatch,
//! bounded by a per-call timeout, and retried with exponential backoff when
//! the failure is transient.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::tokens::estimate_tools_tokens;
use super::{
    create_client, ChatMessage, ContentPart, GenerationParams, LlmClient, LlmError,
    MessageContent, ModelRequest, ModelResponse, RetryConfig, TokenBudget, ToolDefinition,
};
use crate::config::{ConfigError, LlmConfig, LlmProfile};

const IMAGE_PLACEHOLDER: &str = "[image omitted: no vision model configured]";

/// A backend together with the parameters requests to it use.
struct Route {
    client: Arc<dyn LlmClient>,
    params: GenerationParams,
    timeout: Duration,
}

impl Route {
    /// Budget left for messages once the tool schemas are accounted for.
    fn budget(&self, tools_tokens: u64) -> TokenBudget {
        TokenBudget::new(self.params.max_tokens, self.params.reserved_tokens)
            .reserving(tools_tokens)
    }
}

/// Snapshot of gateway usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayUsage {
    pub requests: u64,
    pub failures: u64,
    pub vision_requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Default)]
struct UsageCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    vision_requests: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

pub struct ModelGateway {
    text: Route,
    vision: Option<Route>,
    retry: RetryConfig,
    usage: UsageCounters,
}

impl ModelGateway {
    pub fn new(client: Arc<dyn LlmClient>, params: GenerationParams, timeout: Duration) -> Self {
        Self {
            text: Route {
                client,
                params,
                timeout,
            },
            vision: None,
            retry: RetryConfig::default(),
            usage: UsageCounters::default(),
        }
    }

    /// Build the gateway described by the `[llm]` table.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let profile = &config.profile;
        let mut gateway = Self::new(
            create_client(profile)?,
            params_for(profile),
            Duration::from_secs(profile.timeout),
        )
        .with_retry(RetryConfig {
            max_retries: profile.max_retries,
            ..RetryConfig::default()
        });
        if let Some(vision) = &config.vision {
            gateway = gateway.with_vision(
                create_client(vision)?,
                params_for(vision),
                Duration::from_secs(vision.timeout),
            );
        }
        Ok(gateway)
    }

    pub fn with_vision(
        mut self,
        client: Arc<dyn LlmClient>,
        params: GenerationParams,
        timeout: Duration,
    ) -> Self {
        self.vision = Some(Route {
            client,
            params,
            timeout,
        });
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn has_vision(&self) -> bool {
        self.vision.is_some()
    }

    pub fn provider(&self) -> &str {
        self.text.client.provider()
    }

    pub fn usage(&self) -> GatewayUsage {
        GatewayUsage {
            requests: self.usage.requests.load(Ordering::Relaxed),
            failures: self.usage.failures.load(Ordering::Relaxed),
            vision_requests: self.usage.vision_requests.load(Ordering::Relaxed),
            prompt_tokens: self.usage.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.usage.completion_tokens.load(Ordering::Relaxed),
        }
    }

    /// Ask the model for the next action given the conversation so far.
    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let tools_tokens = estimate_tools_tokens(tools);
        let (route, messages, is_vision) = self.route(messages, tools_tokens)?;
        let request = ModelRequest {
            messages,
            tools: tools.to_vec(),
            params: route.params,
        };

        self.usage.requests.fetch_add(1, Ordering::Relaxed);
        if is_vision {
            self.usage.vision_requests.fetch_add(1, Ordering::Relaxed);
        }

        match self.execute_with_retry(route, &request).await {
            Ok(response) => {
                if let Some(usage) = response.usage {
                    self.usage
                        .prompt_tokens
                        .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
                    self.usage
                        .completion_tokens
                        .fetch_add(usage.completion_tokens, Ordering::Relaxed);
                }
                Ok(response)
            }
            Err(e) => {
                self.usage.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Pick a backend from the content and fit the history to its budget.
    fn route(
        &self,
        messages: Vec<ChatMessage>,
        tools_tokens: u64,
    ) -> Result<(&Route, Vec<ChatMessage>, bool), LlmError> {
        let has_images = messages.iter().any(ChatMessage::has_images);
        if has_images {
            if let Some(vision) = &self.vision {
                let fitted = vision.budget(tools_tokens).fit(messages.clone())?;
                if fitted.iter().any(ChatMessage::has_images) {
                    tracing::debug!(
                        model = vision.client.model(),
                        "Routing request with image content to vision backend"
                    );
                    return Ok((vision, fitted, true));
                }
            }
        }

        let messages = if has_images {
            strip_images(messages)
        } else {
            messages
        };
        let fitted = self.text.budget(tools_tokens).fit(messages)?;
        Ok((&self.text, fitted, false))
    }

    async fn execute_with_retry(
        &self,
        route: &Route,
        request: &ModelRequest,
    ) -> Result<ModelResponse, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let result = match tokio::time::timeout(route.timeout, route.client.generate(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::timeout(route.timeout)),
            };

            let error = match result {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !self.retry.should_retry(&error, attempt) {
                if attempt > 0 {
                    tracing::error!(
                        provider = route.client.provider(),
                        "Request failed after {} retries (total time: {:?}): {}",
                        attempt,
                        start.elapsed(),
                        error
                    );
                } else {
                    tracing::error!(
                        provider = route.client.provider(),
                        "Request failed (non-retryable): {}",
                        error
                    );
                }
                return Err(error);
            }

            let delay =
                error.suggested_delay(attempt, self.retry.base_delay, self.retry.max_delay);
            let remaining = self
                .retry
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let actual_delay = delay.min(remaining);
            if actual_delay.is_zero() {
                tracing::warn!(
                    "Retry attempt {} failed, no time remaining: {}",
                    attempt + 1,
                    error
                );
                return Err(error);
            }

            tracing::warn!(
                "Retry attempt {} failed with {}, retrying in {:?}: {}",
                attempt + 1,
                error.kind,
                actual_delay,
                error.message
            );
            tokio::time::sleep(actual_delay).await;
            attempt += 1;
        }
    }
}

fn params_for(profile: &LlmProfile) -> GenerationParams {
    GenerationParams {
        temperature: profile.temperature,
        max_tokens: profile.max_tokens,
        reserved_tokens: profile.reserved_tokens,
    }
}

/// Replace image parts with a text placeholder for text-only backends.
fn strip_images(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .map(|mut message| {
            if let Some(MessageContent::Parts(parts)) = &message.content {
                let text = parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => text.as_str(),
                        ContentPart::ImageUrl { .. } => IMAGE_PLACEHOLDER,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                message.content = Some(MessageContent::Text(text));
            }
            message
        })
        .collect()
}
