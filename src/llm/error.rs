//! LLM error types with retry classification.
//!
//! Distinguishes between transient errors (retry with backoff) and permanent
//! errors (surface to the orchestrator immediately).

use std::time::Duration;

/// Error from an LLM backend call.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    pub fn unavailable(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::ProviderUnavailable,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid_credentials(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::InvalidCredentials,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn context_too_large(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ContextTooLarge, message)
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Parse, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            LlmErrorKind::Timeout,
            format!("no response within {:?}", after),
        )
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = classify_http_status(status, body);
        Self {
            kind,
            status_code: Some(status),
            message: body.chars().take(500).collect(),
            retry_after: if kind == LlmErrorKind::RateLimited {
                retry_after
            } else {
                None
            },
        }
    }

    /// Map a reqwest transport failure.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(LlmErrorKind::Timeout, format!("Request timeout: {}", e))
        } else if e.is_connect() {
            Self::network(format!("Connection failed: {}", e))
        } else {
            Self::network(format!("Request failed: {}", e))
        }
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before the next attempt.
    ///
    /// `Retry-After` wins; otherwise `base * 2^attempt`, capped at `max`.
    pub fn suggested_delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after.min(max);
        }
        let base = match self.kind {
            // Start higher for rate limits
            LlmErrorKind::RateLimited => base.saturating_mul(2),
            _ => base,
        };
        let multiplier = 2u32.saturating_pow(attempt.min(16));
        base.saturating_mul(multiplier).min(max)
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    /// 5xx or overloaded backend - transient
    ProviderUnavailable,
    /// 429 - transient, retry with backoff
    RateLimited,
    /// 401/403 - fatal to the agent
    InvalidCredentials,
    /// Prompt does not fit the model's window
    ContextTooLarge,
    /// Connection failure - transient
    Network,
    /// Request exceeded the configured timeout - transient
    Timeout,
    /// Response body could not be understood
    Parse,
    /// Other 4xx
    Client,
}

impl LlmErrorKind {
    /// Check if this error kind is transient (retry with same backend).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ProviderUnavailable
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }

    /// Errors that end the agent run immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LlmErrorKind::InvalidCredentials)
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::ProviderUnavailable => write!(f, "Provider unavailable"),
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::InvalidCredentials => write!(f, "Invalid credentials"),
            LlmErrorKind::ContextTooLarge => write!(f, "Context too large"),
            LlmErrorKind::Network => write!(f, "Network error"),
            LlmErrorKind::Timeout => write!(f, "Timeout"),
            LlmErrorKind::Parse => write!(f, "Parse error"),
            LlmErrorKind::Client => write!(f, "Client error"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    pub max_delay: Duration,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}

/// Parse an HTTP status (and body hints) into an error kind.
pub fn classify_http_status(status: u16, body: &str) -> LlmErrorKind {
    let lower = body.to_lowercase();
    let mentions_context = lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("context window")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long");
    match status {
        401 | 403 => LlmErrorKind::InvalidCredentials,
        429 => LlmErrorKind::RateLimited,
        413 => LlmErrorKind::ContextTooLarge,
        400 if mentions_context => LlmErrorKind::ContextTooLarge,
        408 => LlmErrorKind::Timeout,
        400..=499 => LlmErrorKind::Client,
        _ => LlmErrorKind::ProviderUnavailable,
    }
}
