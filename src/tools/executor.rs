//! Runs validated tool calls within time and output bounds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ExecutionTarget, ToolContext, ToolDescriptor, ToolError, ToolErrorKind, ToolInvocation,
    ToolOutput, ToolRegistry,
};
use crate::config::Config;
use crate::util::truncate_chars;

const TRUNCATION_MARKER: &str = "\n...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    pub default_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub max_output_chars: usize,
}

impl ExecutionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.tools.timeout),
            sandbox_timeout: Duration::from_secs(config.sandbox.timeout),
            max_output_chars: config.tools.max_output_chars,
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            sandbox_timeout: Duration::from_secs(300),
            max_output_chars: 10_000,
        }
    }
}

/// Outcome of one call, as recorded in the agent's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool output, or the error message when `is_error`.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    pub fn failure(error: &ToolError, duration: Duration) -> Self {
        Self {
            output: error.to_string(),
            structured: None,
            images: Vec::new(),
            is_error: true,
            error_kind: Some(error.kind()),
            duration_ms: duration.as_millis() as u64,
            truncated: false,
        }
    }

    fn success(output: ToolOutput, duration: Duration, max_chars: usize) -> Self {
        let (mut text, truncated) = truncate_chars(&output.text, max_chars);
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        Self {
            output: text,
            structured: output.structured,
            images: output.images,
            is_error: false,
            error_kind: None,
            duration_ms: duration.as_millis() as u64,
            truncated,
        }
    }
}

/// Executes calls against a shared, read-only registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    context: ToolContext,
    limits: ExecutionLimits,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, context: ToolContext, limits: ExecutionLimits) -> Self {
        Self {
            registry,
            context,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    fn timeout_for(&self, needs_sandbox: bool, tool_timeout: Option<Duration>) -> Duration {
        if let Some(timeout) = tool_timeout {
            return timeout;
        }
        if needs_sandbox {
            self.limits.sandbox_timeout
        } else {
            self.limits.default_timeout
        }
    }

    /// Run an already-validated call. The tool future is dropped on timeout,
    /// which kills child processes and tears down sandbox containers.
    pub async fn execute(
        &self,
        call: &ToolInvocation,
        descriptor: &ToolDescriptor,
    ) -> Result<ToolResult, ToolError> {
        let tool = self
            .registry
            .tool(&descriptor.name)
            .ok_or_else(|| ToolError::NotFound(descriptor.name.clone()))?;

        let needs_sandbox = descriptor.capabilities.requires_sandbox
            || call.target == Some(ExecutionTarget::Sandbox);
        if needs_sandbox {
            self.context.sandbox()?;
        }

        let timeout = self.timeout_for(needs_sandbox, tool.timeout());
        let start = Instant::now();
        tracing::debug!(
            tool = %descriptor.name,
            call_id = %call.id,
            sandbox = needs_sandbox,
            "Executing tool (timeout {}s)",
            timeout.as_secs()
        );

        let outcome =
            tokio::time::timeout(timeout, tool.execute(call.arguments_value(), &self.context)).await;
        let elapsed = start.elapsed();
        match outcome {
            Err(_) => {
                tracing::warn!(
                    tool = %descriptor.name,
                    "Tool timed out after {}s",
                    timeout.as_secs()
                );
                Err(ToolError::Timeout {
                    tool: descriptor.name.clone(),
                    secs: timeout.as_secs(),
                })
            }
            Ok(Err(e)) => Err(ToolError::from_anyhow(e)),
            Ok(Ok(output)) => {
                let result = ToolResult::success(output, elapsed, self.limits.max_output_chars);
                if result.truncated {
                    tracing::debug!(
                        tool = %descriptor.name,
                        "Tool output truncated to {} chars",
                        self.limits.max_output_chars
                    );
                }
                Ok(result)
            }
        }
    }

    /// Look up, validate and run a call. Every failure becomes an error
    /// result; nothing here is fatal to the caller.
    pub async fn dispatch(&self, call: &ToolInvocation) -> ToolResult {
        let start = Instant::now();
        let outcome: Result<ToolResult, ToolError> = async {
            let descriptor = self.registry.lookup(&call.name)?;
            self.registry.validate(call)?;
            self.execute(call, descriptor).await
        }
        .await;
        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::info!(tool = %call.name, "Tool call failed: {}", e);
                ToolResult::failure(&e, start.elapsed())
            }
        }
    }
}
