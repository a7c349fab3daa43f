//! Tool error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxError;

/// Failure of a single tool call. Always recoverable: the orchestrator
/// records it as a failed step and shows it to the model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool}: {}", .errors.join("; "))]
    SchemaInvalid { tool: String, errors: Vec<String> },

    #[error("Tool {tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),
}

/// Serializable classification of a [`ToolError`], stored with results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    NotFound,
    SchemaInvalid,
    Timeout,
    ResourceLimitExceeded,
    ExecutionError,
    SandboxUnavailable,
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::NotFound(_) => ToolErrorKind::NotFound,
            ToolError::SchemaInvalid { .. } => ToolErrorKind::SchemaInvalid,
            ToolError::Timeout { .. } => ToolErrorKind::Timeout,
            ToolError::ResourceLimitExceeded(_) => ToolErrorKind::ResourceLimitExceeded,
            ToolError::ExecutionError(_) => ToolErrorKind::ExecutionError,
            ToolError::SandboxUnavailable(_) => ToolErrorKind::SandboxUnavailable,
        }
    }

    /// Recover a typed error from a tool's `anyhow` failure.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        let error = match error.downcast::<ToolError>() {
            Ok(tool_error) => return tool_error,
            Err(e) => e,
        };
        match error.downcast::<SandboxError>() {
            Ok(sandbox_error) => sandbox_error.into(),
            Err(e) => ToolError::ExecutionError(format!("{:#}", e)),
        }
    }
}

impl From<SandboxError> for ToolError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Unavailable(msg) => ToolError::SandboxUnavailable(msg),
            SandboxError::ResourceLimitExceeded(msg) => ToolError::ResourceLimitExceeded(msg),
            SandboxError::Execution(msg) => ToolError::ExecutionError(msg),
        }
    }
}

/// Startup failure while building the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool '{0}' registered twice")]
    Duplicate(String),

    #[error("Tool '{tool}' has an invalid input schema: {message}")]
    InvalidSchema { tool: String, message: String },

    #[error("Tool '{0}' is enabled in configuration but not available")]
    Unknown(String),
}
