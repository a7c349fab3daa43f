//! Tool system for the agent.
//!
//! Tools are the agent's hands: file access, web access, code execution and a
//! headless browser. Each tool implements [`Tool`]; the [`ToolRegistry`] is
//! built once at startup by a [`ToolDiscovery`] strategy and is read-only
//! afterwards. The [`ToolExecutor`] runs validated calls with timeouts,
//! output limits and optional sandboxing.
//!
//! ## Workspace-First Design
//!
//! Tools work relative to the configured working directory:
//! - Relative paths (e.g., `output/report.md`) resolve from the workspace
//! - Absolute paths (e.g., `/etc/hosts`) are used as-is

mod browser;
mod directory;
mod discovery;
mod error;
mod executor;
mod file_ops;
mod final_answer;
mod python;
mod registry;
mod sandbox_exec;
mod terminal;
mod web;

pub use browser::Browser;
pub use directory::ListDirectory;
pub use discovery::{
    discover_registry, discovery_for, CatalogDiscovery, DiscoveryEnv, StaticDiscovery, ToolDiscovery,
    BUILTIN_TOOL_NAMES,
};
pub use error::{RegistryError, ToolError, ToolErrorKind};
pub use executor::{ExecutionLimits, ToolExecutor, ToolResult};
pub use file_ops::{ReadFile, WriteFile};
pub use final_answer::{FinalAnswer, FINAL_ANSWER_TOOL};
pub(crate) use final_answer::FinalAnswerArgs;
pub use python::PythonExecute;
pub use registry::ToolRegistry;
pub use sandbox_exec::SandboxExecute;
pub use terminal::RunCommand;
pub use web::{FetchUrl, WebSearch};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ToolCall;
use crate::sandbox::Sandbox;

/// Resolve a path relative to the workspace. Absolute paths pass through.
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// What a tool needs from its host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapabilities {
    pub requires_network: bool,
    pub requires_sandbox: bool,
    /// Repeating the call has no additional effect.
    pub idempotent: bool,
}

/// Registry-owned description of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub capabilities: ToolCapabilities,
}

/// Where a call should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Local,
    Sandbox,
}

/// A tool call proposed by the model, with parsed arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider-assigned call id, echoed back with the result.
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ExecutionTarget>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            target: None,
        }
    }

    /// Parse the model's call. Arguments must be a JSON object; an empty
    /// string means no arguments.
    pub fn from_model(call: &ToolCall) -> Result<Self, ToolError> {
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ToolError::SchemaInvalid {
                        tool: call.function.name.clone(),
                        errors: vec![format!("arguments must be an object, got {}", other)],
                    })
                }
                Err(e) => {
                    return Err(ToolError::SchemaInvalid {
                        tool: call.function.name.clone(),
                        errors: vec![format!("arguments are not valid JSON: {}", e)],
                    })
                }
            }
        };
        Ok(Self::new(call.id.clone(), call.function.name.clone(), arguments))
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// What a tool hands back on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub structured: Option<Value>,
    /// Image URLs (`data:image/png;base64,...`)
    pub images: Vec<String>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured = Some(value);
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.images.push(url.into());
        self
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        ToolOutput::text(text)
    }
}

/// Host resources available to a running tool.
#[derive(Clone)]
pub struct ToolContext {
    /// Default directory for relative paths.
    pub working_dir: PathBuf,
    pub sandbox: Option<Sandbox>,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn sandbox(&self) -> Result<&Sandbox, ToolError> {
        self.sandbox
            .as_ref()
            .ok_or_else(|| ToolError::SandboxUnavailable("no sandbox configured".to_string()))
    }
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }

    /// Per-tool wall-clock limit, overriding the executor default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let ws = Path::new("/work");
        assert_eq!(resolve_path("a/b.txt", ws), PathBuf::from("/work/a/b.txt"));
        assert_eq!(resolve_path("/etc/hosts", ws), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn test_invocation_from_model() {
        let call = ToolCall::function("c1", "read_file", r#"{"path": "x"}"#.to_string());
        let inv = ToolInvocation::from_model(&call).unwrap();
        assert_eq!(inv.arguments["path"], "x");

        let empty = ToolCall::function("c2", "final_answer", String::new());
        assert!(ToolInvocation::from_model(&empty).unwrap().arguments.is_empty());

        let bad = ToolCall::function("c3", "read_file", "[1, 2]".to_string());
        assert!(matches!(
            ToolInvocation::from_model(&bad),
            Err(ToolError::SchemaInvalid { .. })
        ));

        let garbage = ToolCall::function("c4", "read_file", "{not json".to_string());
        assert!(ToolInvocation::from_model(&garbage).is_err());
    }
}
