//! Explicit sandboxed execution tool.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::terminal::format_process_output;
use super::{Tool, ToolCapabilities, ToolContext, ToolOutput};

/// Run shell or Python code in an isolated container with the configured
/// memory, CPU and network limits.
pub struct SandboxExecute;

#[async_trait]
impl Tool for SandboxExecute {
    fn name(&self) -> &str {
        "sandbox_execute"
    }

    fn description(&self) -> &str {
        "Run untrusted code in an isolated container. The workspace is mounted as the working directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Code to run"
                },
                "language": {
                    "type": "string",
                    "enum": ["bash", "python"],
                    "description": "Interpreter (default: bash)"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            requires_network: false,
            requires_sandbox: true,
            idempotent: false,
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'code' argument"))?;
        let argv = match args["language"].as_str().unwrap_or("bash") {
            "python" => vec!["python3".to_string(), "-c".to_string(), code.to_string()],
            _ => vec!["sh".to_string(), "-c".to_string(), code.to_string()],
        };

        let sandbox = ctx.sandbox()?;
        tracing::info!(
            runtime = sandbox.runtime_name(),
            image = %sandbox.config().image,
            "Running code in sandbox"
        );
        let out = sandbox.run(&argv, &ctx.working_dir).await?;
        Ok(format_process_output(out.exit_code, &out.stdout, &out.stderr))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::testing::FakeRuntime;
    use crate::sandbox::Sandbox;

    #[tokio::test]
    async fn test_python_argv() {
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = ToolContext::new("/tmp")
            .with_sandbox(Sandbox::new(runtime.clone(), SandboxConfig::default()));
        let out = SandboxExecute
            .execute(json!({"code": "print(1)", "language": "python"}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("python3 -c print(1)"));
        assert_eq!(runtime.live(), 0);
    }
}
