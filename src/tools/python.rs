//! Python execution tool.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::terminal::{format_process_output, run_local};
use super::{Tool, ToolCapabilities, ToolContext, ToolOutput};

/// Run a Python snippet with `python3 -c`, on the host or in the sandbox.
pub struct PythonExecute {
    sandboxed: bool,
    interpreter: String,
}

impl PythonExecute {
    pub fn local(interpreter: impl Into<String>) -> Self {
        Self {
            sandboxed: false,
            interpreter: interpreter.into(),
        }
    }

    pub fn sandboxed() -> Self {
        Self {
            sandboxed: true,
            interpreter: "python3".to_string(),
        }
    }
}

#[async_trait]
impl Tool for PythonExecute {
    fn name(&self) -> &str {
        "python_execute"
    }

    fn description(&self) -> &str {
        "Execute Python code. Only printed output is returned, so use print() for results you want to see."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The Python code to execute"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            requires_network: false,
            requires_sandbox: self.sandboxed,
            idempotent: false,
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'code' argument"))?;

        if self.sandboxed {
            let argv = vec![self.interpreter.clone(), "-c".to_string(), code.to_string()];
            let out = ctx.sandbox()?.run(&argv, &ctx.working_dir).await?;
            return Ok(format_process_output(out.exit_code, &out.stdout, &out.stderr));
        }

        tokio::fs::create_dir_all(&ctx.working_dir).await?;
        run_local(&self.interpreter, &["-c", code], &ctx.working_dir).await
    }
}
