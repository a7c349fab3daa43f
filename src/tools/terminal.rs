//! Shell command execution tool.
//!
//! Commands run in the workspace by default. With `use_sandbox` the command
//! runs in a throwaway container instead of on the host.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{resolve_path, Tool, ToolCapabilities, ToolContext, ToolError, ToolOutput};
use crate::util::sanitize_output;

/// Dangerous command patterns that are refused outright.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("find / ", "Use a specific directory path instead of root"),
    ("grep -r /", "Use a specific directory path instead of root"),
    ("ls -laR /", "Use a specific directory path instead of root"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    (":(){", "Fork bombs are blocked"),
];

/// Validate a command against dangerous patterns.
fn validate_command(cmd: &str) -> Result<(), String> {
    let trimmed = cmd.trim();
    let unprefixed = ["sudo ", "time ", "nice ", "nohup "]
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        if unprefixed.starts_with(pattern) {
            return Err(format!(
                "Blocked dangerous command pattern '{}'. {}",
                pattern, suggestion
            ));
        }
    }
    Ok(())
}

/// Render process results the way every execution tool reports them.
pub(super) fn format_process_output(exit_code: i32, stdout: &str, stderr: &str) -> ToolOutput {
    let mut result = format!("Exit code: {}\n", exit_code);
    if exit_code != 0 && !stdout.is_empty() {
        result.push_str("Note: non-zero exit code but output was produced.\n");
    }
    if !stdout.is_empty() {
        result.push_str("\n--- stdout ---\n");
        result.push_str(stdout);
    }
    if !stderr.is_empty() {
        result.push_str("\n--- stderr ---\n");
        result.push_str(stderr);
    }
    ToolOutput::text(result).with_structured(json!({ "exit_code": exit_code }))
}

/// Run `program args..` on the host. The child is killed if the future is
/// dropped.
pub(super) async fn run_local(
    program: &str,
    args: &[&str],
    cwd: &Path,
) -> anyhow::Result<ToolOutput> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ToolError::ExecutionError(format!("Failed to start {}: {}", program, e)))?;

    let stdout = sanitize_output(&String::from_utf8_lossy(&output.stdout));
    let stderr = sanitize_output(&String::from_utf8_lossy(&output.stderr));
    let exit_code = output.status.code().unwrap_or(-1);
    tracing::debug!(
        "{} completed: exit={}, stdout_len={}, stderr_len={}",
        program,
        exit_code,
        stdout.len(),
        stderr.len()
    );
    Ok(format_process_output(exit_code, &stdout, &stderr))
}

/// Run a shell command.
pub struct RunCommand {
    sandboxed: bool,
}

impl RunCommand {
    pub fn local() -> Self {
        Self { sandboxed: false }
    }

    pub fn sandboxed() -> Self {
        Self { sandboxed: true }
    }
}

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Use for builds, tests, package installs and inspecting files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional working directory, relative to the workspace"
                }
            },
            "required": ["command"]
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
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?;

        if let Err(msg) = validate_command(command) {
            tracing::warn!("Blocked dangerous command: {}", command);
            return Err(ToolError::ExecutionError(msg).into());
        }

        if self.sandboxed {
            let sandbox = ctx.sandbox()?;
            let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
            let out = sandbox.run(&argv, &ctx.working_dir).await?;
            return Ok(format_process_output(out.exit_code, &out.stdout, &out.stderr));
        }

        let cwd = args["cwd"]
            .as_str()
            .map(|p| resolve_path(p, &ctx.working_dir))
            .unwrap_or_else(|| ctx.working_dir.clone());
        tracing::info!("Executing command in {:?}: {}", cwd, command);
        run_local("/bin/sh", &["-c", command], &cwd).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::testing::FakeRuntime;
    use crate::sandbox::Sandbox;

    #[test]
    fn test_validate_command() {
        assert!(validate_command("ls -la").is_ok());
        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("sudo rm -rf /*").is_err());
        assert!(validate_command("dd if=/dev/zero of=x").is_err());
    }

    #[tokio::test]
    async fn test_local_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = RunCommand::local()
            .execute(json!({"command": "echo hello"}), &ToolContext::new(dir.path()))
            .await
            .unwrap();
        assert!(out.text.starts_with("Exit code: 0"));
        assert!(out.text.contains("hello"));
        assert_eq!(out.structured.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_sandboxed_command_uses_sandbox() {
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = ToolContext::new("/tmp")
            .with_sandbox(Sandbox::new(runtime.clone(), SandboxConfig::default()));
        let out = RunCommand::sandboxed()
            .execute(json!({"command": "uname -a"}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("sh -c uname -a"));
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_sandboxed_without_sandbox_fails() {
        let err = RunCommand::sandboxed()
            .execute(json!({"command": "true"}), &ToolContext::new("/tmp"))
            .await
            .unwrap_err();
        assert_eq!(
            ToolError::from_anyhow(err).kind(),
            crate::tools::ToolErrorKind::SandboxUnavailable
        );
    }
}
