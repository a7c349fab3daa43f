//! File operation tools: read and write files.
//!
//! - `output/report.md` → `{workspace}/output/report.md`
//! - `/etc/hosts` → absolute path, used as-is

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, Tool, ToolCapabilities, ToolContext, ToolOutput};

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents with line numbers. Use relative paths like 'src/main.rs' or absolute paths for system files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute."
                },
                "start_line": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Optional: first line to return (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Optional: last line to return (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            idempotent: true,
            ..ToolCapabilities::default()
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let resolved = resolve_path(path, &ctx.working_dir);

        if !resolved.exists() {
            anyhow::bail!("File not found: {} (resolved to: {})", path, resolved.display());
        }

        let bytes = tokio::fs::read(&resolved).await?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                return Ok(ToolOutput::text(format!(
                    "Binary file detected: {} ({} bytes). Use run_command with `file` or `xxd` to inspect it.",
                    resolved.display(),
                    e.as_bytes().len()
                )));
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let start = args["start_line"].as_u64().unwrap_or(1) as usize;
        let end = (args["end_line"].as_u64().map(|n| n as usize))
            .unwrap_or(total)
            .min(total);

        if total > 0 && start > total {
            return Ok(ToolOutput::text(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total, start
            )));
        }

        let numbered: Vec<String> = lines
            .iter()
            .enumerate()
            .skip(start.saturating_sub(1))
            .take(end.saturating_sub(start.saturating_sub(1)))
            .map(|(i, line)| format!("{:4}| {}", i + 1, line))
            .collect();

        Ok(ToolOutput::text(numbered.join("\n")).with_structured(json!({
            "path": resolved.display().to_string(),
            "total_lines": total,
        })))
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace or absolute."
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            idempotent: true,
            ..ToolCapabilities::default()
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' argument"))?;

        let resolved = resolve_path(path, &ctx.working_dir);
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content).await?;

        Ok(ToolOutput::text(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            resolved.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());

        WriteFile
            .execute(json!({"path": "out/notes.txt", "content": "one\ntwo\nthree"}), &ctx)
            .await
            .unwrap();
        assert!(dir.path().join("out/notes.txt").exists());

        let all = ReadFile.execute(json!({"path": "out/notes.txt"}), &ctx).await.unwrap();
        assert_eq!(all.text, "   1| one\n   2| two\n   3| three");

        let slice = ReadFile
            .execute(json!({"path": "out/notes.txt", "start_line": 2, "end_line": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(slice.text, "   2| two");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let err = ReadFile.execute(json!({"path": "nope.txt"}), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }
}
