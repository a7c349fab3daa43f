//! Directory listing tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_path, Tool, ToolCapabilities, ToolContext, ToolOutput};

/// Entries beyond this many are summarised instead of listed.
const MAX_ENTRIES: usize = 500;

/// List contents of a directory as an indented tree.
pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories as a tree. Use '.' for the workspace root, relative paths like 'src/', or absolute paths."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path. Use '.' for the workspace root."
                },
                "max_depth": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum depth to traverse (default: 3)"
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
        let max_depth = args["max_depth"].as_u64().unwrap_or(3) as usize;

        let root = resolve_path(path, &ctx.working_dir);
        if !root.exists() {
            anyhow::bail!("Directory not found: {} (resolved to: {})", path, root.display());
        }
        if !root.is_dir() {
            anyhow::bail!("Not a directory: {}", path);
        }

        // walkdir is blocking
        let listing = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let mut total = 0usize;
            for entry in WalkDir::new(&root)
                .min_depth(1)
                .max_depth(max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                total += 1;
                if entries.len() >= MAX_ENTRIES {
                    continue;
                }
                let indent = "  ".repeat(entry.depth().saturating_sub(1));
                let name = entry.file_name().to_string_lossy();
                let suffix = if entry.file_type().is_dir() { "/" } else { "" };
                entries.push(format!("{}{}{}", indent, name, suffix));
            }
            (entries, total)
        })
        .await?;

        let (entries, total) = listing;
        if entries.is_empty() {
            return Ok(ToolOutput::text("Directory is empty"));
        }
        let mut text = entries.join("\n");
        if total > entries.len() {
            text.push_str(&format!("\n... and {} more entries", total - entries.len()));
        }
        Ok(ToolOutput::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let out = ListDirectory
            .execute(json!({"path": "."}), &ToolContext::new(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.text, "README.md\nsrc/\n  lib.rs\n  nested/");
    }

    #[tokio::test]
    async fn test_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "x").unwrap();
        let err = ListDirectory
            .execute(json!({"path": "file"}), &ToolContext::new(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Not a directory"));
    }
}
