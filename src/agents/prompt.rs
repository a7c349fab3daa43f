//! System prompt templates.
//!
//! The prompt comes from, in order: `[agent].system_prompt`, the file
//! `{templates_dir}/system.md`, or the built-in text below. Placeholders of
//! the form `{{name}}` are substituted; unknown names are left untouched.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::tools::{ToolRegistry, FINAL_ANSWER_TOOL};

pub const SYSTEM_TEMPLATE_FILE: &str = "system.md";

const BUILTIN_SYSTEM_PROMPT: &str = r#"You are {{agent_name}}, an autonomous agent with access to tools.

## Task
{{task}}

## Available Tools
{{tools}}

## Rules
1. Use tools to accomplish the task - don't just describe what to do
2. Read files before editing them
3. Verify your work when possible
4. You have at most {{max_steps}} steps, so make each one count
5. If a tool fails, read the error and adjust instead of repeating the same call

## Finishing
When the task is complete, or you are blocked, call `final_answer` with:
- What you did
- Files created/modified
- How to verify the result"#;

/// Where the active template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource {
    Config,
    File,
    Builtin,
}

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
    source: TemplateSource,
}

/// Values substituted into the template.
pub struct PromptVars<'a> {
    pub agent_name: &'a str,
    pub task: &'a str,
    pub max_steps: usize,
    pub tools: &'a ToolRegistry,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").expect("static regex"))
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: TemplateSource::Config,
        }
    }

    pub fn builtin() -> Self {
        Self {
            text: BUILTIN_SYSTEM_PROMPT.to_string(),
            source: TemplateSource::Builtin,
        }
    }

    /// Resolve the template from configuration. An unreadable template file
    /// is logged and the built-in prompt is used.
    pub fn load(system_prompt: Option<&str>, templates_dir: Option<&Path>) -> Self {
        if let Some(text) = system_prompt {
            return Self::new(text);
        }
        let Some(dir) = templates_dir else {
            return Self::builtin();
        };
        let path = dir.join(SYSTEM_TEMPLATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::info!("Using system prompt template {}", path.display());
                Self {
                    text,
                    source: TemplateSource::File,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::builtin(),
            Err(e) => {
                tracing::warn!("Failed to read template {}: {}", path.display(), e);
                Self::builtin()
            }
        }
    }

    pub fn source(&self) -> TemplateSource {
        self.source
    }

    pub fn render(&self, vars: &PromptVars<'_>) -> String {
        placeholder_re()
            .replace_all(&self.text, |caps: &regex::Captures<'_>| match &caps[1] {
                "agent_name" => vars.agent_name.to_string(),
                "task" => vars.task.to_string(),
                "max_steps" => vars.max_steps.to_string(),
                "tools" => tool_list(vars.tools),
                _ => caps[0].to_string(),
            })
            .into_owned()
    }
}

fn tool_list(tools: &ToolRegistry) -> String {
    let mut lines: Vec<String> = tools
        .descriptors()
        .filter(|d| d.name != FINAL_ANSWER_TOOL)
        .map(|d| format!("- **{}**: {}", d.name, first_line(&d.description)))
        .collect();
    if tools.has_tool(FINAL_ANSWER_TOOL) {
        lines.push(format!(
            "- **{}**: Finish the task and report the result",
            FINAL_ANSWER_TOOL
        ));
    }
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tools::{FinalAnswer, ReadFile, Tool};

    fn registry() -> ToolRegistry {
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(ReadFile), Arc::new(FinalAnswer)];
        ToolRegistry::from_tools(tools).unwrap()
    }

    #[test]
    fn test_builtin_render() {
        let tools = registry();
        let text = PromptTemplate::builtin().render(&PromptVars {
            agent_name: "Scout",
            task: "count the files",
            max_steps: 7,
            tools: &tools,
        });
        assert!(text.starts_with("You are Scout"));
        assert!(text.contains("count the files"));
        assert!(text.contains("at most 7 steps"));
        assert!(text.contains("- **read_file**"));
        assert!(text.contains("- **final_answer**: Finish"));
        assert!(!text.contains("{{"));
    }

    #[test]
    fn test_template_file_and_unknown_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SYSTEM_TEMPLATE_FILE),
            "Agent {{ agent_name }} on {{task}} ({{unknown}})",
        )
        .unwrap();
        let template = PromptTemplate::load(None, Some(dir.path()));
        assert_eq!(template.source(), TemplateSource::File);

        let tools = registry();
        let text = template.render(&PromptVars {
            agent_name: "A",
            task: "T",
            max_steps: 1,
            tools: &tools,
        });
        assert_eq!(text, "Agent A on T ({{unknown}})");
    }

    #[test]
    fn test_precedence() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            PromptTemplate::load(None, Some(dir.path())).source(),
            TemplateSource::Builtin
        );
        std::fs::write(dir.path().join(SYSTEM_TEMPLATE_FILE), "file").unwrap();
        assert_eq!(
            PromptTemplate::load(Some("inline"), Some(dir.path())).source(),
            TemplateSource::Config
        );
    }
}
