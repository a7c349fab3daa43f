//! Control tool the model calls to finish the task.
//!
//! The orchestrator intercepts calls to this tool and ends the run with the
//! given answer; it is registered like any other tool so the model sees its
//! schema and the call goes through normal validation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolCapabilities, ToolContext, ToolOutput};

pub const FINAL_ANSWER_TOOL: &str = "final_answer";

#[derive(Debug, Deserialize)]
pub(crate) struct FinalAnswerArgs {
    pub answer: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl FinalAnswerArgs {
    pub(crate) fn parse(args: Value) -> anyhow::Result<Self> {
        serde_json::from_value(args).map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))
    }
}

pub struct FinalAnswer;

#[async_trait]
impl Tool for FinalAnswer {
    fn name(&self) -> &str {
        FINAL_ANSWER_TOOL
    }

    fn description(&self) -> &str {
        r#"Finish the task and report the result. Call this exactly once, when the task is done or cannot be done.
- 'completed': the task is done; 'answer' holds the result
- 'blocked': you cannot proceed; 'answer' explains what blocked you and what you tried"#
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "answer": {
                    "type": "string",
                    "description": "The final result or explanation shown to the user"
                },
                "status": {
                    "type": "string",
                    "enum": ["completed", "blocked"],
                    "description": "Outcome (default: completed)"
                }
            },
            "required": ["answer"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            idempotent: true,
            ..ToolCapabilities::default()
        }
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let args = FinalAnswerArgs::parse(args)?;
        let status = args.status.as_deref().unwrap_or("completed");
        Ok(ToolOutput::text(args.answer.clone())
            .with_structured(json!({ "status": status, "answer": args.answer })))
    }
}
