//! Rebuilds the model conversation from an agent's step history.
//!
//! The history is the source of truth; messages are derived from it before
//! every model call, so a restored state produces the same conversation as
//! the run that saved it. The gateway then fits the result to the token
//! budget.

use crate::llm::{ChatMessage, Role, ToolCall};
use crate::state::{Action, AgentState, Step};

/// Sent after a step in which the model produced text but no tool call.
pub const IDLE_NUDGE: &str = "No tool was called. Continue working on the task with a tool call, or call final_answer with your result.";

pub fn build_messages(system_prompt: &str, state: &AgentState) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 + state.steps.len() * 2);
    messages.push(ChatMessage::new(Role::System, system_prompt));
    messages.push(ChatMessage::new(Role::User, state.task.clone()));
    for step in &state.steps {
        push_step(&mut messages, step);
    }
    messages
}

fn push_step(messages: &mut Vec<ChatMessage>, step: &Step) {
    match &step.action {
        Action::ToolCall { call, thought } => {
            let arguments = serde_json::to_string(&call.arguments).unwrap_or_default();
            messages.push(ChatMessage::assistant_tool_calls(
                thought.clone(),
                vec![ToolCall::function(&call.id, &call.name, arguments)],
            ));
            let (text, images) = match &step.observation {
                Some(result) if result.is_error => (format!("Error: {}", result.output), &[][..]),
                Some(result) => (result.output.clone(), result.images.as_slice()),
                None => ("(no output)".to_string(), &[][..]),
            };
            messages.push(ChatMessage::tool_result(&call.id, text, images));
        }
        Action::Thought { content } => {
            messages.push(ChatMessage::new(Role::Assistant, content.clone()));
            messages.push(ChatMessage::new(Role::User, IDLE_NUDGE));
        }
        Action::FinalAnswer { answer } => {
            messages.push(ChatMessage::new(Role::Assistant, answer.clone()));
        }
        Action::ModelError { kind, message } => {
            messages.push(ChatMessage::new(
                Role::User,
                format!(
                    "Your previous response could not be obtained ({}: {}). Continue with the task.",
                    kind, message
                ),
            ));
        }
        Action::UserMessage { content } => {
            messages.push(ChatMessage::new(Role::User, content.clone()));
        }
    }
}
