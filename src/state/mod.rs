//! Agent state: the step history an orchestrator owns and the store persists.

mod sessions;
mod store;

pub use sessions::{SessionIndex, SessionMeta, DEFAULT_SESSION_ID};
pub use store::{FileStateStore, PersistenceError, StateStore, STATE_FORMAT_VERSION};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::LlmErrorKind;
use crate::tools::{ToolInvocation, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    WaitingOnTool,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Stopped | AgentStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::WaitingOnTool => "waiting_on_tool",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    FinalAnswer,
    MaxSteps,
    IdleLimit,
    StopRequested,
    Cancelled,
    ModelFailure,
    InvalidCredentials,
}

impl TerminalReason {
    /// Status a run ending for this reason settles in.
    pub fn status(self) -> AgentStatus {
        match self {
            TerminalReason::ModelFailure | TerminalReason::InvalidCredentials => {
                AgentStatus::Failed
            }
            _ => AgentStatus::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::FinalAnswer => "final_answer",
            TerminalReason::MaxSteps => "max_steps",
            TerminalReason::IdleLimit => "idle_limit",
            TerminalReason::StopRequested => "stop_requested",
            TerminalReason::Cancelled => "cancelled",
            TerminalReason::ModelFailure => "model_failure",
            TerminalReason::InvalidCredentials => "invalid_credentials",
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the model proposed at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ToolCall {
        call: ToolInvocation,
        /// Text the model emitted alongside the call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    FinalAnswer {
        answer: String,
    },
    Thought {
        content: String,
    },
    /// The model call failed; the error is shown to the model on the next
    /// turn.
    ModelError {
        kind: LlmErrorKind,
        message: String,
    },
    /// A follow-up turn from the user in an interactive session.
    UserMessage {
        content: String,
    },
}

impl Action {
    /// Whether the step changes anything outside the model's own output.
    pub fn is_state_advancing(&self) -> bool {
        !matches!(self, Action::Thought { .. } | Action::ModelError { .. })
    }
}

/// One think/act/observe unit. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<ToolResult>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub task: String,
    pub steps: Vec<Step>,
    pub status: AgentStatus,
    /// Consecutive non-advancing steps.
    pub idle_loops: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    /// Last fatal error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task: task.into(),
            steps: Vec::new(),
            status: AgentStatus::Idle,
            idle_loops: 0,
            last_saved: None,
            terminal_reason: None,
            final_answer: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index the next appended step will get.
    pub fn step_index(&self) -> usize {
        self.steps.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a step and update the idle counter: a thought counts as idle,
    /// a failed model call leaves it alone, anything else resets it.
    pub fn push_step(
        &mut self,
        action: Action,
        observation: Option<ToolResult>,
        success: bool,
    ) -> &Step {
        match action {
            Action::Thought { .. } => self.idle_loops += 1,
            Action::ModelError { .. } => {}
            _ => self.idle_loops = 0,
        }
        let now = Utc::now();
        self.steps.push(Step {
            index: self.steps.len(),
            action,
            observation,
            timestamp: now,
            success,
        });
        self.updated_at = now;
        &self.steps[self.steps.len() - 1]
    }

    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Move to the terminal status for `reason`.
    pub fn finish(&mut self, reason: TerminalReason) {
        self.terminal_reason = Some(reason);
        self.set_status(reason.status());
    }

    /// Clear the terminal marker so a resumed run can continue the history.
    pub fn reopen(&mut self) {
        self.terminal_reason = None;
        self.error = None;
        self.idle_loops = 0;
        self.set_status(AgentStatus::Idle);
    }

    /// Append a follow-up user turn and reopen a finished state so the next
    /// run continues the same conversation.
    pub fn push_user_message(&mut self, content: impl Into<String>) {
        if self.is_terminal() {
            self.reopen();
        }
        self.final_answer = None;
        self.push_step(
            Action::UserMessage {
                content: content.into(),
            },
            None,
            true,
        );
    }

    /// Cheap summary for status queries.
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            task: self.task.clone(),
            status: self.status,
            steps: self.steps.len(),
            idle_loops: self.idle_loops,
            terminal_reason: self.terminal_reason,
            final_answer: self.final_answer.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub task: String,
    pub status: AgentStatus,
    pub steps: usize,
    pub idle_loops: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_counter_resets_on_advancing_step() {
        let mut state = AgentState::new("a1", "task");
        state.push_step(
            Action::Thought {
                content: "hmm".into(),
            },
            None,
            true,
        );
        state.push_step(
            Action::Thought {
                content: "hmm".into(),
            },
            None,
            true,
        );
        assert_eq!(state.idle_loops, 2);

        let call = ToolInvocation::new("c1", "ghost_tool", Default::default());
        state.push_step(Action::ToolCall { call, thought: None }, None, false);
        assert_eq!(state.idle_loops, 0);
        assert_eq!(state.step_index(), 3);
        assert_eq!(state.steps[2].index, 2);
    }

    #[test]
    fn test_finish_maps_reason_to_status() {
        let mut state = AgentState::new("a1", "task");
        state.finish(TerminalReason::MaxSteps);
        assert_eq!(state.status, AgentStatus::Stopped);
        state.reopen();
        state.finish(TerminalReason::InvalidCredentials);
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_model_errors_do_not_touch_idle_counter() {
        let mut state = AgentState::new("a1", "task");
        state.push_step(
            Action::Thought {
                content: "hmm".into(),
            },
            None,
            true,
        );
        state.push_step(
            Action::ModelError {
                kind: LlmErrorKind::ProviderUnavailable,
                message: "down".into(),
            },
            None,
            false,
        );
        assert_eq!(state.idle_loops, 1);
        assert!(!state.steps[1].success);
    }

    #[test]
    fn test_user_message_reopens_finished_state() {
        let mut state = AgentState::new("a1", "first question");
        state.final_answer = Some("first answer".into());
        state.finish(TerminalReason::FinalAnswer);

        state.push_user_message("and a follow-up");
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.terminal_reason, None);
        assert_eq!(state.final_answer, None);
        assert!(matches!(
            &state.steps[0].action,
            Action::UserMessage { content } if content == "and a follow-up"
        ));
    }

    #[test]
    fn test_action_serialization_is_tagged() {
        let value = serde_json::to_value(Action::FinalAnswer {
            answer: "42".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "final_answer");
        assert_eq!(value["answer"], "42");
    }
}
