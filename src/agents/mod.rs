//! Agents module - the autonomous agent loop.
//!
//! # Pieces
//! - **Orchestrator**: owns one `AgentState` and runs the think/act loop
//! - **AgentSupervisor**: starts, controls and reaps orchestrators
//! - **Checkpointer**: serialized background snapshot writer
//! - **PromptTemplate**: system prompt with `{{placeholder}}` substitution
//!
//! # Termination
//! Every run ends: `max_steps` bounds the steps of one run, `max_idle_loops`
//! bounds consecutive steps without a tool call, and model/tool calls are
//! bounded by timeouts. The terminal status and reason are always flushed
//! to the state store before the run returns.

mod checkpoint;
mod context;
mod orchestrator;
mod prompt;
mod supervisor;
mod types;

pub use checkpoint::Checkpointer;
pub use context::{build_messages, IDLE_NUDGE};
pub use orchestrator::{AgentHandle, AgentRuntime, Orchestrator};
pub use prompt::{PromptTemplate, PromptVars, TemplateSource, SYSTEM_TEMPLATE_FILE};
pub use supervisor::AgentSupervisor;
pub use types::{AgentError, AgentView, ControlCommand, LoopLimits, RunReport};
