//! Core types for the agent loop.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::{AgentConfig, ConfigError};
use crate::state::{AgentState, AgentStatus, AgentSummary, PersistenceError, TerminalReason};
use crate::tools::RegistryError;

/// Bounds that guarantee a run terminates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopLimits {
    /// Steps one run may append.
    pub max_steps: usize,
    /// Consecutive idle steps before the run stops.
    pub max_idle_loops: usize,
    /// Consecutive failed model calls tolerated.
    pub max_model_retries: u32,
    pub save_interval: Duration,
    pub auto_save: bool,
}

impl LoopLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_idle_loops: config.max_idle_loops,
            max_model_retries: config.max_model_retries,
            save_interval: config.save_interval(),
            auto_save: config.auto_save,
        }
    }
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// Commands delivered to a running orchestrator. Applied only between steps.
#[derive(Debug)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
    Inspect {
        respond: oneshot::Sender<AgentState>,
    },
    /// Snapshot now, regardless of the save interval.
    Checkpoint,
}

/// Live view of an agent, published at every step boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub summary: AgentSummary,
    pub paused: bool,
    pub running: bool,
}

impl AgentView {
    pub fn of(state: &AgentState, paused: bool, running: bool) -> Self {
        Self {
            summary: state.summary(),
            paused,
            running,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub id: String,
    pub status: AgentStatus,
    pub reason: TerminalReason,
    pub final_answer: Option<String>,
    /// Steps in the whole history, not just this run.
    pub steps: usize,
    pub error: Option<String>,
}

impl RunReport {
    pub fn from_state(state: &AgentState, reason: TerminalReason) -> Self {
        Self {
            id: state.id.clone(),
            status: state.status,
            reason,
            final_answer: state.final_answer.clone(),
            steps: state.steps.len(),
            error: state.error.clone(),
        }
    }
}

/// Errors from starting, resuming or addressing agents.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Agent {0} is already running")]
    AlreadyRunning(String),

    #[error("Session {0} already exists; resume it instead")]
    SessionExists(String),

    #[error("Unknown agent {0}")]
    UnknownAgent(String),

    #[error("Agent {0} is no longer accepting commands")]
    Unreachable(String),

    #[error("Agent {id} task failed: {message}")]
    Join { id: String, message: String },
}
