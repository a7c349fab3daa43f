//! The agent loop.
//!
//! An [`Orchestrator`] owns one [`AgentState`] and drives it to a terminal
//! status: ask the model for the next action, run the tool it picked, append
//! the step, repeat. Control commands are drained only between steps, and
//! the two suspending operations (model call and tool call) both race the
//! cancellation token, so a stopped agent never records a half-finished
//! step.
//!
//! When the model returns several tool calls at once they are queued and
//! each runs as its own step, with commands and limits checked in between.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::checkpoint::Checkpointer;
use super::context;
use super::prompt::{PromptTemplate, PromptVars};
use super::types::{AgentView, ControlCommand, LoopLimits, RunReport};
use crate::llm::{LlmError, LlmErrorKind, ModelGateway, ToolCall, ToolDefinition};
use crate::state::{Action, AgentState, AgentStatus, TerminalReason};
use crate::tools::{
    FinalAnswerArgs, ToolError, ToolExecutor, ToolInvocation, ToolResult, FINAL_ANSWER_TOOL,
};
use crate::util::truncate_chars;

const COMMAND_QUEUE: usize = 32;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Everything an orchestrator needs besides its state. Cheap to clone; the
/// tool registry inside the executor is shared read-only.
#[derive(Clone)]
pub struct AgentRuntime {
    pub agent_name: String,
    pub gateway: Arc<ModelGateway>,
    pub executor: ToolExecutor,
    pub prompt: PromptTemplate,
    pub limits: LoopLimits,
}

/// Caller's side of a running orchestrator.
#[derive(Clone)]
pub struct AgentHandle {
    pub commands: mpsc::Sender<ControlCommand>,
    pub view: watch::Receiver<AgentView>,
    pub cancel: CancellationToken,
}

enum StepOutcome {
    /// A state-advancing step was appended.
    Advanced,
    /// An idle step was appended.
    Idle,
    /// Nothing was appended (the model queued tool calls).
    Continue,
    Finished(TerminalReason),
}

pub struct Orchestrator {
    state: AgentState,
    runtime: AgentRuntime,
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    commands: mpsc::Receiver<ControlCommand>,
    view: watch::Sender<AgentView>,
    cancel: CancellationToken,
    checkpointer: Checkpointer,
    pending: VecDeque<ToolCall>,
    pending_thought: Option<String>,
    paused: bool,
    last_snapshot: Option<Instant>,
    model_failures: u32,
}

impl Orchestrator {
    pub fn new(
        state: AgentState,
        runtime: AgentRuntime,
        checkpointer: Checkpointer,
        cancel: CancellationToken,
    ) -> (Self, AgentHandle) {
        let system_prompt = runtime.prompt.render(&PromptVars {
            agent_name: &runtime.agent_name,
            task: &state.task,
            max_steps: runtime.limits.max_steps,
            tools: runtime.executor.registry(),
        });
        let tools = runtime.executor.registry().tool_definitions();
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (view, view_rx) = watch::channel(AgentView::of(&state, false, true));

        let handle = AgentHandle {
            commands: commands_tx,
            view: view_rx,
            cancel: cancel.clone(),
        };
        let orchestrator = Self {
            state,
            runtime,
            system_prompt,
            tools,
            commands,
            view,
            cancel,
            checkpointer,
            pending: VecDeque::new(),
            pending_thought: None,
            paused: false,
            last_snapshot: None,
            model_failures: 0,
        };
        (orchestrator, handle)
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Run until a terminal status. Always ends with a flushed snapshot.
    pub async fn run(mut self) -> RunReport {
        let start_index = self.state.step_index();
        self.state.set_status(AgentStatus::Running);
        tracing::info!(
            agent = %self.state.id,
            step = start_index,
            "Agent started: {}",
            truncate_chars(&self.state.task, 80).0
        );

        let reason = loop {
            self.publish(true);
            if let Some(reason) = self.apply_commands().await {
                break reason;
            }
            if let Some(reason) = self.check_limits(start_index) {
                break reason;
            }

            let outcome = match self.pending.pop_front() {
                Some(call) => self.act(call).await,
                None => self.think().await,
            };
            match outcome {
                StepOutcome::Advanced => self.maybe_snapshot().await,
                StepOutcome::Idle | StepOutcome::Continue => {}
                StepOutcome::Finished(reason) => break reason,
            }
        };

        self.finish(reason).await
    }

    fn publish(&self, running: bool) {
        self.view
            .send_replace(AgentView::of(&self.state, self.paused, running));
    }

    /// Drain queued commands. While paused, block until one arrives.
    async fn apply_commands(&mut self) -> Option<TerminalReason> {
        loop {
            let command = if self.paused {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Some(TerminalReason::Cancelled),
                    command = self.commands.recv() => match command {
                        Some(command) => command,
                        None => return Some(TerminalReason::StopRequested),
                    },
                }
            } else {
                match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => return None,
                }
            };

            match command {
                ControlCommand::Pause => {
                    if !self.paused {
                        self.paused = true;
                        tracing::info!(agent = %self.state.id, "Agent paused");
                        self.publish(true);
                    }
                }
                ControlCommand::Resume => {
                    if self.paused {
                        self.paused = false;
                        tracing::info!(agent = %self.state.id, "Agent resumed");
                        self.publish(true);
                    }
                }
                ControlCommand::Stop => return Some(TerminalReason::StopRequested),
                ControlCommand::Inspect { respond } => {
                    let _ = respond.send(self.state.clone());
                }
                ControlCommand::Checkpoint => self.snapshot().await,
            }
        }
    }

    fn check_limits(&self, start_index: usize) -> Option<TerminalReason> {
        let limits = &self.runtime.limits;
        if self.cancel.is_cancelled() {
            return Some(TerminalReason::Cancelled);
        }
        if self.state.idle_loops >= limits.max_idle_loops {
            return Some(TerminalReason::IdleLimit);
        }
        if self.state.step_index() - start_index >= limits.max_steps {
            return Some(TerminalReason::MaxSteps);
        }
        None
    }

    /// Ask the model for the next action.
    async fn think(&mut self) -> StepOutcome {
        let messages = context::build_messages(&self.system_prompt, &self.state);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StepOutcome::Finished(TerminalReason::Cancelled),
            result = self.runtime.gateway.generate(messages, &self.tools) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => return self.model_failed(e).await,
        };
        self.model_failures = 0;

        let content = response
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if response.tool_calls.is_empty() {
            tracing::debug!(
                agent = %self.state.id,
                step = self.state.step_index(),
                "Model replied without a tool call"
            );
            let content = content.unwrap_or_else(|| "(empty response)".to_string());
            self.state.push_step(Action::Thought { content }, None, true);
            return StepOutcome::Idle;
        }

        self.pending_thought = content;
        self.pending.extend(response.tool_calls);
        StepOutcome::Continue
    }

    /// Record a failed model call as a step so the model sees it next turn.
    /// Invalid credentials, an oversized context and too many failures in a
    /// row end the run; anything else backs off and tries again.
    async fn model_failed(&mut self, error: LlmError) -> StepOutcome {
        if error.kind.is_fatal() {
            tracing::error!(agent = %self.state.id, "Model call failed: {}", error);
            self.state.error = Some(error.to_string());
            return StepOutcome::Finished(TerminalReason::InvalidCredentials);
        }

        self.model_failures += 1;
        self.state.push_step(
            Action::ModelError {
                kind: error.kind,
                message: error.message.clone(),
            },
            None,
            false,
        );

        // The gateway has already trimmed this history as far as it can.
        if error.kind == LlmErrorKind::ContextTooLarge {
            tracing::error!(agent = %self.state.id, "Context cannot be fitted: {}", error);
            self.state.error = Some(error.to_string());
            return StepOutcome::Finished(TerminalReason::ModelFailure);
        }

        let allowed = self.runtime.limits.max_model_retries;
        if self.model_failures > allowed {
            tracing::error!(
                agent = %self.state.id,
                "Model call failed {} times in a row: {}",
                self.model_failures,
                error
            );
            self.state.error = Some(error.to_string());
            return StepOutcome::Finished(TerminalReason::ModelFailure);
        }

        let delay = backoff(self.model_failures);
        tracing::warn!(
            agent = %self.state.id,
            step = self.state.step_index() - 1,
            "Model call failed ({}/{}), retrying in {:?}: {}",
            self.model_failures,
            allowed,
            delay,
            error
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StepOutcome::Finished(TerminalReason::Cancelled),
            _ = tokio::time::sleep(delay) => StepOutcome::Advanced,
        }
    }

    /// Run one queued tool call as a step.
    async fn act(&mut self, call: ToolCall) -> StepOutcome {
        let thought = self.pending_thought.take();
        let invocation = match ToolInvocation::from_model(&call) {
            Ok(invocation) => invocation,
            Err(e) => {
                let invocation = ToolInvocation::new(call.id, call.function.name, Map::new());
                self.record(invocation, thought, ToolResult::failure(&e, Duration::ZERO));
                return StepOutcome::Advanced;
            }
        };

        if invocation.name == FINAL_ANSWER_TOOL {
            return self.final_answer(invocation, thought);
        }

        self.state.set_status(AgentStatus::WaitingOnTool);
        self.publish(true);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StepOutcome::Finished(TerminalReason::Cancelled),
            result = self.runtime.executor.dispatch(&invocation) => result,
        };
        self.state.set_status(AgentStatus::Running);
        self.record(invocation, thought, result);
        StepOutcome::Advanced
    }

    fn final_answer(&mut self, call: ToolInvocation, thought: Option<String>) -> StepOutcome {
        let registry = self.runtime.executor.registry();
        let checked = if registry.has_tool(FINAL_ANSWER_TOOL) {
            registry.validate(&call)
        } else {
            Ok(())
        };
        let parsed = checked.and_then(|()| {
            FinalAnswerArgs::parse(call.arguments_value()).map_err(ToolError::from_anyhow)
        });

        match parsed {
            Ok(args) => {
                let status = args.status.as_deref().unwrap_or("completed");
                tracing::info!(
                    agent = %self.state.id,
                    step = self.state.step_index(),
                    "Final answer ({})",
                    status
                );
                self.state.final_answer = Some(args.answer.clone());
                self.state.push_step(
                    Action::FinalAnswer {
                        answer: args.answer,
                    },
                    None,
                    true,
                );
                StepOutcome::Finished(TerminalReason::FinalAnswer)
            }
            Err(e) => {
                self.record(call, thought, ToolResult::failure(&e, Duration::ZERO));
                StepOutcome::Advanced
            }
        }
    }

    fn record(&mut self, call: ToolInvocation, thought: Option<String>, result: ToolResult) {
        let success = !result.is_error;
        tracing::info!(
            agent = %self.state.id,
            step = self.state.step_index(),
            tool = %call.name,
            "Tool {} in {} ms",
            if success { "succeeded" } else { "failed" },
            result.duration_ms
        );
        self.state
            .push_step(Action::ToolCall { call, thought }, Some(result), success);
    }

    async fn snapshot(&mut self) {
        self.state.last_saved = Some(Utc::now());
        self.last_snapshot = Some(Instant::now());
        self.checkpointer.request(self.state.clone()).await;
    }

    async fn maybe_snapshot(&mut self) {
        if !self.runtime.limits.auto_save {
            return;
        }
        let interval = self.runtime.limits.save_interval;
        let due = self
            .last_snapshot
            .map_or(true, |at| at.elapsed() >= interval);
        if due {
            self.snapshot().await;
        }
    }

    async fn finish(mut self, reason: TerminalReason) -> RunReport {
        self.pending.clear();
        self.state.finish(reason);
        self.state.last_saved = Some(Utc::now());

        match reason {
            TerminalReason::ModelFailure | TerminalReason::InvalidCredentials => {
                tracing::error!(
                    agent = %self.state.id,
                    steps = self.state.steps.len(),
                    "Agent failed: {}",
                    reason
                );
            }
            _ => {
                tracing::info!(
                    agent = %self.state.id,
                    steps = self.state.steps.len(),
                    "Agent stopped: {}",
                    reason
                );
            }
        }

        if !self.checkpointer.flush(self.state.clone()).await {
            tracing::warn!(agent = %self.state.id, "Final snapshot was not saved");
        }
        self.checkpointer.close().await;
        self.view
            .send_replace(AgentView::of(&self.state, false, false));
        RunReport::from_state(&self.state, reason)
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_MAX)
}
