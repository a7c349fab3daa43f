//! Owns every running orchestrator in the process.
//!
//! Each agent runs on its own task with its own state and checkpointer; the
//! only thing shared between them is the read-only tool registry inside
//! [`AgentRuntime`]. Finished agents stay in the table until something reaps
//! them (`wait`, or the next `start`/`resume`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::checkpoint::Checkpointer;
use super::orchestrator::{AgentHandle, AgentRuntime, Orchestrator};
use super::prompt::PromptTemplate;
use super::types::{AgentError, AgentView, ControlCommand, LoopLimits, RunReport};
use crate::config::Config;
use crate::llm::ModelGateway;
use crate::sandbox::Sandbox;
use crate::state::{
    AgentState, FileStateStore, PersistenceError, SessionIndex, SessionMeta, StateStore,
    TerminalReason,
};
use crate::tools::{
    discover_registry, ExecutionLimits, ToolContext, ToolExecutor, ToolRegistry,
};

/// How long `shutdown` waits for agents to reach a step boundary before
/// cancelling their in-flight calls.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct RunningAgent {
    handle: AgentHandle,
    task: JoinHandle<RunReport>,
}

#[derive(Clone)]
pub struct AgentSupervisor {
    runtime: AgentRuntime,
    store: Arc<dyn StateStore>,
    sessions: SessionIndex,
    agents: Arc<RwLock<HashMap<String, RunningAgent>>>,
    shutdown: CancellationToken,
}

impl AgentSupervisor {
    pub fn new(runtime: AgentRuntime, store: Arc<dyn StateStore>, sessions: SessionIndex) -> Self {
        Self {
            runtime,
            store,
            sessions,
            agents: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the gateway, discover tools and open the state directories.
    pub async fn from_config(config: &Config) -> Result<Self, AgentError> {
        let gateway = ModelGateway::from_config(&config.llm)?;

        let sandbox = config
            .sandbox
            .use_sandbox
            .then(|| Sandbox::docker(config.sandbox.clone()));
        let registry = discover_registry(config, sandbox.clone()).await?;

        let mut context = ToolContext::new(&config.tools.working_dir);
        if let Some(sandbox) = sandbox {
            context = context.with_sandbox(sandbox);
        }
        let executor = ToolExecutor::new(
            Arc::new(registry),
            context,
            ExecutionLimits::from_config(config),
        );

        let prompt = PromptTemplate::load(
            config.agent.system_prompt.as_deref(),
            config.templates_dir.as_deref(),
        );
        let runtime = AgentRuntime {
            agent_name: config.agent.name.clone(),
            gateway: Arc::new(gateway),
            executor,
            prompt,
            limits: LoopLimits::from_config(&config.agent),
        };

        let store = Arc::new(FileStateStore::new(&config.agent.data_dir));
        let sessions = SessionIndex::new(&config.agent.sessions_dir);
        Ok(Self::new(runtime, store, sessions))
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.runtime.executor.registry()
    }

    /// Start a new agent. Without an id a fresh one is generated; an id that
    /// is already persisted must be resumed instead.
    pub async fn start(
        &self,
        task: impl Into<String>,
        id: Option<String>,
    ) -> Result<String, AgentError> {
        let id = id.unwrap_or_else(SessionIndex::new_id);
        SessionIndex::check_id(&id)?;

        let mut agents = self.agents.write().await;
        reap(&mut agents);
        if agents.contains_key(&id) {
            return Err(AgentError::AlreadyRunning(id));
        }
        if self.is_persisted(&id).await? {
            return Err(AgentError::SessionExists(id));
        }

        let state = AgentState::new(&id, task);
        agents.insert(id.clone(), self.spawn(state));
        Ok(id)
    }

    /// Continue a persisted agent, or unpause a running one.
    pub async fn resume(&self, id: &str) -> Result<(), AgentError> {
        SessionIndex::check_id(id)?;
        let mut agents = self.agents.write().await;
        reap(&mut agents);
        if let Some(agent) = agents.get(id) {
            let commands = agent.handle.commands.clone();
            drop(agents);
            return send(id, &commands, ControlCommand::Resume).await;
        }

        let mut state = match self.store.load(id).await {
            Ok(state) => state,
            Err(PersistenceError::NotFound(_)) => {
                return Err(AgentError::UnknownAgent(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            agent = %id,
            "Resuming agent at step {} (was {})",
            state.step_index(),
            state.status
        );
        state.reopen();
        agents.insert(id.to_string(), self.spawn(state));
        Ok(())
    }

    /// Start the session if it is new, resume it otherwise.
    pub async fn start_or_resume(&self, task: &str, id: &str) -> Result<(), AgentError> {
        if self.agents.read().await.contains_key(id) || self.is_persisted(id).await? {
            self.resume(id).await
        } else {
            self.start(task, Some(id.to_string())).await.map(|_| ())
        }
    }

    /// Append a user turn to a finished session and run it again. A session
    /// that does not exist yet starts with the message as its task.
    pub async fn send_message(
        &self,
        id: &str,
        message: impl Into<String>,
    ) -> Result<(), AgentError> {
        SessionIndex::check_id(id)?;
        let message = message.into();
        let mut agents = self.agents.write().await;
        reap(&mut agents);
        if agents.contains_key(id) {
            return Err(AgentError::AlreadyRunning(id.to_string()));
        }

        let state = match self.store.load(id).await {
            Ok(mut state) => {
                state.push_user_message(message);
                tracing::info!(
                    agent = %id,
                    "Continuing session with a user message at step {}",
                    state.step_index()
                );
                state
            }
            Err(PersistenceError::NotFound(_)) => AgentState::new(id, message),
            Err(e) => return Err(e.into()),
        };
        agents.insert(id.to_string(), self.spawn(state));
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<(), AgentError> {
        self.command(id, ControlCommand::Pause).await
    }

    pub async fn stop(&self, id: &str) -> Result<(), AgentError> {
        self.command(id, ControlCommand::Stop).await
    }

    pub async fn checkpoint(&self, id: &str) -> Result<(), AgentError> {
        self.command(id, ControlCommand::Checkpoint).await
    }

    /// Current view of a running agent, or of its last snapshot.
    pub async fn inspect(&self, id: &str) -> Result<AgentView, AgentError> {
        if let Some(agent) = self.agents.read().await.get(id) {
            return Ok(agent.handle.view.borrow().clone());
        }
        let state = self.load(id).await?;
        Ok(AgentView::of(&state, false, false))
    }

    /// Full state, taken between steps for a running agent.
    pub async fn state(&self, id: &str) -> Result<AgentState, AgentError> {
        let commands = self
            .agents
            .read()
            .await
            .get(id)
            .map(|agent| agent.handle.commands.clone());
        if let Some(commands) = commands {
            let (respond, response) = oneshot::channel();
            if commands
                .send(ControlCommand::Inspect { respond })
                .await
                .is_ok()
            {
                if let Ok(state) = response.await {
                    return Ok(state);
                }
            }
        }
        // Finished between the lookup and the reply; its final snapshot is on disk.
        self.load(id).await
    }

    /// Agents this process is running, plus finished ones not yet reaped.
    pub async fn list(&self) -> Vec<AgentView> {
        let mut views: Vec<AgentView> = self
            .agents
            .read()
            .await
            .values()
            .map(|agent| agent.handle.view.borrow().clone())
            .collect();
        views.sort_by(|a, b| a.summary.id.cmp(&b.summary.id));
        views
    }

    /// Persisted sessions, most recently active first.
    pub async fn sessions(&self) -> Result<Vec<SessionMeta>, AgentError> {
        Ok(self.sessions.list().await?)
    }

    /// Wait for an agent to reach a terminal status and reap it.
    pub async fn wait(&self, id: &str) -> Result<RunReport, AgentError> {
        let view = self
            .agents
            .read()
            .await
            .get(id)
            .map(|agent| agent.handle.view.clone());
        let Some(mut view) = view else {
            let state = self.load(id).await?;
            let reason = state.terminal_reason.unwrap_or(TerminalReason::StopRequested);
            return Ok(RunReport::from_state(&state, reason));
        };
        // The sender only drops once the run has returned.
        let _ = view.wait_for(|v| !v.running).await;

        let agent = self.agents.write().await.remove(id);
        match agent {
            Some(agent) => join(id, agent.task).await,
            None => {
                let state = self.load(id).await?;
                let reason = state.terminal_reason.unwrap_or(TerminalReason::StopRequested);
                Ok(RunReport::from_state(&state, reason))
            }
        }
    }

    /// Stop every agent and wait for their final snapshots. Agents that do
    /// not reach a step boundary within the grace period are cancelled.
    pub async fn shutdown(&self) -> Vec<RunReport> {
        let running: Vec<(String, RunningAgent)> = self.agents.write().await.drain().collect();
        if running.is_empty() {
            return Vec::new();
        }
        tracing::info!("Stopping {} agent(s)", running.len());

        let mut tasks = Vec::with_capacity(running.len());
        for (id, agent) in running {
            let _ = agent.handle.commands.try_send(ControlCommand::Stop);
            tasks.push(async move { join(&id, agent.task).await });
        }
        let joined = futures::future::join_all(tasks);
        tokio::pin!(joined);

        let outcome = tokio::time::timeout(SHUTDOWN_GRACE, &mut joined).await;
        let results = match outcome {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    "Agents did not stop within {:?}; cancelling in-flight calls",
                    SHUTDOWN_GRACE
                );
                self.shutdown.cancel();
                joined.await
            }
        };

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!("{}", e);
                    None
                }
            })
            .collect()
    }

    fn spawn(&self, state: AgentState) -> RunningAgent {
        let checkpointer = Checkpointer::spawn(self.store.clone(), Some(self.sessions.clone()));
        let (orchestrator, handle) = Orchestrator::new(
            state,
            self.runtime.clone(),
            checkpointer,
            self.shutdown.child_token(),
        );
        let task = tokio::spawn(orchestrator.run());
        RunningAgent { handle, task }
    }

    async fn command(&self, id: &str, command: ControlCommand) -> Result<(), AgentError> {
        let commands = self
            .agents
            .read()
            .await
            .get(id)
            .map(|agent| agent.handle.commands.clone())
            .ok_or_else(|| AgentError::UnknownAgent(id.to_string()))?;
        send(id, &commands, command).await
    }

    async fn load(&self, id: &str) -> Result<AgentState, AgentError> {
        match self.store.load(id).await {
            Ok(state) => Ok(state),
            Err(PersistenceError::NotFound(_)) | Err(PersistenceError::InvalidId(_)) => {
                Err(AgentError::UnknownAgent(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_persisted(&self, id: &str) -> Result<bool, AgentError> {
        if self.sessions.exists(id).await {
            return Ok(true);
        }
        match self.store.load(id).await {
            Ok(_) => Ok(true),
            Err(PersistenceError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn send(
    id: &str,
    commands: &mpsc::Sender<ControlCommand>,
    command: ControlCommand,
) -> Result<(), AgentError> {
    commands
        .send(command)
        .await
        .map_err(|_| AgentError::Unreachable(id.to_string()))
}

async fn join(id: &str, task: JoinHandle<RunReport>) -> Result<RunReport, AgentError> {
    task.await.map_err(|e| AgentError::Join {
        id: id.to_string(),
        message: e.to_string(),
    })
}

/// Drop finished agents whose reports nobody is waiting for.
fn reap(agents: &mut HashMap<String, RunningAgent>) {
    agents.retain(|id, agent| {
        let done = agent.task.is_finished();
        if done {
            tracing::debug!(agent = %id, "Reaped finished agent");
        }
        !done
    });
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::llm::{
        GenerationParams, LlmClient, LlmError, ModelRequest, ModelResponse, RetryConfig, ToolCall,
    };
    use crate::state::{Action, AgentStatus};
    use tokio::sync::watch;
    use crate::tools::{FinalAnswer, Tool};

    /// Answers immediately unless the task mentions "wait", in which case it
    /// keeps thinking out loud.
    struct TaskClient {
        answers: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl LlmClient for TaskClient {
        fn provider(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
            let task = request.messages[1].text_content();
            if task.contains("wait") {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Ok(ModelResponse {
                    content: Some("still thinking".to_string()),
                    ..ModelResponse::default()
                });
            }
            let answer = self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "done".to_string());
            Ok(ModelResponse {
                tool_calls: vec![ToolCall::function(
                    "call_1",
                    "final_answer",
                    json!({ "answer": answer }).to_string(),
                )],
                ..ModelResponse::default()
            })
        }
    }

    fn supervisor(dir: &std::path::Path, max_idle_loops: usize) -> AgentSupervisor {
        let client = Arc::new(TaskClient {
            answers: Mutex::new(VecDeque::from(vec!["first".to_string(), "second".to_string()])),
        });
        let params = GenerationParams {
            temperature: 0.0,
            max_tokens: 100_000,
            reserved_tokens: 1_000,
        };
        let gateway = ModelGateway::new(client, params, Duration::from_secs(30)).with_retry(
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
        );
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(FinalAnswer)];
        let runtime = AgentRuntime {
            agent_name: "Tester".to_string(),
            gateway: Arc::new(gateway),
            executor: ToolExecutor::new(
                Arc::new(ToolRegistry::from_tools(tools).unwrap()),
                ToolContext::new(dir),
                ExecutionLimits::default(),
            ),
            prompt: PromptTemplate::builtin(),
            limits: LoopLimits {
                max_idle_loops,
                max_steps: 1_000,
                ..LoopLimits::default()
            },
        };
        AgentSupervisor::new(
            runtime,
            Arc::new(FileStateStore::new(dir.join("agents"))),
            SessionIndex::new(dir.join("sessions")),
        )
    }

    #[tokio::test]
    async fn test_start_wait_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 5);

        let id = supervisor
            .start("answer me", Some("s1".to_string()))
            .await
            .unwrap();
        let report = supervisor.wait(&id).await.unwrap();
        assert_eq!(report.reason, TerminalReason::FinalAnswer);
        assert_eq!(report.final_answer.as_deref(), Some("first"));

        let sessions = supervisor.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, AgentStatus::Stopped);

        assert!(matches!(
            supervisor.start("again", Some("s1".to_string())).await,
            Err(AgentError::SessionExists(_))
        ));

        supervisor.resume("s1").await.unwrap();
        let report = supervisor.wait("s1").await.unwrap();
        assert_eq!(report.final_answer.as_deref(), Some("second"));
        assert_eq!(report.steps, 2);
    }

    #[tokio::test]
    async fn test_unknown_and_reserved_ids() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 5);
        assert!(matches!(
            supervisor.resume("nobody").await,
            Err(AgentError::UnknownAgent(_))
        ));
        assert!(matches!(
            supervisor.stop("nobody").await,
            Err(AgentError::UnknownAgent(_))
        ));
        assert!(matches!(
            supervisor.start("t", Some("default".to_string())).await,
            Err(AgentError::Persistence(PersistenceError::InvalidId(_)))
        ));
    }

    #[tokio::test]
    async fn test_independent_agents_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 1_000);

        let a = supervisor.start("please wait", None).await.unwrap();
        let b = supervisor.start("please wait too", None).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(supervisor.list().await.len(), 2);

        supervisor.pause(&a).await.unwrap();
        let state = supervisor.state(&b).await.unwrap();
        assert_eq!(state.task, "please wait too");

        let reports = supervisor.shutdown().await;
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.reason, TerminalReason::StopRequested);
            assert_eq!(report.status, AgentStatus::Stopped);
        }
        assert!(supervisor.list().await.is_empty());

        let view = supervisor.inspect(&a).await.unwrap();
        assert!(!view.running);
        assert_eq!(view.summary.terminal_reason, Some(TerminalReason::StopRequested));
    }

    #[tokio::test]
    async fn test_follow_up_message_continues_session() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 5);

        supervisor.send_message("chat", "answer me").await.unwrap();
        let report = supervisor.wait("chat").await.unwrap();
        assert_eq!(report.final_answer.as_deref(), Some("first"));
        assert_eq!(report.steps, 1);

        supervisor
            .send_message("chat", "and once more")
            .await
            .unwrap();
        let report = supervisor.wait("chat").await.unwrap();
        assert_eq!(report.reason, TerminalReason::FinalAnswer);
        assert_eq!(report.final_answer.as_deref(), Some("second"));
        assert_eq!(report.steps, 3);

        let state = supervisor.state("chat").await.unwrap();
        assert_eq!(state.task, "answer me");
        assert!(matches!(
            &state.steps[1].action,
            Action::UserMessage { content } if content == "and once more"
        ));
    }

    #[tokio::test]
    async fn test_message_to_running_agent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 1_000);

        supervisor.start("please wait", Some("busy".to_string())).await.unwrap();
        assert!(matches!(
            supervisor.send_message("busy", "hello?").await,
            Err(AgentError::AlreadyRunning(_))
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_blocked_command_does_not_hold_agent_table() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), 5);

        // An agent whose command queue is full and never drained.
        let (commands, _queue) = mpsc::channel(1);
        commands.try_send(ControlCommand::Checkpoint).unwrap();
        let state = AgentState::new("stuck", "never reads commands");
        let (_view_tx, view) = watch::channel(AgentView::of(&state, false, true));
        let task = tokio::spawn(std::future::pending::<RunReport>());
        supervisor.agents.write().await.insert(
            "stuck".to_string(),
            RunningAgent {
                handle: AgentHandle {
                    commands,
                    view,
                    cancel: CancellationToken::new(),
                },
                task,
            },
        );

        let blocked = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.pause("stuck").await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.start("answer me", Some("other".to_string())),
        )
        .await;
        assert_eq!(started.unwrap().unwrap(), "other");
        assert!(!blocked.is_finished());

        blocked.abort();
        if let Some(agent) = supervisor.agents.write().await.remove("stuck") {
            agent.task.abort();
        }
        supervisor.wait("other").await.unwrap();
    }
}
