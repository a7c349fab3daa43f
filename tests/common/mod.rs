//! Shared fixtures: a scripted model, a few fake tools and a counting store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use magic_agent::agents::{AgentRuntime, LoopLimits, PromptTemplate};
use magic_agent::llm::{
    GenerationParams, LlmClient, LlmError, ModelGateway, ModelRequest, ModelResponse,
    RetryConfig, ToolCall,
};
use magic_agent::sandbox::{ExecOutput, SandboxResult, SandboxRuntime, SandboxSpec};
use magic_agent::state::{AgentState, FileStateStore, PersistenceError, StateStore};
use magic_agent::tools::{
    ExecutionLimits, FinalAnswer, Tool, ToolContext, ToolExecutor, ToolOutput, ToolRegistry,
};

/// Replays a script of responses, then repeats `fallback` forever.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    fallback: ModelResponse,
    delay: Option<Duration>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<ModelResponse, LlmError>>, fallback: ModelResponse) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same response.
    pub fn repeating(response: ModelResponse) -> Self {
        Self::new(Vec::new(), response)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

pub fn thought(text: &str) -> ModelResponse {
    ModelResponse {
        content: Some(text.to_string()),
        ..ModelResponse::default()
    }
}

pub fn tool_call(name: &str, args: Value) -> ModelResponse {
    ModelResponse {
        tool_calls: vec![ToolCall::function("call_1", name, args.to_string())],
        ..ModelResponse::default()
    }
}

pub fn final_answer(answer: &str) -> ModelResponse {
    tool_call("final_answer", json!({ "answer": answer }))
}

/// Echoes `text`, optionally repeated `times` times.
pub struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "times": {"type": "integer", "minimum": 1}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let text = args["text"].as_str().unwrap_or_default();
        let times = args["times"].as_u64().unwrap_or(1) as usize;
        Ok(ToolOutput::text(text.repeat(times)))
    }
}

pub fn registry() -> Arc<ToolRegistry> {
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(Echo), Arc::new(FinalAnswer)];
    Arc::new(ToolRegistry::from_tools(tools).unwrap())
}

pub fn params(max_tokens: u64, reserved_tokens: u64) -> GenerationParams {
    GenerationParams {
        temperature: 0.0,
        max_tokens,
        reserved_tokens,
    }
}

pub fn runtime(
    dir: &Path,
    client: Arc<ScriptedClient>,
    params: GenerationParams,
    limits: LoopLimits,
) -> AgentRuntime {
    let executor = ToolExecutor::new(registry(), ToolContext::new(dir), ExecutionLimits::default());
    runtime_with_executor(client, params, limits, executor)
}

pub fn runtime_with_executor(
    client: Arc<ScriptedClient>,
    params: GenerationParams,
    limits: LoopLimits,
    executor: ToolExecutor,
) -> AgentRuntime {
    let gateway = ModelGateway::new(client, params, Duration::from_secs(30)).with_retry(
        RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        },
    );
    AgentRuntime {
        agent_name: "Tester".to_string(),
        gateway: Arc::new(gateway),
        executor,
        prompt: PromptTemplate::builtin(),
        limits,
    }
}

/// Container runtime whose commands take `delay` to finish.
pub struct SleepyRuntime {
    pub delay: Duration,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
}

impl SleepyRuntime {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        }
    }

    /// Containers created but not yet removed.
    pub fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRuntime for SleepyRuntime {
    fn name(&self) -> &str {
        "sleepy"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn create(&self, _spec: &SandboxSpec) -> SandboxResult<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sleepy-{}", n))
    }

    async fn exec(&self, _id: &str, command: &[String]) -> SandboxResult<ExecOutput> {
        tokio::time::sleep(self.delay).await;
        Ok(ExecOutput {
            exit_code: 0,
            stdout: command.join(" "),
            stderr: String::new(),
        })
    }

    async fn remove(&self, _id: &str) -> SandboxResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File store that remembers the step count of every save.
pub struct CountingStore {
    inner: FileStateStore,
    pub saves: Mutex<Vec<usize>>,
}

impl CountingStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: FileStateStore::new(dir),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn saved_step_counts(&self) -> Vec<usize> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn save(&self, state: &AgentState) -> Result<(), PersistenceError> {
        self.saves.lock().unwrap().push(state.steps.len());
        self.inner.save(state).await
    }

    async fn load(&self, id: &str) -> Result<AgentState, PersistenceError> {
        self.inner.load(id).await
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.list().await
    }
}
