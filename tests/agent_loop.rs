//! End-to-end runs of the agent loop against a scripted model.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    final_answer, params, runtime, runtime_with_executor, thought, tool_call, CountingStore,
    ScriptedClient, SleepyRuntime,
};
use magic_agent::agents::{Checkpointer, LoopLimits, Orchestrator};
use magic_agent::config::SandboxConfig;
use magic_agent::llm::tokens::estimate_messages_tokens;
use magic_agent::state::{Action, AgentState, AgentStatus, FileStateStore, StateStore, TerminalReason};
use magic_agent::sandbox::Sandbox;
use magic_agent::tools::{
    ExecutionLimits, FinalAnswer, SandboxExecute, Tool, ToolContext, ToolErrorKind, ToolExecutor,
    ToolRegistry,
};

fn limits(max_steps: usize, max_idle_loops: usize) -> LoopLimits {
    LoopLimits {
        max_steps,
        max_idle_loops,
        ..LoopLimits::default()
    }
}

#[tokio::test]
async fn unknown_tool_stops_at_step_bound_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::repeating(tool_call("ghost_tool", json!({}))));
    let store = Arc::new(FileStateStore::new(dir.path().join("agents")));
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("ghost", "call a tool that does not exist"),
        runtime(dir.path(), client.clone(), params(100_000, 1_000), limits(3, 10)),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );

    let report = orchestrator.run().await;
    assert_eq!(report.status, AgentStatus::Stopped);
    assert_eq!(report.reason, TerminalReason::MaxSteps);
    assert_eq!(report.steps, 3);
    assert_eq!(client.request_count(), 3);

    let state = store.load("ghost").await.unwrap();
    assert_eq!(state.status, AgentStatus::Stopped);
    for step in &state.steps {
        let observation = step.observation.as_ref().unwrap();
        assert!(!step.success);
        assert!(observation.is_error);
        assert_eq!(observation.error_kind, Some(ToolErrorKind::NotFound));
    }
}

#[tokio::test]
async fn idle_loop_ends_after_exactly_max_idle_steps() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(
        vec![Ok(tool_call("echo", json!({"text": "work"})))],
        thought("I am thinking about it"),
    ));
    let store = Arc::new(FileStateStore::new(dir.path().join("agents")));
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("idle", "think forever"),
        runtime(dir.path(), client, params(100_000, 1_000), limits(100, 4)),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );

    let report = orchestrator.run().await;
    assert_eq!(report.reason, TerminalReason::IdleLimit);
    assert_eq!(report.status, AgentStatus::Stopped);

    let state = store.load("idle").await.unwrap();
    assert_eq!(state.steps.len(), 5);
    assert!(matches!(state.steps[0].action, Action::ToolCall { .. }));
    assert!(state.steps[1..]
        .iter()
        .all(|s| matches!(s.action, Action::Thought { .. })));
    assert_eq!(state.idle_loops, 4);
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_throttled_by_save_interval() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(
        ScriptedClient::new(
            vec![
                Ok(tool_call("echo", json!({"text": "one"}))),
                Ok(tool_call("echo", json!({"text": "two"}))),
                Ok(final_answer("done")),
            ],
            thought("unused"),
        )
        .with_delay(Duration::from_secs(1)),
    );
    let store = Arc::new(CountingStore::new(&dir.path().join("agents")));
    let limits = LoopLimits {
        save_interval: Duration::from_secs(5),
        auto_save: true,
        ..limits(10, 5)
    };
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("throttled", "echo twice"),
        runtime(dir.path(), client, params(100_000, 1_000), limits),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );

    let report = orchestrator.run().await;
    assert_eq!(report.reason, TerminalReason::FinalAnswer);
    // One snapshot after the first step, none for the second one a second
    // later, then the final flush.
    assert_eq!(store.saved_step_counts(), vec![1, 3]);
}

#[tokio::test]
async fn auto_save_off_still_flushes_on_termination() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::repeating(tool_call("echo", json!({"text": "x"}))));
    let store = Arc::new(CountingStore::new(&dir.path().join("agents")));
    let limits = LoopLimits {
        auto_save: false,
        ..limits(4, 5)
    };
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("manual", "echo"),
        runtime(dir.path(), client, params(100_000, 1_000), limits),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );

    orchestrator.run().await;
    assert_eq!(store.saved_step_counts(), vec![4]);
}

#[tokio::test]
async fn resumed_run_gets_a_fresh_step_allowance() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::repeating(tool_call("echo", json!({"text": "again"}))));
    let store = Arc::new(FileStateStore::new(dir.path().join("agents")));

    let (first, _) = Orchestrator::new(
        AgentState::new("resumable", "keep echoing"),
        runtime(dir.path(), client.clone(), params(100_000, 1_000), limits(2, 5)),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );
    assert_eq!(first.run().await.steps, 2);

    let mut state = store.load("resumable").await.unwrap();
    assert_eq!(state.terminal_reason, Some(TerminalReason::MaxSteps));
    state.reopen();
    let (second, _) = Orchestrator::new(
        state,
        runtime(dir.path(), client.clone(), params(100_000, 1_000), limits(2, 5)),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );
    let report = second.run().await;
    assert_eq!(report.reason, TerminalReason::MaxSteps);
    assert_eq!(report.steps, 4);

    let state = store.load("resumable").await.unwrap();
    let indices: Vec<usize> = state.steps.iter().map(|s| s.index).collect();
    assert_eq!(indices, [0, 1, 2, 3]);
}

#[tokio::test]
async fn context_never_exceeds_token_budget() {
    let dir = tempfile::tempdir().unwrap();
    // Each observation is ~750 tokens; the budget only fits a couple.
    let client = Arc::new(ScriptedClient::repeating(tool_call(
        "echo",
        json!({"text": "abc ", "times": 750}),
    )));
    let store = Arc::new(FileStateStore::new(dir.path().join("agents")));
    let (max_tokens, reserved) = (4_000, 1_000);
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("budget", "produce a lot of output"),
        runtime(dir.path(), client.clone(), params(max_tokens, reserved), limits(8, 5)),
        Checkpointer::spawn(store, None),
        CancellationToken::new(),
    );

    let report = orchestrator.run().await;
    assert_eq!(report.reason, TerminalReason::MaxSteps);

    let requests = client.requests.lock().unwrap();
    assert_eq!(requests.len(), 8);
    for request in requests.iter() {
        assert!(estimate_messages_tokens(&request.messages) <= max_tokens - reserved);
    }
}

#[tokio::test(start_paused = true)]
async fn sandboxed_call_timeout_is_saved_as_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(
        vec![
            Ok(tool_call("sandbox_execute", json!({"code": "sleep 10"}))),
            Ok(final_answer("gave up on the slow command")),
        ],
        thought("unused"),
    ));
    let containers = Arc::new(SleepyRuntime::new(Duration::from_secs(10)));
    let sandbox = Sandbox::new(
        containers.clone(),
        SandboxConfig {
            timeout: 5,
            ..SandboxConfig::default()
        },
    );
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(SandboxExecute), Arc::new(FinalAnswer)];
    let executor = ToolExecutor::new(
        Arc::new(ToolRegistry::from_tools(tools).unwrap()),
        ToolContext::new(dir.path()).with_sandbox(sandbox),
        ExecutionLimits {
            sandbox_timeout: Duration::from_secs(5),
            ..ExecutionLimits::default()
        },
    );
    let store = Arc::new(FileStateStore::new(dir.path().join("agents")));
    let (orchestrator, _handle) = Orchestrator::new(
        AgentState::new("sandboxed", "run something slow in the sandbox"),
        runtime_with_executor(client, params(100_000, 1_000), limits(5, 5), executor),
        Checkpointer::spawn(store.clone(), None),
        CancellationToken::new(),
    );

    let report = orchestrator.run().await;
    assert_eq!(report.reason, TerminalReason::FinalAnswer);
    assert_eq!(report.steps, 2);

    let state = store.load("sandboxed").await.unwrap();
    let step = &state.steps[0];
    let observation = step.observation.as_ref().unwrap();
    assert!(!step.success);
    assert!(observation.is_error);
    assert_eq!(observation.error_kind, Some(ToolErrorKind::Timeout));
    assert_eq!(containers.live(), 0);
}
