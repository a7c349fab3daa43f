//! # Magic Agent
//!
//! Autonomous tool-using LLM agent runtime.
//!
//! This library provides:
//! - A step-bounded agent loop that alternates model calls and tool calls
//! - A tool registry with schema validation, timeouts and optional
//!   container sandboxing
//! - Durable agent state with resumable sessions
//! - An MCP (JSON-RPC over HTTP) control surface
//!
//! ## Architecture
//!
//! ```text
//!   MCP client ──► mcp::McpServer ──► agents::AgentSupervisor
//!                                           │ (one task per agent)
//!                                           ▼
//!                                  agents::Orchestrator ──► state::StateStore
//!                                     │            │
//!                                     ▼            ▼
//!                           llm::ModelGateway   tools::ToolExecutor ──► sandbox::Sandbox
//! ```
//!
//! ## Step Flow
//! 1. Rebuild the conversation from the step history
//! 2. Ask the model for the next action
//! 3. Validate and run the tool call it proposes
//! 4. Append the step, snapshot when due, apply queued control commands
//!
//! ## Modules
//! - `agents`: orchestrator loop, supervisor, prompts, checkpointing
//! - `llm`: provider backends behind a retrying, budget-aware gateway
//! - `tools`: built-in tools, discovery, registry and executor
//! - `state`: agent state model, file store and session index
//! - `mcp`: HTTP control surface

pub mod agents;
pub mod config;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod sandbox;
pub mod state;
pub mod tools;
pub mod util;

pub use agents::{AgentSupervisor, Orchestrator, RunReport};
pub use config::Config;
pub use state::{AgentState, AgentStatus, TerminalReason};
