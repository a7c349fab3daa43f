//! HTTP control surface speaking MCP over JSON-RPC 2.0.
//!
//! `POST /mcp` takes one JSON-RPC request per body. The control operations
//! are exposed as MCP tools (`tools/list`, `tools/call`) and forwarded to the
//! [`AgentSupervisor`]; they only enqueue commands, so a failing request never
//! changes an agent's loop state.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::types::{
    JsonRpcRequest, JsonRpcResponse, McpCallToolRequest, McpCallToolResponse, McpToolDescriptor,
    ProtocolError, JSONRPC_VERSION, PROTOCOL_VERSION,
};
use crate::agents::AgentSupervisor;
use crate::config::McpConfig;

pub struct McpServer {
    supervisor: AgentSupervisor,
    server_reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartArgs {
    task: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionArgs {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InspectArgs {
    session_id: String,
    #[serde(default)]
    include_steps: bool,
}

fn session_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "session_id": {"type": "string", "description": description}
        },
        "required": ["session_id"]
    })
}

fn tool_descriptors() -> Vec<McpToolDescriptor> {
    let tool = |name: &str, description: &str, input_schema: Value| McpToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    };
    vec![
        tool(
            "start_agent",
            "Start a new agent on a task. Returns the session id.",
            json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What the agent should do"},
                    "session_id": {"type": "string", "description": "Optional id for the new session"}
                },
                "required": ["task"]
            }),
        ),
        tool(
            "stop_agent",
            "Stop a running agent at its next step boundary.",
            session_schema("Session to stop"),
        ),
        tool(
            "pause_agent",
            "Pause a running agent at its next step boundary.",
            session_schema("Session to pause"),
        ),
        tool(
            "resume_agent",
            "Unpause a running agent, or continue a persisted session.",
            session_schema("Session to resume"),
        ),
        tool(
            "inspect_agent",
            "Report an agent's status, step count and final answer.",
            json!({
                "type": "object",
                "properties": {
                    "session_id": {"type": "string"},
                    "include_steps": {"type": "boolean", "description": "Return the full step history"}
                },
                "required": ["session_id"]
            }),
        ),
        tool(
            "list_agents",
            "List running agents and persisted sessions.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "ping",
            "Check that the control surface is alive.",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

fn parse_args<T: DeserializeOwned>(args: Option<Value>) -> Result<T, ProtocolError> {
    let args = match args {
        None | Some(Value::Null) => json!({}),
        Some(args) => args,
    };
    serde_json::from_value(args).map_err(|e| ProtocolError::InvalidParams(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Internal(e.to_string()))
}

fn parse_request(value: Value) -> Result<JsonRpcRequest, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::InvalidRequest(
            "expected a single request object".to_string(),
        ));
    }
    let request: JsonRpcRequest = serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err(ProtocolError::InvalidRequest(format!(
            "unsupported jsonrpc version {:?}",
            request.jsonrpc
        )));
    }
    Ok(request)
}

impl McpServer {
    pub fn new(supervisor: AgentSupervisor, server_reference: impl Into<String>) -> Self {
        Self {
            supervisor,
            server_reference: server_reference.into(),
        }
    }

    pub fn supervisor(&self) -> &AgentSupervisor {
        &self.supervisor
    }

    /// Handle one request body. Notifications get no response.
    pub async fn handle_body(&self, body: &[u8]) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                let error = ProtocolError::Parse(e.to_string());
                return Some(JsonRpcResponse::error(Value::Null, &error));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request = match parse_request(value) {
            Ok(request) => request,
            Err(e) => return Some(JsonRpcResponse::error(id, &e)),
        };

        let method = request.method.clone();
        let result = self.handle(&request.method, request.params).await;
        if request.id.is_none() {
            if let Err(e) = result {
                tracing::debug!(method = %method, "Notification failed: {}", e);
            }
            return None;
        }
        Some(match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                tracing::debug!(method = %method, code = e.code(), "Request failed: {}", e);
                JsonRpcResponse::error(id, &e)
            }
        })
    }

    async fn handle(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": self.server_reference,
                    "version": env!("CARGO_PKG_VERSION")
                },
                "capabilities": {
                    "tools": {"listChanged": false}
                }
            })),
            "notifications/initialized" | "initialized" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
            "tools/call" => {
                let call: McpCallToolRequest = serde_json::from_value(params)
                    .map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
                let value = self.call_tool(&call.name, call.arguments).await?;
                to_json(&McpCallToolResponse::json(value))
            }
            other => Err(ProtocolError::MethodNotFound(other.to_string())),
        }
    }

    async fn call_tool(&self, name: &str, args: Option<Value>) -> Result<Value, ProtocolError> {
        let supervisor = &self.supervisor;
        match name {
            "start_agent" => {
                let args: StartArgs = parse_args(args)?;
                if args.task.trim().is_empty() {
                    return Err(ProtocolError::InvalidParams("task is empty".to_string()));
                }
                let id = supervisor.start(args.task, args.session_id).await?;
                tracing::info!(agent = %id, "Agent started over MCP");
                Ok(json!({ "session_id": id }))
            }
            "stop_agent" => {
                let args: SessionArgs = parse_args(args)?;
                supervisor.stop(&args.session_id).await?;
                Ok(json!({ "session_id": args.session_id, "requested": "stop" }))
            }
            "pause_agent" => {
                let args: SessionArgs = parse_args(args)?;
                supervisor.pause(&args.session_id).await?;
                Ok(json!({ "session_id": args.session_id, "requested": "pause" }))
            }
            "resume_agent" => {
                let args: SessionArgs = parse_args(args)?;
                supervisor.resume(&args.session_id).await?;
                Ok(json!({ "session_id": args.session_id, "requested": "resume" }))
            }
            "inspect_agent" => {
                let args: InspectArgs = parse_args(args)?;
                if args.include_steps {
                    to_json(&supervisor.state(&args.session_id).await?)
                } else {
                    to_json(&supervisor.inspect(&args.session_id).await?)
                }
            }
            "list_agents" => {
                let running = supervisor.list().await;
                let sessions = supervisor.sessions().await?;
                Ok(json!({
                    "running": to_json(&running)?,
                    "sessions": to_json(&sessions)?
                }))
            }
            "ping" => Ok(json!({ "pong": true })),
            other => Err(ProtocolError::InvalidParams(format!("Unknown tool: {}", other))),
        }
    }
}

pub fn router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn mcp_endpoint(State(server): State<Arc<McpServer>>, body: Bytes) -> Response {
    match server.handle_body(&body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health(State(server): State<Arc<McpServer>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "server": server.server_reference,
        "version": env!("CARGO_PKG_VERSION"),
        "agents": server.supervisor.list().await.len()
    }))
}

/// Bind `{host}:{port}` and serve until `shutdown` resolves.
pub async fn serve(
    config: &McpConfig,
    server: Arc<McpServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Control surface listening on {}", addr);
    serve_listener(listener, server, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    server: Arc<McpServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::agents::{AgentRuntime, LoopLimits, PromptTemplate};
    use crate::llm::{
        GenerationParams, LlmClient, LlmError, ModelGateway, ModelRequest, ModelResponse, ToolCall,
    };
    use crate::state::{FileStateStore, SessionIndex};
    use crate::tools::{ExecutionLimits, FinalAnswer, Tool, ToolContext, ToolExecutor, ToolRegistry};

    struct Answering;

    #[async_trait]
    impl LlmClient for Answering {
        fn provider(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _request: &ModelRequest) -> Result<ModelResponse, LlmError> {
            Ok(ModelResponse {
                tool_calls: vec![ToolCall::function(
                    "call_1",
                    "final_answer",
                    r#"{"answer": "all done"}"#.to_string(),
                )],
                ..ModelResponse::default()
            })
        }
    }

    fn server(dir: &Path) -> McpServer {
        let params = GenerationParams {
            temperature: 0.0,
            max_tokens: 100_000,
            reserved_tokens: 1_000,
        };
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(FinalAnswer)];
        let runtime = AgentRuntime {
            agent_name: "Tester".to_string(),
            gateway: Arc::new(ModelGateway::new(
                Arc::new(Answering),
                params,
                Duration::from_secs(30),
            )),
            executor: ToolExecutor::new(
                Arc::new(ToolRegistry::from_tools(tools).unwrap()),
                ToolContext::new(dir),
                ExecutionLimits::default(),
            ),
            prompt: PromptTemplate::builtin(),
            limits: LoopLimits::default(),
        };
        let supervisor = AgentSupervisor::new(
            runtime,
            Arc::new(FileStateStore::new(dir.join("agents"))),
            SessionIndex::new(dir.join("sessions")),
        );
        McpServer::new(supervisor, "magic-agent-test")
    }

    async fn call(server: &McpServer, body: &str) -> JsonRpcResponse {
        server.handle_body(body.as_bytes()).await.unwrap()
    }

    fn code(response: &JsonRpcResponse) -> i32 {
        response.error.as_ref().map(|e| e.code).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let response = call(&server, "{not json").await;
        assert_eq!(code(&response), -32700);
        assert_eq!(response.id, Value::Null);

        assert_eq!(code(&call(&server, "[1, 2]").await), -32600);
        assert_eq!(code(&call(&server, r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).await), -32600);
        assert_eq!(code(&call(&server, r#"{"jsonrpc":"2.0","id":2}"#).await), -32600);

        let response = call(&server, r#"{"jsonrpc":"2.0","id":3,"method":"agents/explode"}"#).await;
        assert_eq!(code(&response), -32601);
        assert_eq!(response.id, json!(3));

        let unknown_tool = r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"nope"}}"#;
        assert_eq!(code(&call(&server, unknown_tool).await), -32602);

        let no_task = r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"start_agent","arguments":{}}}"#;
        assert_eq!(code(&call(&server, no_task).await), -32602);

        let unknown_session = r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"stop_agent","arguments":{"session_id":"ghost"}}}"#;
        assert_eq!(code(&call(&server, unknown_session).await), -32602);
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let response = call(&server, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "magic-agent-test");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);

        let response = call(&server, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await;
        let names: Vec<String> = response.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"start_agent".to_string()));
        assert!(names.contains(&"inspect_agent".to_string()));

        let notification = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        assert!(server.handle_body(notification.as_bytes()).await.is_none());
    }

    #[tokio::test]
    async fn test_start_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());

        let start = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"start_agent","arguments":{"task":"finish up","session_id":"mcp-1"}}}"#;
        let response = call(&server, start).await;
        let result = response.result.unwrap();
        assert_eq!(result["structuredContent"]["session_id"], "mcp-1");
        assert_eq!(result["isError"], false);

        server.supervisor().wait("mcp-1").await.unwrap();

        let inspect = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"inspect_agent","arguments":{"session_id":"mcp-1"}}}"#;
        let view = call(&server, inspect).await.result.unwrap()["structuredContent"].clone();
        assert_eq!(view["status"], "stopped");
        assert_eq!(view["terminal_reason"], "final_answer");
        assert_eq!(view["final_answer"], "all done");
        assert_eq!(view["running"], false);
    }
}
