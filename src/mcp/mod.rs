//! MCP control surface.
//!
//! Exposes the agent supervisor to external MCP clients: start, stop, pause,
//! resume, inspect and list agents over JSON-RPC 2.0 on HTTP.

mod server;
mod types;

pub use server::{router, serve, serve_listener, McpServer};
pub use types::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpCallToolRequest, McpCallToolResponse,
    McpContent, McpToolDescriptor, ProtocolError, JSONRPC_VERSION, PROTOCOL_VERSION,
};
