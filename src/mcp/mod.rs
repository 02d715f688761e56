//! MCP (Model Context Protocol) server implementation.
//!
//! JSON-RPC over stdio for AI tool integration; the framing (`protocol`) is
//! transport plumbing, the ten tool schemas (`tools`) and the dispatcher
//! (`handler`) are specific to this crate's Memory Service.

pub mod handler;
pub mod protocol;
pub mod tools;

pub use handler::EngramMcpHandler;
pub use protocol::{
    methods, InitializeResult, McpHandler, McpRequest, McpResponse, McpServer, ToolCallResult,
};
pub use tools::{get_tool_definitions, TOOL_DEFINITIONS};
