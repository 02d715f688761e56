//! The HTTP coordinator surface (spec §6.2): axum routes plus an SSE change
//! feed, serving the same Memory Service every MCP tool call goes through.

pub mod events;
pub mod server;

pub use events::ChangeEvent;
pub use server::{build_router, HttpConfig};
