//! Tool-call transport for the session broker.
//!
//! Provides:
//! - Wire protocol (JSON Lines, tagged by tool name)
//! - Dispatcher from tool calls to session manager operations
//! - Stdio serving loop

pub mod dispatch;
pub mod protocol;
pub mod stdio;

pub use dispatch::ToolDispatcher;
pub use protocol::{ProtocolError, ToolCall, ToolRequest, ToolResponse};
