//! Wire protocol for tool calls.
//!
//! One JSON object per line in each direction. Requests are tagged by
//! `"tool"`; command tools carry the caller's context fields inline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_broker_core::{ErrorKind, OperationContext};
use session_broker_session::ManagerError;
use thiserror::Error;

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid request: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Failed to serialize response: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl ProtocolError {
    /// Caller-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Validation,
            Self::Serialize(_) | Self::Io(_) => ErrorKind::Internal,
            Self::Manager(e) => e.kind(),
        }
    }
}

const fn default_create_dirs() -> bool {
    true
}

/// A tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    /// List live sessions.
    SessionsList,
    /// Create and activate a session.
    SessionCreate {
        name: String,
        #[serde(default)]
        description: String,
    },
    /// Activate a session by id or name.
    SessionOpen {
        #[serde(alias = "name")]
        session_id: String,
    },
    /// Show the active session.
    SessionCurrent,
    /// Deactivate the active session.
    SessionClose,
    /// Rename a session.
    SessionRename { old_name: String, new_name: String },
    /// Soft-delete a session by id or name.
    SessionDelete {
        #[serde(alias = "session_id")]
        name: String,
    },
    /// Change the active session's directory.
    CommandCd {
        directory: String,
        #[serde(flatten)]
        context: OperationContext,
    },
    /// Read a file.
    CommandRead {
        file_path: String,
        #[serde(flatten)]
        context: OperationContext,
    },
    /// Write a file atomically.
    CommandWrite {
        file_path: String,
        content: String,
        #[serde(default = "default_create_dirs")]
        create_dirs: bool,
        #[serde(flatten)]
        context: OperationContext,
    },
    /// Run a shell command.
    CommandRun {
        command: String,
        #[serde(default)]
        timeout: Option<f64>,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(flatten)]
        context: OperationContext,
    },
    /// Record what the user asked for.
    RecordUserRequest { user_request: String },
    /// Record something learned.
    AddLearning {
        learning: String,
        #[serde(flatten)]
        context: OperationContext,
    },
    /// Append an instruction.
    AddInstruction { instruction: String },
    /// Replace all instructions.
    ReplaceInstructions { instructions: Vec<String> },
    /// Read instructions.
    ReadInstructions,
    /// Recent activity of the active session.
    SessionHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// A request line: an optional correlation id plus the call.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub call: ToolCall,
}

impl ToolRequest {
    /// Parse one request line. On failure the id is still recovered when
    /// the line is a JSON object carrying one.
    ///
    /// # Errors
    /// Returns the recovered id and a `Parse` error.
    pub fn parse(line: &str) -> Result<Self, (Option<Value>, ProtocolError)> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| (None, ProtocolError::Parse(e)))?;
        let id = value.get("id").cloned();
        serde_json::from_value(value).map_err(|e| (id, ProtocolError::Parse(e)))
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(id: Option<Value>, error: &ProtocolError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ToolError {
                kind: error.kind(),
                message: error.to_string(),
            }),
        }
    }
}
