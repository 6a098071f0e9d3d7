//! Core traits for session storage and text generation.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{Diagnostic, DiagnosticLog, Event, EventLogError, clock};

/// Session identifier.
pub type SessionId = Uuid;

/// Lifecycle state of a session record.
///
/// The state on the record is authoritative; where a backend physically
/// keeps a deleted record is a consequence of this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    /// Session is live and may receive operations.
    Active,
    /// Session was soft-deleted at the given Unix time.
    Deleted { deleted_at: i64 },
}

/// Session filter for queries.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Include soft-deleted sessions.
    pub include_deleted: bool,
    /// Filter by exact name.
    pub name: Option<String>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Whether a session passes this filter.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        if !self.include_deleted && session.is_deleted() {
            return false;
        }
        if let Some(ref name) = self.name {
            if session.name != *name {
                return false;
            }
        }
        true
    }
}

/// Persisted session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Human-chosen name, unique among non-deleted sessions.
    pub name: String,
    /// What the session is for.
    pub description: String,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
    /// Absolute working directory for commands.
    pub current_directory: PathBuf,
    /// Rolling summary maintained by the summary worker.
    #[serde(default)]
    pub summary: String,
    /// Progress marker maintained by the summary worker.
    #[serde(default)]
    pub progress: String,
    /// User-editable instructions, in order.
    #[serde(default)]
    pub instructions: Vec<String>,
    /// Number of events recorded for this session.
    #[serde(default)]
    pub event_count: u64,
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
}

impl Session {
    /// Create a fresh active session.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        current_directory: PathBuf,
    ) -> Self {
        let timestamp = clock::now();
        let description = description.into();
        let summary = format!(
            "Session Purpose: {description}\n\nStarted at: {}\n\nSession Log:\n",
            current_directory.display()
        );
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description,
            created_at: timestamp,
            updated_at: timestamp,
            current_directory,
            summary,
            progress: String::new(),
            instructions: Vec::new(),
            event_count: 0,
            lifecycle: Lifecycle::Active,
        }
    }

    /// Whether the session has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Deleted { .. })
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = clock::now().max(self.updated_at);
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt session record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Build an I/O error with context.
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Trait for session storage backends.
///
/// Implementations persist records and events but enforce no business
/// rules; name uniqueness and locking belong to the session manager.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist a newly created session.
    async fn insert(&self, session: &Session) -> Result<(), StorageError>;

    /// Get a non-deleted session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// Atomically replace a non-deleted session record.
    async fn update(&self, session: &Session) -> Result<(), StorageError>;

    /// List sessions, most recently updated first.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError>;

    /// Transition a session to `Deleted` and move it to the deleted namespace.
    async fn mark_deleted(&self, id: SessionId, deleted_at: i64) -> Result<Session, StorageError>;

    /// Append an event to the session's log.
    async fn append_event(&self, id: SessionId, event: &Event) -> Result<(), StorageError>;

    /// Replay the session's log in append order.
    async fn events(&self, id: SessionId) -> Result<Vec<Event>, StorageError>;

    /// Append a record to the diagnostic log it belongs to.
    async fn append_diagnostic(&self, id: SessionId, record: &Diagnostic) -> Result<(), StorageError>;

    /// Read one diagnostic log in append order.
    async fn diagnostics(
        &self,
        id: SessionId,
        log: DiagnosticLog,
    ) -> Result<Vec<Diagnostic>, StorageError>;
}

/// A structured text-generation request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Model identifier understood by the backend.
    pub model: String,
    /// Full prompt text.
    pub prompt: String,
    /// Name of the response schema.
    pub schema_name: String,
    /// JSON schema the response must conform to.
    pub schema: Value,
}

/// Text generation error.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Text generation service unavailable: {0}")]
    Unavailable(String),
    #[error("Text generation request failed: {0}")]
    Request(String),
    #[error("Text generation returned an empty response")]
    EmptyResponse,
    #[error("Prompt exceeds the model context length: {message}")]
    ContextLength {
        /// Context length reported by the backend, when it names one.
        limit: Option<usize>,
        message: String,
    },
}

impl GenerationError {
    /// Classify a backend error message, recognizing context length
    /// rejections such as "Reached context length of 4096 tokens".
    #[must_use]
    pub fn from_backend_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("context length") || lower.contains("context_length") {
            Self::ContextLength {
                limit: first_number(&message),
                message,
            }
        } else {
            Self::Request(message)
        }
    }
}

fn first_number(text: &str) -> Option<usize> {
    text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .find(|word| !word.is_empty() && word.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|word| word.parse().ok())
}

/// Capability for calling an external text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate raw response text for a request.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}
