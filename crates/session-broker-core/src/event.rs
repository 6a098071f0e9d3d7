//! Immutable records of completed operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{OperationContext, clock};

/// Operation type recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Run,
    Read,
    Write,
    Cd,
    UserRequest,
    Learning,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Read => "read",
            Self::Write => "write",
            Self::Cd => "cd",
            Self::UserRequest => "user_request",
            Self::Learning => "learning",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed operation within a session.
///
/// Events are written once and never modified; the log of events is the
/// authoritative history of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Start time (Unix epoch seconds, fractional).
    pub timestamp: f64,
    /// Operation type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Caller-supplied context, stored verbatim.
    #[serde(flatten)]
    pub context: OperationContext,
    /// Operation-specific inputs.
    #[serde(default)]
    pub inputs: Value,
    /// Operation-specific outputs, including `success` and `error`.
    #[serde(default)]
    pub outputs: Value,
    /// Wall time spent on the operation, in seconds.
    #[serde(default)]
    pub duration: f64,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, context: OperationContext, inputs: Value, outputs: Value) -> Self {
        Self {
            timestamp: clock::now_precise(),
            kind,
            context,
            inputs,
            outputs,
            duration: 0.0,
        }
    }

    /// Set the start time.
    #[must_use]
    pub const fn started_at(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the duration in seconds.
    #[must_use]
    pub const fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    /// Whether the outputs report success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outputs
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Error text reported in the outputs, if any.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.outputs
            .get("error")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
    }
}
