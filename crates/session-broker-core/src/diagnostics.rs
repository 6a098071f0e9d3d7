//! Per-session diagnostic records written by the summary worker.
//!
//! They sit beside the event log but are not part of a session's history:
//! nothing in them is shown to the summarizer or counted as an event.

use serde::{Deserialize, Serialize};

/// Which diagnostic log a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticLog {
    /// Summary failures and budget changes.
    Errors,
    /// Every text generation call with its prompt and response.
    LlmInteractions,
}

impl DiagnosticLog {
    /// File name of the log inside the session directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Errors => "errors.jsonl",
            Self::LlmInteractions => "llm.jsonl",
        }
    }
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A text generation call made for a summary update.
    LlmInteraction {
        timestamp: f64,
        model: String,
        prompt: String,
        response: String,
        #[serde(default)]
        error: Option<String>,
        duration: f64,
        prompt_length: usize,
        response_length: usize,
        token_budget: usize,
    },
    /// A summary update that was given up on.
    SummaryFailed {
        timestamp: f64,
        error: String,
        events: usize,
        token_budget: usize,
    },
    /// The batch token budget was lowered after the model rejected a prompt
    /// as too long.
    BudgetLowered {
        timestamp: f64,
        #[serde(default)]
        context_length: Option<usize>,
        from: usize,
        to: usize,
    },
}

impl Diagnostic {
    /// The log this record is written to.
    #[must_use]
    pub const fn log(&self) -> DiagnosticLog {
        match self {
            Self::LlmInteraction { .. } => DiagnosticLog::LlmInteractions,
            Self::SummaryFailed { .. } | Self::BudgetLowered { .. } => DiagnosticLog::Errors,
        }
    }
}
