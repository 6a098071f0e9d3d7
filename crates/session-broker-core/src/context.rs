//! Caller-supplied context attached to every recorded operation.

use serde::{Deserialize, Serialize};

/// Free-text context describing why an operation is being performed.
///
/// The broker never interprets these fields; they are copied verbatim into
/// the event log and shown to the summarizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    /// The task the caller is in the middle of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,

    /// What the caller just did and how it went.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_of_what_we_just_did: Option<String>,

    /// What the caller is about to do next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_of_what_we_about_to_do: Option<String>,
}

impl OperationContext {
    /// Create a context with just a current task.
    #[must_use]
    pub fn new(current_task: impl Into<String>) -> Self {
        Self {
            current_task: Some(current_task.into()),
            ..Self::default()
        }
    }

    /// Set the "what we just did" field.
    #[must_use]
    pub fn with_just_did(mut self, text: impl Into<String>) -> Self {
        self.summary_of_what_we_just_did = Some(text.into());
        self
    }

    /// Set the "what we are about to do" field.
    #[must_use]
    pub fn with_about_to_do(mut self, text: impl Into<String>) -> Self {
        self.summary_of_what_we_about_to_do = Some(text.into());
        self
    }

    /// One-line rendering used in prompts and history views.
    #[must_use]
    pub fn describe(&self) -> String {
        let parts: Vec<String> = [
            ("Task", &self.current_task),
            ("Just did", &self.summary_of_what_we_just_did),
            ("About to do", &self.summary_of_what_we_about_to_do),
        ]
        .into_iter()
        .filter_map(|(label, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| format!("{label}: {v}"))
        })
        .collect();

        if parts.is_empty() {
            "No context provided".to_string()
        } else {
            parts.join(" | ")
        }
    }
}
