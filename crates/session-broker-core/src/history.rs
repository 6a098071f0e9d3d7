//! Bounded view of recent session activity.
//!
//! The history is derived from the event log and capped by serialized size,
//! dropping the oldest entries first. It is what a caller sees when reopening
//! a session, so it stays small enough to hand back in one response.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{Event, EventKind};

/// Default history size limit (32k characters).
pub const HISTORY_CHARS: usize = 32 * 1024;

/// One condensed line of session activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: f64,
    pub event_type: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_of_what_we_just_did: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_of_what_we_about_to_do: Option<String>,
    /// Raw request text for `user_request` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_request: Option<String>,
    pub success: bool,
    pub duration: f64,
}

impl HistoryEntry {
    fn approx_chars(&self) -> usize {
        serde_json::to_string(self).map_or(0, |s| s.chars().count())
    }

    fn render(&self, index: usize) -> String {
        let status = if self.success { "✓" } else { "✗" };
        let mut text = format!("Entry {index} [{:.0}] {status}\n", self.timestamp);

        if self.event_type == EventKind::UserRequest {
            text.push_str(&format!(
                "  User Request: {}\n",
                self.user_request.as_deref().unwrap_or_default()
            ));
        } else {
            text.push_str(&format!(
                "  Task: {}\n  Just did: {}\n  About to do: {}\n",
                self.current_task.as_deref().unwrap_or_default(),
                self.summary_of_what_we_just_did.as_deref().unwrap_or_default(),
                self.summary_of_what_we_about_to_do.as_deref().unwrap_or_default(),
            ));
        }
        text.push_str(&format!("  Type: {}", self.event_type));
        if self.duration > 0.0 {
            text.push_str(&format!("\n  Duration: {:.2}s", self.duration));
        }
        text
    }
}

impl From<&Event> for HistoryEntry {
    fn from(event: &Event) -> Self {
        let user_request = (event.kind == EventKind::UserRequest)
            .then(|| {
                event
                    .inputs
                    .get("user_request")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            })
            .flatten();

        Self {
            timestamp: event.timestamp,
            event_type: event.kind,
            current_task: event.context.current_task.clone(),
            summary_of_what_we_just_did: event.context.summary_of_what_we_just_did.clone(),
            summary_of_what_we_about_to_do: event.context.summary_of_what_we_about_to_do.clone(),
            user_request,
            success: event.succeeded(),
            duration: event.duration,
        }
    }
}

#[derive(Clone)]
struct StoredEntry {
    entry: HistoryEntry,
    chars: usize,
}

/// Size-capped, oldest-first-evicting list of recent activity.
#[derive(Clone)]
pub struct ActivityHistory {
    entries: VecDeque<StoredEntry>,
    total_chars: usize,
    max_chars: usize,
}

impl Default for ActivityHistory {
    fn default() -> Self {
        Self::new(HISTORY_CHARS)
    }
}

impl ActivityHistory {
    /// Create an empty history with the given size cap.
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(32),
            total_chars: 0,
            max_chars,
        }
    }

    /// Build a history from events in log order.
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>, max_chars: usize) -> Self {
        let mut history = Self::new(max_chars);
        for event in events {
            history.push(HistoryEntry::from(event));
        }
        history
    }

    /// Add an entry, evicting the oldest entries while over the cap.
    ///
    /// The newest entry is always retained, even if it alone exceeds the cap.
    pub fn push(&mut self, entry: HistoryEntry) {
        let chars = entry.approx_chars();
        while self.total_chars.saturating_add(chars) > self.max_chars {
            if let Some(front) = self.entries.pop_front() {
                self.total_chars = self.total_chars.saturating_sub(front.chars);
            } else {
                break;
            }
        }
        self.entries.push_back(StoredEntry { entry, chars });
        self.total_chars = self.total_chars.saturating_add(chars);
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().map(|s| s.entry.clone()).collect()
    }

    /// The most recent `limit` entries, oldest first.
    #[must_use]
    pub fn tail(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries
            .iter()
            .skip(skip)
            .map(|s| s.entry.clone())
            .collect()
    }

    /// Human-readable rendering of the most recent `limit` entries.
    #[must_use]
    pub fn render(&self, limit: Option<usize>) -> String {
        let entries = self.tail(limit.unwrap_or(usize::MAX));
        if entries.is_empty() {
            return "No history available.".to_string();
        }
        entries
            .iter()
            .enumerate()
            .map(|(i, e)| e.render(i + 1))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
