//! Rolling session summaries.
//!
//! The summarizer folds one or more events into the session's previous
//! summary and progress by asking a [`TextGenerator`] for a JSON object
//! matching [`summary_schema`]. Responses are cleaned of channel markup and
//! code fences before they are parsed.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use session_broker_core::{
    ErrorKind, Event,
    traits::{GenerationError, GenerationRequest, TextGenerator},
};
use thiserror::Error;

/// Name under which the response schema is registered.
pub const SUMMARY_SCHEMA_NAME: &str = "session_summary";

/// Per-event cap on abridged inputs and outputs in the prompt.
pub const ABRIDGE_CHARS: usize = 256;

const FINAL_CHANNEL: &str = "<|channel|>final<|message|>";
const END_TAG: &str = "<|end|>";

/// Summary generation error.
#[derive(Debug, Error)]
pub enum SummaryError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("Summary response is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Summary response has an empty summary")]
    EmptySummary,
    #[error("No events to summarize")]
    NoEvents,
}

impl SummaryError {
    /// Caller-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::SummaryGeneration
    }
}

/// A new summary and progress marker for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryUpdate {
    pub summary: String,
    pub progress: String,
}

/// JSON schema the generator must answer with.
#[must_use]
pub fn summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": { "type": "string" },
            "progress": { "type": "string" }
        },
        "required": ["summary", "progress"],
        "additionalProperties": false
    })
}

/// Rough token estimate, about four characters per token.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Shorten `text` to `max_chars`, keeping the head or the tail and noting
/// the original length.
#[must_use]
pub fn abridge(text: &str, max_chars: usize, keep_tail: bool) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    if keep_tail {
        let tail: String = text.chars().skip(count - max_chars).collect();
        format!("...(abridged from {count} chars)...{tail}")
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...(abridged from {count} chars)...")
    }
}

/// Strip channel markup and markdown fences from a raw response.
#[must_use]
pub fn clean_response(raw: &str) -> String {
    let text = if let Some(start) = raw.rfind(FINAL_CHANNEL) {
        let rest = &raw[start + FINAL_CHANNEL.len()..];
        rest.find(END_TAG).map_or(rest, |end| &rest[..end]).to_string()
    } else {
        strip_tags(raw)
    };
    strip_fence(text.trim()).trim().to_string()
}

fn strip_tags(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(open) = rest.find("<|") {
        match rest[open + 2..].find("|>") {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + 2 + close + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn strip_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. `json`) on the opening line; a single-line
    // fence only loses a leading `json` tag.
    let body = match body.find('\n') {
        Some(nl) => &body[nl + 1..],
        None => body.strip_prefix("json").unwrap_or(body),
    };
    body.trim_end().strip_suffix("```").unwrap_or(body)
}

fn describe_fields(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}: {s}"),
                other => format!("{key}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render one event for the prompt.
#[must_use]
pub fn format_event(index: usize, event: &Event) -> String {
    let inputs = abridge(&describe_fields(&event.inputs), ABRIDGE_CHARS, false);
    let outputs = abridge(&describe_fields(&event.outputs), ABRIDGE_CHARS, true);
    format!(
        "EVENT {index}:\n  Type: {}\n  Purpose: {}\n  Timestamp: {:.0}\n  Duration: {:.2}s\n  Input Details: {inputs}\n  Output Details: {outputs}\n",
        event.kind,
        event.context.describe(),
        event.timestamp,
        event.duration,
    )
}

/// Build the full prompt for a batch of events.
#[must_use]
pub fn build_prompt(previous_summary: &str, previous_progress: &str, events: &[Event]) -> String {
    let events_text = events
        .iter()
        .enumerate()
        .map(|(i, e)| format_event(i + 1, e))
        .collect::<Vec<_>>()
        .join("\n");
    let progress = if previous_progress.trim().is_empty() {
        "(none yet)"
    } else {
        previous_progress
    };

    format!(
        "You maintain the running notes for a working session on a software project.\n\
         The notes have two parts:\n\
         - summary: stable facts about the project and environment (locations, layout, \
         entry points, dependencies, build and test procedures, configuration). Keep only \
         facts confirmed by events; remove anything the new events contradict.\n\
         - progress: a short account of where the work stands and what comes next.\n\n\
         ==== CURRENT SUMMARY ====\n{previous_summary}\n\n\
         ==== CURRENT PROGRESS ====\n{progress}\n\n\
         ==== NEW EVENTS ====\n{events_text}\n\
         Respond with a JSON object containing the updated `summary` and `progress`."
    )
}

/// One summary request and what came of it.
#[derive(Debug)]
pub struct SummaryAttempt {
    /// Prompt sent to the generator. Empty when nothing was sent.
    pub prompt: String,
    /// Raw generator response. Empty when the call failed.
    pub response: String,
    /// Time spent waiting on the generator.
    pub duration: Duration,
    pub result: Result<SummaryUpdate, SummaryError>,
}

/// Produces updated summaries through a text generator.
#[derive(Clone)]
pub struct Summarizer {
    generator: Arc<dyn TextGenerator>,
    model: String,
}

impl Summarizer {
    /// Create a summarizer for the given backend and model.
    #[must_use]
    pub fn new(generator: Arc<dyn TextGenerator>, model: impl Into<String>) -> Self {
        Self {
            generator,
            model: model.into(),
        }
    }

    /// Model name passed to the generator.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fold consecutive events into the previous summary in one call.
    ///
    /// The attempt keeps the prompt and raw response alongside the result so
    /// callers can record the exchange whether or not it succeeded.
    pub async fn summarize_batch(
        &self,
        previous_summary: &str,
        previous_progress: &str,
        events: &[Event],
    ) -> SummaryAttempt {
        if events.is_empty() {
            return SummaryAttempt {
                prompt: String::new(),
                response: String::new(),
                duration: Duration::ZERO,
                result: Err(SummaryError::NoEvents),
            };
        }

        let prompt = build_prompt(previous_summary, previous_progress, events);
        tracing::debug!(
            events = events.len(),
            prompt_tokens = estimate_tokens(&prompt),
            "Requesting summary"
        );

        let request = GenerationRequest {
            model: self.model.clone(),
            prompt,
            schema_name: SUMMARY_SCHEMA_NAME.to_string(),
            schema: summary_schema(),
        };
        let started = Instant::now();
        let generated = self.generator.generate(&request).await;
        let duration = started.elapsed();

        let (response, result) = match generated {
            Ok(raw) => {
                let result = parse_update(&raw);
                (raw, result)
            }
            Err(e) => (String::new(), Err(e.into())),
        };
        SummaryAttempt {
            prompt: request.prompt,
            response,
            duration,
            result,
        }
    }
}

fn parse_update(raw: &str) -> Result<SummaryUpdate, SummaryError> {
    let cleaned = clean_response(raw);
    if cleaned.is_empty() {
        return Err(GenerationError::EmptyResponse.into());
    }
    let update: SummaryUpdate = serde_json::from_str(&cleaned).map_err(SummaryError::Malformed)?;
    if update.summary.trim().is_empty() {
        return Err(SummaryError::EmptySummary);
    }
    Ok(SummaryUpdate {
        summary: update.summary.trim().to_string(),
        progress: update.progress.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use session_broker_core::{EventKind, OperationContext};

    use super::*;

    struct Canned {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.reply
                .clone()
                .map_err(|()| GenerationError::Unavailable("offline".into()))
        }
    }

    fn canned(reply: Result<&str, ()>) -> Arc<Canned> {
        Arc::new(Canned {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn event() -> Event {
        Event::new(
            EventKind::Run,
            OperationContext::new("build").with_just_did("configured"),
            json!({ "command": "cargo build" }),
            json!({ "success": true, "stdout": "ok" }),
        )
    }

    #[test]
    fn abridge_keeps_head_or_tail() {
        let text = "abcdefghij";
        assert_eq!(abridge(text, 20, false), text);
        assert_eq!(abridge(text, 3, false), "abc...(abridged from 10 chars)...");
        assert_eq!(abridge(text, 3, true), "...(abridged from 10 chars)...hij");
    }

    #[test]
    fn clean_extracts_final_channel() {
        let raw = "<|channel|>analysis<|message|>thinking<|end|><|start|>assistant<|channel|>final<|message|>{\"summary\":\"s\",\"progress\":\"p\"}<|end|>";
        assert_eq!(clean_response(raw), "{\"summary\":\"s\",\"progress\":\"p\"}");
    }

    #[test]
    fn clean_strips_fences_and_stray_tags() {
        assert_eq!(clean_response("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_response("<|start|>{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn clean_strips_single_line_fences() {
        assert_eq!(clean_response("```{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(clean_response("```json {\"a\":1} ```"), "{\"a\":1}");
    }

    #[test]
    fn prompt_carries_previous_state_and_events() {
        let prompt = build_prompt("Session Purpose: demo", "", &[event()]);
        assert!(prompt.contains("Session Purpose: demo"));
        assert!(prompt.contains("(none yet)"));
        assert!(prompt.contains("EVENT 1:"));
        assert!(prompt.contains("Task: build | Just did: configured"));
        assert!(prompt.contains("command: cargo build"));
    }

    #[tokio::test]
    async fn summarize_parses_schema_response() {
        let generator = canned(Ok("{\"summary\": \" facts \", \"progress\": \"halfway\"}"));
        let summarizer = Summarizer::new(generator.clone(), "test-model");

        let attempt = summarizer.summarize_batch("old", "", &[event()]).await;
        let update = attempt.result.unwrap();
        assert_eq!(update.summary, "facts");
        assert_eq!(update.progress, "halfway");
        assert!(attempt.response.contains("halfway"));
        assert_eq!(generator.prompts.lock().unwrap().as_slice(), [attempt.prompt]);
    }

    #[tokio::test]
    async fn malformed_and_unavailable_are_errors() {
        let summarizer = Summarizer::new(canned(Ok("not json")), "m");
        let attempt = summarizer.summarize_batch("old", "", &[event()]).await;
        assert_eq!(attempt.response, "not json");
        let err = attempt.result.unwrap_err();
        assert!(matches!(err, SummaryError::Malformed(_)));
        assert_eq!(err.kind(), ErrorKind::SummaryGeneration);

        let summarizer = Summarizer::new(canned(Err(())), "m");
        let attempt = summarizer.summarize_batch("old", "", &[event()]).await;
        assert!(attempt.response.is_empty());
        assert!(matches!(attempt.result, Err(SummaryError::Generation(_))));

        let summarizer = Summarizer::new(canned(Ok("{\"summary\":\"\",\"progress\":\"x\"}")), "m");
        let attempt = summarizer.summarize_batch("old", "", &[event()]).await;
        assert!(matches!(attempt.result, Err(SummaryError::EmptySummary)));

        let attempt = summarizer.summarize_batch("old", "", &[]).await;
        assert!(attempt.prompt.is_empty());
        assert!(matches!(attempt.result, Err(SummaryError::NoEvents)));
    }

    #[tokio::test]
    async fn batch_uses_one_call() {
        let generator = canned(Ok("{\"summary\":\"s\",\"progress\":\"p\"}"));
        let summarizer = Summarizer::new(generator.clone(), "m");

        summarizer
            .summarize_batch("old", "", &[event(), event(), event()])
            .await
            .result
            .unwrap();
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("EVENT 3:"));
    }
}
