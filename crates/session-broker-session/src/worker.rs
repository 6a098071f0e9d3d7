//! Background summary worker.
//!
//! Jobs flow through one bounded channel to one consumer task. Enqueueing
//! never blocks: when the channel is full the new job is dropped with a
//! warning. The consumer folds consecutive jobs for the same session into a
//! single summarization call, up to a token budget; a job for a different
//! session ends the batch and is handled next, so jobs are processed in the
//! order they were queued.
//!
//! Every generation call is written to the session's LLM log and every
//! abandoned update to its error log. When the model rejects a prompt as
//! longer than its context, the batch budget is lowered below the reported
//! limit, the rest of the batch goes back to the front of the queue and the
//! first event is retried on its own.

use std::{collections::VecDeque, sync::Arc};

use session_broker_core::{
    Diagnostic, Event, SessionId, SessionStorage, clock,
    traits::{GenerationError, StorageError},
};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{
    locks::SessionLocks,
    summarizer::{
        SummaryAttempt, SummaryError, SummaryUpdate, Summarizer, estimate_tokens, format_event,
    },
};

/// Generation calls made for one batch before it is given up on.
const MAX_ATTEMPTS: usize = 3;

/// One event waiting to be folded into its session's summary.
#[derive(Debug, Clone)]
pub struct SummaryJob {
    pub session_id: SessionId,
    pub event: Event,
}

/// Worker error. Logged, never surfaced to callers.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),
}

/// Producer side of the summary queue.
#[derive(Debug, Clone)]
pub struct SummaryQueue {
    tx: mpsc::Sender<SummaryJob>,
}

impl SummaryQueue {
    /// Offer a job without waiting. Returns whether it was accepted.
    pub fn enqueue(&self, job: SummaryJob) -> bool {
        let session_id = job.session_id;
        match self.tx.try_send(job) {
            Ok(()) => {
                tracing::trace!(%session_id, queue_depth = self.depth(), "Queued summary job");
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    %session_id,
                    queue_depth = self.depth(),
                    "Summary queue full, dropping job"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(%session_id, "Summary worker stopped, dropping job");
                false
            }
        }
    }

    /// Number of jobs currently waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Create a bounded summary queue.
#[must_use]
pub fn summary_channel(capacity: usize) -> (SummaryQueue, mpsc::Receiver<SummaryJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SummaryQueue { tx }, rx)
}

/// Single consumer of the summary queue.
pub struct SummaryWorker<S> {
    storage: Arc<S>,
    locks: Arc<SessionLocks>,
    summarizer: Summarizer,
    rx: mpsc::Receiver<SummaryJob>,
    token_budget: usize,
    pending: VecDeque<SummaryJob>,
}

impl<S> SummaryWorker<S>
where
    S: SessionStorage + 'static,
{
    /// Create a worker draining `rx`.
    #[must_use]
    pub fn new(
        storage: Arc<S>,
        locks: Arc<SessionLocks>,
        summarizer: Summarizer,
        rx: mpsc::Receiver<SummaryJob>,
        token_budget: usize,
    ) -> Self {
        Self {
            storage,
            locks,
            summarizer,
            rx,
            token_budget,
            pending: VecDeque::new(),
        }
    }

    /// Run on a spawned task until every queue handle is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until every producer is gone.
    pub async fn run(mut self) {
        tracing::info!("Summary worker started");
        while let Some((session_id, events)) = self.next_batch().await {
            let count = events.len();
            if let Err(e) = self.process(session_id, events).await {
                tracing::warn!(
                    %session_id,
                    events = count,
                    error = %e,
                    "Summary update failed, dropping job"
                );
                let record = Diagnostic::SummaryFailed {
                    timestamp: clock::now_precise(),
                    error: e.to_string(),
                    events: count,
                    token_budget: self.token_budget,
                };
                self.record(session_id, &record).await;
            }
        }
        tracing::info!("Summary worker stopped");
    }

    async fn next_job(&mut self) -> Option<SummaryJob> {
        match self.pending.pop_front() {
            Some(job) => Some(job),
            None => self.rx.recv().await,
        }
    }

    fn try_next_job(&mut self) -> Option<SummaryJob> {
        self.pending.pop_front().or_else(|| self.rx.try_recv().ok())
    }

    async fn next_batch(&mut self) -> Option<(SessionId, Vec<Event>)> {
        let first = self.next_job().await?;
        let session_id = first.session_id;
        let mut tokens = event_tokens(&first.event);
        let mut events = vec![first.event];

        while let Some(job) = self.try_next_job() {
            let cost = event_tokens(&job.event);
            if job.session_id != session_id || tokens + cost > self.token_budget {
                self.pending.push_front(job);
                break;
            }
            tokens += cost;
            events.push(job.event);
        }

        if events.len() > 1 {
            tracing::debug!(%session_id, events = events.len(), tokens, "Batched summary jobs");
        }
        Some((session_id, events))
    }

    async fn process(
        &mut self,
        session_id: SessionId,
        mut events: Vec<Event>,
    ) -> Result<(), WorkerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(snapshot) = self.storage.get(session_id).await? else {
                tracing::debug!(%session_id, "Session gone, skipping summary");
                return Ok(());
            };

            let outcome = self
                .summarizer
                .summarize_batch(&snapshot.summary, &snapshot.progress, &events)
                .await;
            let record = self.interaction(&outcome);
            self.record(session_id, &record).await;

            match outcome.result {
                Ok(update) => return self.apply(session_id, update).await,
                Err(SummaryError::Generation(GenerationError::ContextLength {
                    limit: Some(limit),
                    ..
                })) if attempt < MAX_ATTEMPTS => {
                    self.lower_budget(session_id, limit).await;
                    let rest = events.split_off(1);
                    for event in rest.into_iter().rev() {
                        self.pending.push_front(SummaryJob { session_id, event });
                    }
                    tracing::warn!(
                        %session_id,
                        attempt,
                        requeued = self.pending.len(),
                        "Prompt exceeded the model context, retrying with one event"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn apply(&self, session_id: SessionId, update: SummaryUpdate) -> Result<(), WorkerError> {
        let _guard = self.locks.acquire(session_id).await;
        let Some(mut session) = self.storage.get(session_id).await? else {
            tracing::debug!(%session_id, "Session deleted during summarization");
            return Ok(());
        };
        session.summary = update.summary;
        session.progress = update.progress;
        self.storage.update(&session).await?;

        tracing::debug!(%session_id, "Summary updated");
        Ok(())
    }

    /// Drop the budget to 90% of the reported context, or to 90% of the
    /// current budget when it is already below that.
    async fn lower_budget(&mut self, session_id: SessionId, context_length: usize) {
        let from = self.token_budget;
        let target = context_length * 9 / 10;
        let to = if from <= target { from * 9 / 10 } else { target }.max(1);
        self.token_budget = to;

        tracing::warn!(%session_id, context_length, from, to, "Lowered summary token budget");
        let record = Diagnostic::BudgetLowered {
            timestamp: clock::now_precise(),
            context_length: Some(context_length),
            from,
            to,
        };
        self.record(session_id, &record).await;
    }

    fn interaction(&self, outcome: &SummaryAttempt) -> Diagnostic {
        Diagnostic::LlmInteraction {
            timestamp: clock::now_precise(),
            model: self.summarizer.model().to_string(),
            prompt: outcome.prompt.clone(),
            response: outcome.response.clone(),
            error: outcome.result.as_ref().err().map(ToString::to_string),
            duration: outcome.duration.as_secs_f64(),
            prompt_length: outcome.prompt.chars().count(),
            response_length: outcome.response.chars().count(),
            token_budget: self.token_budget,
        }
    }

    async fn record(&self, session_id: SessionId, record: &Diagnostic) {
        if let Err(e) = self.storage.append_diagnostic(session_id, record).await {
            tracing::warn!(%session_id, error = %e, "Failed to write summary diagnostic");
        }
    }
}

fn event_tokens(event: &Event) -> usize {
    estimate_tokens(&format_event(0, event)).max(1)
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use session_broker_core::{
        DiagnosticLog, EventKind, OperationContext, Session,
        traits::{GenerationRequest, TextGenerator},
    };

    use super::*;
    use crate::storage::MemoryStorage;

    /// Replies with a summary naming how many events it saw. With a context
    /// limit set, any prompt holding a second event is rejected as too long.
    #[derive(Default)]
    struct Counting {
        calls: Mutex<Vec<usize>>,
        context_limit: Option<usize>,
    }

    #[async_trait]
    impl TextGenerator for Counting {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
            let events = request.prompt.matches("EVENT ").count();
            self.calls.lock().unwrap().push(events);
            match self.context_limit {
                Some(limit) if request.prompt.contains("EVENT 2:") => {
                    return Err(GenerationError::ContextLength {
                        limit: Some(limit),
                        message: format!("Reached context length of {limit} tokens"),
                    });
                }
                _ => {}
            }
            Ok(json!({ "summary": format!("saw {events}"), "progress": "ok" }).to_string())
        }
    }

    fn job(session_id: SessionId, n: usize) -> SummaryJob {
        SummaryJob {
            session_id,
            event: Event::new(
                EventKind::Learning,
                OperationContext::default(),
                json!({ "learning": n }),
                json!({ "success": true }),
            ),
        }
    }

    #[test]
    fn full_queue_drops_newest() {
        let (queue, mut rx) = summary_channel(1);
        let id = uuid::Uuid::new_v4();

        assert!(queue.enqueue(job(id, 1)));
        assert!(!queue.enqueue(job(id, 2)));
        assert_eq!(queue.depth(), 1);

        let kept = rx.try_recv().unwrap();
        assert_eq!(kept.event.inputs["learning"], 1);
    }

    #[tokio::test]
    async fn same_session_jobs_are_batched_and_others_follow() {
        let storage = Arc::new(MemoryStorage::new());
        let a = Session::new("a", "first", PathBuf::from("/tmp"));
        let b = Session::new("b", "second", PathBuf::from("/tmp"));
        storage.insert(&a).await.unwrap();
        storage.insert(&b).await.unwrap();

        let generator = Arc::new(Counting::default());
        let (queue, rx) = summary_channel(16);
        for n in 0..3 {
            queue.enqueue(job(a.id, n));
        }
        queue.enqueue(job(b.id, 9));
        drop(queue);

        let worker = SummaryWorker::new(
            Arc::clone(&storage),
            Arc::new(SessionLocks::new()),
            Summarizer::new(generator.clone(), "m"),
            rx,
            4096,
        );
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .unwrap();

        assert_eq!(*generator.calls.lock().unwrap(), vec![3, 1]);
        assert_eq!(storage.get(a.id).await.unwrap().unwrap().summary, "saw 3");
        assert_eq!(storage.get(b.id).await.unwrap().unwrap().summary, "saw 1");
    }

    #[tokio::test]
    async fn token_budget_splits_batches() {
        let storage = Arc::new(MemoryStorage::new());
        let a = Session::new("a", "first", PathBuf::from("/tmp"));
        storage.insert(&a).await.unwrap();

        let generator = Arc::new(Counting::default());
        let (queue, rx) = summary_channel(16);
        for n in 0..4 {
            queue.enqueue(job(a.id, n));
        }
        drop(queue);

        let worker = SummaryWorker::new(
            Arc::clone(&storage),
            Arc::new(SessionLocks::new()),
            Summarizer::new(generator.clone(), "m"),
            rx,
            1,
        );
        worker.run().await;

        assert_eq!(*generator.calls.lock().unwrap(), vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn context_overflow_lowers_budget_and_requeues() {
        let storage = Arc::new(MemoryStorage::new());
        let a = Session::new("a", "first", PathBuf::from("/tmp"));
        storage.insert(&a).await.unwrap();

        let generator = Arc::new(Counting {
            context_limit: Some(400),
            ..Counting::default()
        });
        let (queue, rx) = summary_channel(16);
        for n in 0..3 {
            queue.enqueue(job(a.id, n));
        }
        drop(queue);

        let worker = SummaryWorker::new(
            Arc::clone(&storage),
            Arc::new(SessionLocks::new()),
            Summarizer::new(generator.clone(), "m"),
            rx,
            4096,
        );
        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .unwrap();

        // Whole batch, first alone, remaining pair, its first alone, last.
        assert_eq!(*generator.calls.lock().unwrap(), vec![3, 1, 2, 1, 1]);
        assert_eq!(storage.get(a.id).await.unwrap().unwrap().summary, "saw 1");

        let lowered: Vec<_> = storage
            .diagnostics(a.id, DiagnosticLog::Errors)
            .await
            .unwrap()
            .into_iter()
            .map(|record| match record {
                Diagnostic::BudgetLowered { from, to, .. } => (from, to),
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        assert_eq!(lowered, [(4096, 360), (360, 324)]);

        let calls = storage
            .diagnostics(a.id, DiagnosticLog::LlmInteractions)
            .await
            .unwrap();
        assert_eq!(calls.len(), 5);
        assert!(matches!(
            &calls[0],
            Diagnostic::LlmInteraction { error: Some(_), token_budget: 4096, .. }
        ));
        assert!(matches!(
            &calls[1],
            Diagnostic::LlmInteraction { error: None, token_budget: 360, .. }
        ));
    }

    #[tokio::test]
    async fn repeated_overflow_gives_up_and_logs_the_failure() {
        let storage = Arc::new(MemoryStorage::new());
        let a = Session::new("a", "first", PathBuf::from("/tmp"));
        storage.insert(&a).await.unwrap();

        /// Rejects every prompt as too long.
        struct TooLong;

        #[async_trait]
        impl TextGenerator for TooLong {
            async fn generate(&self, _: &GenerationRequest) -> Result<String, GenerationError> {
                Err(GenerationError::ContextLength {
                    limit: Some(100),
                    message: "context length exceeded".into(),
                })
            }
        }

        let (queue, rx) = summary_channel(4);
        queue.enqueue(job(a.id, 1));
        drop(queue);

        let worker = SummaryWorker::new(
            Arc::clone(&storage),
            Arc::new(SessionLocks::new()),
            Summarizer::new(Arc::new(TooLong), "m"),
            rx,
            4096,
        );
        worker.run().await;

        let errors = storage.diagnostics(a.id, DiagnosticLog::Errors).await.unwrap();
        assert_eq!(errors.len(), MAX_ATTEMPTS);
        assert!(matches!(
            errors.last(),
            Some(Diagnostic::SummaryFailed { events: 1, token_budget: 81, .. })
        ));
        assert_eq!(
            storage
                .diagnostics(a.id, DiagnosticLog::LlmInteractions)
                .await
                .unwrap()
                .len(),
            MAX_ATTEMPTS
        );
        assert_eq!(storage.get(a.id).await.unwrap().unwrap().summary, a.summary);
    }
}
