//! Session manager for orchestrating broker sessions.
//!
//! Every mutation of a session record happens under that session's lock,
//! whether it comes from a tool call or from the summary worker. Lifecycle
//! operations that depend on name uniqueness (create, rename, delete) are
//! additionally serialized by a process-wide lifecycle lock. The active
//! session pointer sits behind its own lock.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::{Value, json};
use session_broker_core::{
    ActivityHistory, Diagnostic, DiagnosticLog, ErrorKind, Event, EventKind, HistoryEntry,
    OperationContext, Session, SessionId, SessionStorage, clock,
    config::SummaryConfig,
    history::HISTORY_CHARS,
    traits::{SessionFilter, StorageError},
};
use session_broker_executor::{
    CommandExecutor, ExecError, ReadOutcome, RunOutcome, RunRequest, WriteOutcome,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    locks::SessionLocks,
    summarizer::Summarizer,
    worker::{SummaryJob, SummaryQueue, SummaryWorker, summary_channel},
};

/// Session manager error.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("A session named '{0}' already exists")]
    DuplicateName(String),
    #[error("No active session")]
    NoActiveSession,
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl ManagerError {
    /// Caller-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(StorageError::NotFound(_)) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Internal,
            Self::Exec(e) => e.kind(),
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::NoActiveSession | Self::Invalid(_) => ErrorKind::Validation,
        }
    }
}

/// A session as listed, flagged with whether it is the active one.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub session: Session,
    pub is_active: bool,
}

/// Recent activity, structured and rendered.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub entries: Vec<HistoryEntry>,
    pub text: String,
}

impl HistoryView {
    fn from_history(history: &ActivityHistory, limit: Option<usize>) -> Self {
        let entries = limit.map_or_else(|| history.entries(), |n| history.tail(n));
        Self {
            entries,
            text: history.render(limit),
        }
    }
}

/// Everything a caller needs to resume a session.
#[derive(Debug, Clone, Serialize)]
pub struct OpenedSession {
    pub session: Session,
    pub history: HistoryView,
    pub instructions: Vec<String>,
}

/// Result of a directory change.
#[derive(Debug, Clone, Serialize)]
pub struct CdOutcome {
    pub previous_directory: PathBuf,
    pub current_directory: PathBuf,
}

/// Session manager for orchestrating broker sessions.
pub struct SessionManager<S>
where
    S: SessionStorage,
{
    storage: Arc<S>,
    executor: CommandExecutor,
    locks: Arc<SessionLocks>,
    lifecycle: Mutex<()>,
    active: RwLock<Option<SessionId>>,
    summaries: Option<SummaryQueue>,
    start_directory: Option<PathBuf>,
    history_chars: usize,
    default_timeout: Duration,
}

impl<S> SessionManager<S>
where
    S: SessionStorage + 'static,
{
    /// Create a new session manager. Summaries stay off until
    /// [`Self::enable_summaries`] is called.
    #[must_use]
    pub fn new(storage: Arc<S>, executor: CommandExecutor) -> Self {
        Self {
            storage,
            executor,
            locks: Arc::new(SessionLocks::new()),
            lifecycle: Mutex::new(()),
            active: RwLock::new(None),
            summaries: None,
            start_directory: None,
            history_chars: HISTORY_CHARS,
            default_timeout: Duration::from_secs(60),
        }
    }

    /// Directory new sessions start in. Defaults to the process directory.
    #[must_use]
    pub fn with_start_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.start_directory = Some(dir.into());
        self
    }

    /// Size cap for histories returned by `open` and `history`.
    #[must_use]
    pub const fn with_history_chars(mut self, max_chars: usize) -> Self {
        self.history_chars = max_chars;
        self
    }

    /// Timeout for `run` calls that do not give one.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Attach a summary queue and return the worker that drains it.
    ///
    /// The caller decides where the worker runs, usually via
    /// [`SummaryWorker::spawn`].
    pub fn enable_summaries(
        &mut self,
        summarizer: Summarizer,
        config: &SummaryConfig,
    ) -> SummaryWorker<S> {
        let (queue, rx) = summary_channel(config.queue_capacity);
        self.summaries = Some(queue);
        SummaryWorker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.locks),
            summarizer,
            rx,
            config.batch_token_budget,
        )
    }

    /// Shared storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Create and activate a new session.
    ///
    /// # Errors
    /// Returns `DuplicateName` if a live session already has `name`.
    pub async fn create(&self, name: &str, description: &str) -> Result<Session, ManagerError> {
        let name = validate_name(name)?;
        let _lifecycle = self.lifecycle.lock().await;

        if self.find_by_name(&name).await?.is_some() {
            return Err(ManagerError::DuplicateName(name));
        }

        let directory = match self.start_directory {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|e| StorageError::io("resolving working directory", ".", e))?,
        };

        let session = Session::new(name, description, directory);
        self.storage.insert(&session).await?;
        *self.active.write().await = Some(session.id);

        tracing::info!(session_id = %session.id, name = %session.name, "Created session");
        Ok(session)
    }

    /// Activate an existing session by id or name.
    ///
    /// # Errors
    /// Returns `NotFound` if no live session matches.
    pub async fn open(&self, id_or_name: &str) -> Result<OpenedSession, ManagerError> {
        let session = {
            let _lifecycle = self.lifecycle.lock().await;
            let session = self.resolve(id_or_name).await?;
            *self.active.write().await = Some(session.id);
            session
        };

        let events = self.storage.events(session.id).await?;
        let history = ActivityHistory::from_events(&events, self.history_chars);

        tracing::info!(session_id = %session.id, name = %session.name, "Opened session");
        Ok(OpenedSession {
            instructions: session.instructions.clone(),
            history: HistoryView::from_history(&history, None),
            session,
        })
    }

    /// The active session's id.
    ///
    /// # Errors
    /// Returns `NoActiveSession` if none is active.
    pub async fn active_id(&self) -> Result<SessionId, ManagerError> {
        self.active.read().await.ok_or(ManagerError::NoActiveSession)
    }

    /// Snapshot of the active session.
    ///
    /// # Errors
    /// Returns `NoActiveSession` if none is active.
    pub async fn current(&self) -> Result<Session, ManagerError> {
        let id = self.active_id().await?;
        match self.storage.get(id).await? {
            Some(session) => Ok(session),
            None => {
                let mut active = self.active.write().await;
                if *active == Some(id) {
                    *active = None;
                }
                Err(ManagerError::NoActiveSession)
            }
        }
    }

    /// The most recent summary update that was given up on, if any.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn last_summary_failure(
        &self,
        id: SessionId,
    ) -> Result<Option<Diagnostic>, ManagerError> {
        let errors = self.storage.diagnostics(id, DiagnosticLog::Errors).await?;
        Ok(errors
            .into_iter()
            .rev()
            .find(|record| matches!(record, Diagnostic::SummaryFailed { .. })))
    }

    /// Clear the active session. Returns the session that was active.
    pub async fn close(&self) -> Option<SessionId> {
        let previous = self.active.write().await.take();
        if let Some(id) = previous {
            tracing::info!(session_id = %id, "Closed session");
        }
        previous
    }

    /// Rename a session. The active pointer tracks ids, so it keeps
    /// following a renamed session.
    ///
    /// # Errors
    /// Returns `NotFound` or `DuplicateName`.
    pub async fn rename(&self, old: &str, new: &str) -> Result<Session, ManagerError> {
        let new = validate_name(new)?;
        let _lifecycle = self.lifecycle.lock().await;

        let target = self.resolve(old).await?;
        if target.name == new {
            return Ok(target);
        }
        if self.find_by_name(&new).await?.is_some() {
            return Err(ManagerError::DuplicateName(new));
        }

        let _guard = self.locks.acquire(target.id).await;
        let mut session = self.require(target.id).await?;
        let old_name = std::mem::replace(&mut session.name, new);
        session.touch();
        self.storage.update(&session).await?;

        tracing::info!(session_id = %session.id, from = %old_name, to = %session.name, "Renamed session");
        Ok(session)
    }

    /// Soft-delete a session by id or name.
    ///
    /// # Errors
    /// Returns `NotFound` if no live session matches.
    pub async fn delete(&self, id_or_name: &str) -> Result<Session, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let target = self.resolve(id_or_name).await?;

        let _guard = self.locks.acquire(target.id).await;
        let deleted = self.storage.mark_deleted(target.id, clock::now()).await?;

        let mut active = self.active.write().await;
        if *active == Some(deleted.id) {
            *active = None;
        }

        tracing::info!(session_id = %deleted.id, name = %deleted.name, "Deleted session");
        Ok(deleted)
    }

    /// All live sessions, most recently updated first.
    ///
    /// # Errors
    /// Returns error if storage cannot be listed.
    pub async fn list(&self) -> Result<Vec<SessionSnapshot>, ManagerError> {
        let active = *self.active.read().await;
        let sessions = self.storage.list(SessionFilter::default()).await?;
        Ok(sessions
            .into_iter()
            .map(|session| SessionSnapshot {
                is_active: Some(session.id) == active,
                session,
            })
            .collect())
    }

    /// Append an event, bump the counter, and queue a summary update.
    ///
    /// Summary queueing never fails the call.
    ///
    /// # Errors
    /// Returns error if the session is gone or the log cannot be written.
    pub async fn record_event(
        &self,
        session_id: SessionId,
        kind: EventKind,
        context: OperationContext,
        inputs: Value,
        outputs: Value,
        duration: f64,
    ) -> Result<Event, ManagerError> {
        let event = Event::new(kind, context, inputs, outputs).with_duration(duration);
        let _guard = self.locks.acquire(session_id).await;
        self.commit_locked(session_id, event.clone(), None).await?;
        Ok(event)
    }

    /// Record a request made by the user.
    ///
    /// # Errors
    /// Returns error if the session is gone or the log cannot be written.
    pub async fn record_user_request(
        &self,
        session_id: SessionId,
        request: &str,
    ) -> Result<Event, ManagerError> {
        self.record_event(
            session_id,
            EventKind::UserRequest,
            OperationContext::default(),
            json!({ "user_request": request }),
            json!({ "success": true, "error": "" }),
            0.0,
        )
        .await
    }

    /// Record something learned during the session.
    ///
    /// # Errors
    /// Returns error if the session is gone or the log cannot be written.
    pub async fn add_learning(
        &self,
        session_id: SessionId,
        context: OperationContext,
        learning: &str,
    ) -> Result<Event, ManagerError> {
        if learning.trim().is_empty() {
            return Err(ManagerError::Invalid("learning must not be empty".into()));
        }
        self.record_event(
            session_id,
            EventKind::Learning,
            context,
            json!({ "learning": learning }),
            json!({ "success": true, "error": "" }),
            0.0,
        )
        .await
    }

    /// Recent activity rebuilt from the event log.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone.
    pub async fn history(
        &self,
        session_id: SessionId,
        limit: Option<usize>,
    ) -> Result<HistoryView, ManagerError> {
        self.require(session_id).await?;
        let events = self.storage.events(session_id).await?;
        let history = ActivityHistory::from_events(&events, self.history_chars);
        Ok(HistoryView::from_history(&history, limit))
    }

    /// Append one instruction.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone.
    pub async fn add_instruction(
        &self,
        session_id: SessionId,
        instruction: &str,
    ) -> Result<Vec<String>, ManagerError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ManagerError::Invalid("instruction must not be empty".into()));
        }
        self.edit_instructions(session_id, |list| list.push(instruction.to_string()))
            .await
    }

    /// Replace the whole instruction list.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone.
    pub async fn replace_instructions(
        &self,
        session_id: SessionId,
        instructions: Vec<String>,
    ) -> Result<Vec<String>, ManagerError> {
        self.edit_instructions(session_id, move |list| *list = instructions)
            .await
    }

    /// Current instructions, in order.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone.
    pub async fn read_instructions(&self, session_id: SessionId) -> Result<Vec<String>, ManagerError> {
        Ok(self.require(session_id).await?.instructions)
    }

    async fn edit_instructions(
        &self,
        session_id: SessionId,
        edit: impl FnOnce(&mut Vec<String>),
    ) -> Result<Vec<String>, ManagerError> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.require(session_id).await?;
        edit(&mut session.instructions);
        session.touch();
        self.storage.update(&session).await?;
        Ok(session.instructions)
    }

    /// Change the session's directory.
    ///
    /// The event is recorded whether or not the change succeeds; on failure
    /// the directory is left as it was.
    ///
    /// # Errors
    /// Returns `NotFound` or `NotADirectory` from the executor.
    pub async fn cd(
        &self,
        session_id: SessionId,
        context: OperationContext,
        directory: &str,
    ) -> Result<CdOutcome, ManagerError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.require(session_id).await?;
        let previous = session.current_directory;

        let (started, timer) = (clock::now_precise(), Instant::now());
        let result = self.executor.cd(&previous, directory).await;

        let outputs = match result {
            Ok(ref dir) => json!({ "success": true, "new_directory": dir, "error": "" }),
            Err(ref e) => json!({ "success": false, "error": e.to_string() }),
        };
        let event = Event::new(
            EventKind::Cd,
            context,
            json!({ "directory": directory, "previous_directory": previous }),
            outputs,
        )
        .started_at(started)
        .with_duration(timer.elapsed().as_secs_f64());

        let new_directory = result.as_ref().ok().cloned();
        self.commit_locked(session_id, event, new_directory).await?;

        let current = result?;
        Ok(CdOutcome {
            previous_directory: previous,
            current_directory: current,
        })
    }

    /// Read a file relative to the session's directory.
    ///
    /// # Errors
    /// Returns `NotFound`, `Decode` and other executor errors.
    pub async fn read(
        &self,
        session_id: SessionId,
        context: OperationContext,
        path: &str,
    ) -> Result<ReadOutcome, ManagerError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.require(session_id).await?;

        let (started, timer) = (clock::now_precise(), Instant::now());
        let result = self.executor.read(&session.current_directory, path).await;

        let outputs = match result {
            Ok(ref read) => json!({
                "success": true,
                "absolute_path": read.path,
                "content_length": read.bytes,
                "error": "",
            }),
            Err(ref e) => json!({ "success": false, "error": e.to_string() }),
        };
        let event = Event::new(EventKind::Read, context, json!({ "file_path": path }), outputs)
            .started_at(started)
            .with_duration(timer.elapsed().as_secs_f64());
        self.commit_locked(session_id, event, None).await?;

        Ok(result?)
    }

    /// Atomically write a file relative to the session's directory.
    ///
    /// # Errors
    /// Returns `NotFound`, `PermissionDenied` and other executor errors.
    pub async fn write(
        &self,
        session_id: SessionId,
        context: OperationContext,
        path: &str,
        content: &str,
        create_dirs: bool,
    ) -> Result<WriteOutcome, ManagerError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.require(session_id).await?;

        let (started, timer) = (clock::now_precise(), Instant::now());
        let result = self
            .executor
            .write(&session.current_directory, path, content, create_dirs)
            .await;

        let outputs = match result {
            Ok(ref written) => json!({
                "success": true,
                "absolute_path": written.path,
                "created_dirs": written.created_dirs,
                "error": "",
            }),
            Err(ref e) => json!({ "success": false, "error": e.to_string() }),
        };
        let event = Event::new(
            EventKind::Write,
            context,
            json!({
                "file_path": path,
                "content_length": content.len(),
                "create_dirs": create_dirs,
            }),
            outputs,
        )
        .started_at(started)
        .with_duration(timer.elapsed().as_secs_f64());
        self.commit_locked(session_id, event, None).await?;

        Ok(result?)
    }

    /// Run a shell command in the session's directory.
    ///
    /// The command runs without holding the session lock; its event is
    /// committed afterwards. A `cd` inside the command moves the session.
    ///
    /// # Errors
    /// Returns `Timeout` if the command was killed, or other executor errors.
    /// A non-zero exit status is not an error.
    pub async fn run(
        &self,
        session_id: SessionId,
        context: OperationContext,
        command: &str,
        timeout_secs: Option<f64>,
        working_directory: Option<&str>,
    ) -> Result<RunOutcome, ManagerError> {
        if command.trim().is_empty() {
            return Err(ManagerError::Invalid("command must not be empty".into()));
        }
        let timeout = match timeout_secs {
            None => self.default_timeout,
            Some(secs) => Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| ManagerError::Invalid(format!("invalid timeout: {secs}")))?,
        };
        let mut request = RunRequest::new(command, timeout);
        if let Some(dir) = working_directory {
            request = request.in_directory(dir);
        }

        let session = self.require(session_id).await?;
        let (started, timer) = (clock::now_precise(), Instant::now());
        let result = self.executor.run(&session.current_directory, &request).await;

        let outputs = match result {
            Ok(ref outcome) => json!({
                "success": true,
                "stdout": outcome.stdout,
                "stderr": outcome.stderr,
                "exit_code": outcome.exit_code,
                "killed": false,
                "error": "",
            }),
            Err(ExecError::Timeout {
                ref stdout,
                ref stderr,
                ..
            }) => json!({
                "success": false,
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": Value::Null,
                "killed": true,
                "error": "timeout",
            }),
            Err(ref e) => json!({ "success": false, "killed": false, "error": e.to_string() }),
        };
        let event = Event::new(
            EventKind::Run,
            context,
            json!({
                "command": command,
                "timeout": timeout.as_secs_f64(),
                "working_directory": result
                    .as_ref()
                    .map_or_else(|_| session.current_directory.clone(), |o| o.working_directory.clone()),
            }),
            outputs,
        )
        .started_at(started)
        .with_duration(timer.elapsed().as_secs_f64());

        let new_directory = result.as_ref().ok().and_then(|o| o.new_directory.clone());
        {
            let _guard = self.locks.acquire(session_id).await;
            self.commit_locked(session_id, event, new_directory).await?;
        }

        Ok(result?)
    }

    /// Append `event`, update the record and queue a summary. Caller holds
    /// the session lock.
    async fn commit_locked(
        &self,
        session_id: SessionId,
        event: Event,
        new_directory: Option<PathBuf>,
    ) -> Result<Session, ManagerError> {
        let mut session = self.require(session_id).await?;
        self.storage.append_event(session_id, &event).await?;

        session.event_count += 1;
        if let Some(dir) = new_directory {
            tracing::debug!(%session_id, dir = %dir.display(), "Session directory changed");
            session.current_directory = dir;
        }
        session.touch();
        self.storage.update(&session).await?;

        tracing::debug!(%session_id, kind = %event.kind, events = session.event_count, "Recorded event");
        if let Some(ref queue) = self.summaries {
            queue.enqueue(SummaryJob { session_id, event });
        }
        Ok(session)
    }

    async fn require(&self, id: SessionId) -> Result<Session, ManagerError> {
        self.storage
            .get(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Session>, ManagerError> {
        let filter = SessionFilter {
            name: Some(name.to_string()),
            limit: Some(1),
            ..SessionFilter::default()
        };
        Ok(self.storage.list(filter).await?.into_iter().next())
    }

    async fn resolve(&self, id_or_name: &str) -> Result<Session, ManagerError> {
        let key = id_or_name.trim();
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(session) = self.storage.get(id).await? {
                return Ok(session);
            }
        }
        self.find_by_name(key)
            .await?
            .ok_or_else(|| ManagerError::NotFound(key.to_string()))
    }
}

fn validate_name(name: &str) -> Result<String, ManagerError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ManagerError::Invalid("session name must not be empty".into()));
    }
    Ok(name.to_string())
}
