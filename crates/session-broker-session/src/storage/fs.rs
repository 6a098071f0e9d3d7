//! Filesystem session storage.
//!
//! Layout under the storage root:
//!
//! ```text
//! sessions/<id>/session.json   current record, replaced atomically
//! sessions/<id>/events.jsonl   append-only event log
//! sessions/<id>/errors.jsonl   summary failures
//! sessions/<id>/llm.jsonl      text generation calls
//! deleted/<id>/...             soft-deleted sessions
//! ```
//!
//! The lifecycle field in `session.json` is authoritative. Moving a deleted
//! session's directory into `deleted/` happens after the record is marked and
//! is best-effort; a record that says `Deleted` is treated as deleted wherever
//! it sits.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use session_broker_core::{
    BrokerConfig, Diagnostic, DiagnosticLog, Event, EventLog,
    fs::atomic_write,
    traits::{Lifecycle, Session, SessionFilter, SessionId, SessionStorage, StorageError},
};

const RECORD_FILE: &str = "session.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Storage backed by a directory tree of JSON records and JSONL event logs.
#[derive(Debug, Clone)]
pub struct FsStorage {
    sessions_dir: PathBuf,
    deleted_dir: PathBuf,
}

impl FsStorage {
    /// Open (creating if needed) storage rooted at `root`.
    ///
    /// # Errors
    /// Returns error if the directory tree cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        Self::open_dirs(root.join("sessions"), root.join("deleted")).await
    }

    /// Open storage at the locations named by the configuration.
    ///
    /// # Errors
    /// Returns error if the directory tree cannot be created.
    pub async fn from_config(config: &BrokerConfig) -> Result<Self, StorageError> {
        Self::open_dirs(config.sessions_dir(), config.deleted_dir()).await
    }

    async fn open_dirs(sessions_dir: PathBuf, deleted_dir: PathBuf) -> Result<Self, StorageError> {
        for dir in [&sessions_dir, &deleted_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io("creating storage directory", dir, e))?;
        }
        tracing::debug!(sessions = %sessions_dir.display(), "Opened session storage");
        Ok(Self {
            sessions_dir,
            deleted_dir,
        })
    }

    fn session_dir(&self, id: SessionId) -> PathBuf {
        self.sessions_dir.join(id.to_string())
    }

    fn record_path(&self, id: SessionId) -> PathBuf {
        self.session_dir(id).join(RECORD_FILE)
    }

    fn event_log(&self, id: SessionId) -> EventLog {
        EventLog::new(self.session_dir(id).join(EVENTS_FILE))
    }

    fn diagnostic_log(&self, id: SessionId, log: DiagnosticLog) -> EventLog<Diagnostic> {
        EventLog::new(self.session_dir(id).join(log.file_name()))
    }

    async fn read_live(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        let path = self.record_path(id);
        Ok(read_record(&path).await?.filter(|s| !s.is_deleted()))
    }

    async fn write_record(&self, session: &Session) -> Result<(), StorageError> {
        let path = self.record_path(session.id);
        let bytes = serde_json::to_vec_pretty(session).map_err(|source| StorageError::Corrupt {
            path: path.clone(),
            source,
        })?;
        blocking({
            let path = path.clone();
            move || atomic_write(&path, &bytes)
        })
        .await?
        .map_err(|e| StorageError::io("writing session record", &path, e))
    }
}

async fn blocking<F, T>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("storage task failed: {e}")))
}

async fn read_record(path: &Path) -> Result<Option<Session>, StorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io("reading session record", path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StorageError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

async fn scan(dir: &Path, sessions: &mut Vec<Session>) -> Result<(), StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StorageError::io("listing sessions", dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io("listing sessions", dir, e))?
    {
        let path = entry.path().join(RECORD_FILE);
        match read_record(&path).await {
            Ok(Some(session)) => sessions.push(session),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
        }
    }
    Ok(())
}

#[async_trait]
impl SessionStorage for FsStorage {
    async fn insert(&self, session: &Session) -> Result<(), StorageError> {
        let dir = self.session_dir(session.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io("creating session directory", &dir, e))?;
        self.write_record(session).await
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        self.read_live(id).await
    }

    async fn update(&self, session: &Session) -> Result<(), StorageError> {
        if self.read_live(session.id).await?.is_none() {
            return Err(StorageError::NotFound(session.id));
        }
        self.write_record(session).await
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        let mut sessions = Vec::new();
        scan(&self.sessions_dir, &mut sessions).await?;
        if filter.include_deleted {
            scan(&self.deleted_dir, &mut sessions).await?;
        }

        let mut result: Vec<Session> = sessions.into_iter().filter(|s| filter.matches(s)).collect();
        result.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn mark_deleted(&self, id: SessionId, deleted_at: i64) -> Result<Session, StorageError> {
        let mut session = self.read_live(id).await?.ok_or(StorageError::NotFound(id))?;
        session.lifecycle = Lifecycle::Deleted { deleted_at };
        session.updated_at = deleted_at;
        self.write_record(&session).await?;

        let from = self.session_dir(id);
        let to = self.deleted_dir.join(id.to_string());
        if let Err(e) = tokio::fs::rename(&from, &to).await {
            tracing::warn!(
                session_id = %id,
                from = %from.display(),
                to = %to.display(),
                error = %e,
                "Deleted session left in place"
            );
        }
        Ok(session)
    }

    async fn append_event(&self, id: SessionId, event: &Event) -> Result<(), StorageError> {
        if self.read_live(id).await?.is_none() {
            return Err(StorageError::NotFound(id));
        }
        let log = self.event_log(id);
        let event = event.clone();
        blocking(move || log.append(&event)).await??;
        Ok(())
    }

    async fn events(&self, id: SessionId) -> Result<Vec<Event>, StorageError> {
        if self.read_live(id).await?.is_none() {
            return Err(StorageError::NotFound(id));
        }
        let log = self.event_log(id);
        Ok(blocking(move || log.replay()).await??)
    }

    async fn append_diagnostic(
        &self,
        id: SessionId,
        record: &Diagnostic,
    ) -> Result<(), StorageError> {
        if self.read_live(id).await?.is_none() {
            return Err(StorageError::NotFound(id));
        }
        let log = self.diagnostic_log(id, record.log());
        let record = record.clone();
        blocking(move || log.append(&record)).await??;
        Ok(())
    }

    async fn diagnostics(
        &self,
        id: SessionId,
        log: DiagnosticLog,
    ) -> Result<Vec<Diagnostic>, StorageError> {
        if self.read_live(id).await?.is_none() {
            return Err(StorageError::NotFound(id));
        }
        let log = self.diagnostic_log(id, log);
        Ok(blocking(move || log.replay()).await??)
    }
}
