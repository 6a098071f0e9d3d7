//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use session_broker_core::{
    Diagnostic, DiagnosticLog, Event,
    traits::{Lifecycle, Session, SessionFilter, SessionId, SessionStorage, StorageError},
};

/// In-memory storage implementation.
///
/// Useful for tests and throwaway processes.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
    events: RwLock<HashMap<SessionId, Vec<Event>>>,
    diagnostics: RwLock<HashMap<(SessionId, DiagnosticLog), Vec<Diagnostic>>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn insert(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert(session.id, session.clone());

        self.events
            .write()
            .map_err(poisoned)?
            .entry(session.id)
            .or_default();

        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(poisoned)?
            .get(&id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn update(&self, session: &Session) -> Result<(), StorageError> {
        let mut sessions = self.sessions.write().map_err(poisoned)?;

        let stored = sessions
            .get_mut(&session.id)
            .filter(|s| !s.is_deleted())
            .ok_or(StorageError::NotFound(session.id))?;

        *stored = session.clone();

        Ok(())
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<Session>, StorageError> {
        let sessions = self.sessions.read().map_err(poisoned)?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();

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
        let mut sessions = self.sessions.write().map_err(poisoned)?;

        let session = sessions
            .get_mut(&id)
            .filter(|s| !s.is_deleted())
            .ok_or(StorageError::NotFound(id))?;

        session.lifecycle = Lifecycle::Deleted { deleted_at };
        session.updated_at = deleted_at;

        Ok(session.clone())
    }

    async fn append_event(&self, id: SessionId, event: &Event) -> Result<(), StorageError> {
        let mut events = self.events.write().map_err(poisoned)?;

        let log = events.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        log.push(event.clone());

        Ok(())
    }

    async fn events(&self, id: SessionId) -> Result<Vec<Event>, StorageError> {
        let events = self.events.read().map_err(poisoned)?;

        events.get(&id).cloned().ok_or(StorageError::NotFound(id))
    }

    async fn append_diagnostic(
        &self,
        id: SessionId,
        record: &Diagnostic,
    ) -> Result<(), StorageError> {
        if !self.events.read().map_err(poisoned)?.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }

        self.diagnostics
            .write()
            .map_err(poisoned)?
            .entry((id, record.log()))
            .or_default()
            .push(record.clone());

        Ok(())
    }

    async fn diagnostics(
        &self,
        id: SessionId,
        log: DiagnosticLog,
    ) -> Result<Vec<Diagnostic>, StorageError> {
        if !self.events.read().map_err(poisoned)?.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }

        Ok(self
            .diagnostics
            .read()
            .map_err(poisoned)?
            .get(&(id, log))
            .cloned()
            .unwrap_or_default())
    }
}
