//! Per-session write locks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use session_broker_core::SessionId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune dead entries once the map grows past this many sessions.
const PRUNE_THRESHOLD: usize = 128;

/// Lazily created async mutex per session.
///
/// Holders keep the lock alive; once every guard and handle is dropped the
/// entry becomes dead and is pruned on a later acquisition.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Weak<AsyncMutex<()>>>>,
}

impl SessionLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: SessionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(&id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(id, Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to one session.
    pub async fn acquire(&self, id: SessionId) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }
}
