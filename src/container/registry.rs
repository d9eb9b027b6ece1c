//! Live session registry

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::error::SessionError;
use super::session::SessionHandle;

#[derive(Debug, Default)]
struct Entries {
    sessions: HashMap<Uuid, SessionHandle>,
    /// Set once shutdown begins; no registration succeeds afterwards
    sealed: bool,
}

/// Sessions that have been started and not yet closed, by session ID
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<Entries>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a started session.
    ///
    /// Fails with [`SessionError::ShuttingDown`] once the registry is sealed.
    /// A second registration under the same ID is rejected and leaves the
    /// existing entry in place.
    pub async fn register(&self, session: SessionHandle) -> Result<(), SessionError> {
        let mut entries = self.entries.write().await;
        if entries.sealed {
            return Err(SessionError::ShuttingDown);
        }
        if entries.sessions.contains_key(&session.session_id) {
            return Err(SessionError::Registry(format!(
                "session {} registered twice",
                session.session_id
            )));
        }
        entries.sessions.insert(session.session_id, session);
        Ok(())
    }

    /// Refuse all further registrations and return every session registered
    /// so far. Sessions already registered stay until deregistered.
    pub async fn seal(&self) -> Vec<SessionHandle> {
        let mut entries = self.entries.write().await;
        entries.sealed = true;
        entries.sessions.values().cloned().collect()
    }

    pub async fn is_sealed(&self) -> bool {
        self.entries.read().await.sealed
    }

    /// Remove and return the entry for `id`.
    ///
    /// Returns `None` when the session was already removed; the caller that
    /// got `Some` owns the teardown.
    pub async fn deregister(&self, id: &Uuid) -> Option<SessionHandle> {
        let removed = self.entries.write().await.sessions.remove(id);
        if removed.is_none() {
            warn!(session_id = %id, "Deregistering a session that is not registered");
        }
        removed
    }

    pub async fn get(&self, id: &Uuid) -> Option<SessionHandle> {
        self.entries.read().await.sessions.get(id).cloned()
    }

    /// Visit every registered session under the read lock
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Uuid, &SessionHandle),
    {
        let entries = self.entries.read().await;
        for (id, session) in entries.sessions.iter() {
            f(id, session);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.sessions.len()
    }
}
