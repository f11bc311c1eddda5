use std::sync::atomic::{AtomicBool, Ordering};

use chanmux_core::ids::SessionId;
use dashmap::DashMap;

use crate::session::{Session, SessionState};

/// Live sessions of a server, keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Refused (false) once `stop_all` has started; the
    /// caller then owns stopping it.
    pub fn insert(&self, session: Session) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let id = session.id().clone();
        self.sessions.insert(id.clone(), session);
        // stop_all may have taken its snapshot between the check and the insert.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.sessions.remove(&id);
            return false;
        }
        true
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of registered sessions currently open.
    pub fn open_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Open)
            .count()
    }

    /// Refuse further inserts, stop every session and clear the registry.
    /// Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Collect first so no shard lock is held across an await.
        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        for session in &sessions {
            session.stop().await;
        }
        if !sessions.is_empty() {
            tracing::info!(stopped = sessions.len(), "Stopped all sessions");
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::session::SessionConfig;
    use chanmux_core::JsonRouter;
    use std::sync::Arc;

    fn idle_session() -> Session {
        let (session, _errors) =
            Session::new(Arc::new(JsonRouter::new(["dp"], 4)), SessionConfig::default());
        session
    }

    #[test]
    fn insert_and_remove() {
        let registry = SessionRegistry::new();
        let a = idle_session();
        let b = idle_session();
        assert!(registry.insert(a.clone()));
        assert!(registry.insert(b.clone()));
        assert_eq!(registry.count(), 2);

        let removed = registry.remove(a.id()).unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(registry.remove(a.id()).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn stop_all_closes_open_sessions() {
        let registry = SessionRegistry::new();
        let session = idle_session();
        let (conn, peer) = MemoryConnection::pair();
        session.open(Arc::new(conn)).unwrap();
        registry.insert(session.clone());
        registry.insert(idle_session());
        assert_eq!(registry.open_count(), 1);

        assert_eq!(registry.stop_all().await, 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn inserts_after_stop_all_are_refused() {
        let registry = SessionRegistry::new();
        registry.stop_all().await;

        let late = idle_session();
        let (conn, _peer) = MemoryConnection::pair();
        late.open(Arc::new(conn)).unwrap();
        assert!(!registry.insert(late.clone()));
        assert_eq!(registry.count(), 0);
        assert_eq!(late.state(), SessionState::Open);
    }
}
