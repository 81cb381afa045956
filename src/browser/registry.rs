//! Live browser sessions.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::browser::session::BrowserSession;
use crate::observability::metrics;

/// Open browser sessions by id, owned by the relay instance.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Arc<dyn BrowserSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<dyn BrowserSession>) {
        let id = session.id();
        self.sessions.insert(id, session);
        metrics::record_browser_sessions(self.sessions.len());
        tracing::info!(session_id = %id, open_sessions = self.sessions.len(), "Browser session opened");
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<dyn BrowserSession>> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            metrics::record_browser_sessions(self.sessions.len());
            tracing::info!(session_id = %id, open_sessions = self.sessions.len(), "Browser session closed");
        }
        removed
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<dyn BrowserSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every session's transport to close. Entries leave as transports finish.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        tracing::info!(count = sessions.len(), "Closing browser sessions");
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::session::ChannelSession;

    #[tokio::test]
    async fn tracks_and_closes_sessions() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = ChannelSession::new();
        let (b, _rx_b) = ChannelSession::new();
        registry.insert(a.clone());
        registry.insert(b.clone());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a.id()).is_some());

        registry.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());

        assert!(registry.remove(&a.id()).is_some());
        assert!(registry.remove(&a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }
}
