//! Process-scoped store of sessions keyed by caller-supplied identifier.
//!
//! Creation goes through `DashMap::entry`, so concurrent lookups of an unseen
//! identifier produce one session. Every lookup pushes the session's idle
//! deadline forward; a session that reaches it is stopped and evicted.

use crate::{
    config::ManagerConfig,
    session::{Session, SessionStatus},
    upstream::UpstreamConnector,
};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument};

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    config: Arc<ManagerConfig>,
    connector: Arc<dyn UpstreamConnector>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(config: Arc<ManagerConfig>, connector: Arc<dyn UpstreamConnector>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: DashMap::new(),
            config,
            connector,
            this: this.clone(),
        })
    }

    /// Returns the live session for `id`, creating an idle one if there is none.
    ///
    /// A stopped session still in the map is replaced, so callers never get a
    /// terminal handle back. Reschedules the idle eviction timer.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let session = {
            let mut entry = self
                .sessions
                .entry(id.to_string())
                .or_insert_with(|| self.new_session(id));
            if entry.status() == SessionStatus::Stopped {
                debug!(session_id = %id, "Replacing stopped session");
                *entry = self.new_session(id);
            }
            entry.value().clone()
        };
        self.schedule_eviction(&session);
        session
    }

    /// Looks a session up without creating it or counting it as activity.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Stops the session and deletes its entry. Returns whether one existed.
    pub async fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Number of sessions currently tracked, in any status.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Stops every session and empties the registry.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(sessions = ids.len(), "Stopping all sessions");
        for id in ids {
            self.remove(&id).await;
        }
    }

    fn new_session(&self, id: &str) -> Arc<Session> {
        info!(session_id = %id, "Creating session");
        Session::new(id, self.config.clone(), self.connector.clone())
    }

    fn schedule_eviction(&self, session: &Arc<Session>) {
        let registry = self.this.clone();
        let target = Arc::downgrade(session);
        let idle_timeout = self.config.idle_timeout;
        session.reschedule_idle_timer(|token| {
            tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                let (Some(registry), Some(session)) = (registry.upgrade(), target.upgrade()) else {
                    return;
                };
                if session.claim_idle_timer(token) {
                    registry.evict(&session).await;
                }
            })
        });
    }

    #[instrument(skip_all, fields(session_id = %session.id()))]
    async fn evict(&self, session: &Arc<Session>) {
        info!(idle_secs = session.idle_for().as_secs(), "Evicting idle session");
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
        session.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnector, Sent, test_config};
    use std::time::Duration;

    fn registry_with(idle: Duration) -> (Arc<SessionRegistry>, Arc<FakeConnector>) {
        let connector = FakeConnector::acking();
        let config = ManagerConfig {
            idle_timeout: idle,
            ..test_config()
        };
        (
            SessionRegistry::new(Arc::new(config), connector.clone()),
            connector,
        )
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let (registry, _) = registry_with(Duration::from_secs(60));
        let a = registry.get_or_create("alpha");
        let b = registry.get_or_create("alpha");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.count(), 1);

        registry.get_or_create("beta");
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_create_one_session() {
        let (registry, _) = registry_with(Duration::from_secs(60));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("shared") })
            })
            .collect();
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let (registry, _) = registry_with(Duration::from_secs(60));
        assert!(registry.get("ghost").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_lookup_after_stop_yields_fresh_session() {
        let (registry, _) = registry_with(Duration::from_secs(60));
        let first = registry.get_or_create("s");
        first.stop().await;

        let second = registry.get_or_create("s");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status(), SessionStatus::Idle);
        assert_eq!(first.status(), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_remove_stops_session() {
        let (registry, connector) = registry_with(Duration::from_secs(60));
        let session = registry.get_or_create("s");
        session.start().await.unwrap();

        assert!(registry.remove("s").await);
        assert!(!registry.remove("s").await);
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert_eq!(registry.count(), 0);
        assert!(connector.sent().contains(&Sent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_evicted() {
        let (registry, connector) = registry_with(Duration::from_secs(600));
        let session = registry.get_or_create("s");
        session.start().await.unwrap();
        assert_eq!(registry.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(registry.count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.count(), 0);
        assert_eq!(session.status(), SessionStatus::Stopped);
        assert!(connector.sent().contains(&Sent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pushes_eviction_back() {
        let (registry, _) = registry_with(Duration::from_secs(600));
        let session = registry.get_or_create("s");

        tokio::time::sleep(Duration::from_secs(500)).await;
        registry.get_or_create("s");
        tokio::time::sleep(Duration::from_secs(500)).await;

        assert_eq!(registry.count(), 1);
        assert_eq!(session.status(), SessionStatus::Idle);

        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, _) = registry_with(Duration::from_secs(60));
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        a.start().await.unwrap();

        registry.shutdown().await;

        assert_eq!(registry.count(), 0);
        assert_eq!(a.status(), SessionStatus::Stopped);
        assert_eq!(b.status(), SessionStatus::Stopped);
    }
}
