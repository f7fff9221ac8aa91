//! Live client sessions — in-memory, TTL-swept, bulk-invalidatable.
//!
//! A session is created when a WebSocket upgrade authenticates or when a
//! client first presents a token over HTTP. Sessions die three ways: the
//! socket closes, the sweeper finds them idle past the TTL, or the owning
//! token is bulk-invalidated (passphrase rotation, device revocation).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// The combined device token or legacy access token that authenticated
    /// this session. Used for bulk invalidation; never serialized.
    pub owner_token: String,
    pub user_agent: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: Instant,
}

/// Redacted session entry — safe to send to any connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub user_agent: String,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn create(&self, owner_token: &str, user_agent: &str) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner_token: owner_token.to_string(),
            user_agent: user_agent.to_string(),
            started_at: Utc::now(),
            last_activity: Instant::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        debug!(session = %session.id, "session created");
        session
    }

    /// Returns false when the session no longer exists (expired sessions
    /// cannot be renewed).
    pub async fn update_activity(&self, id: &str) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(s) => {
                s.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn end(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drop every session owned by `token`. Returns the count removed.
    pub async fn end_sessions_for_token(&self, token: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.owner_token != token);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "sessions invalidated for token");
        }
        removed
    }

    /// Drop every session credentialed by the given device (owner tokens are
    /// combined `"<device_id>:<token>"` strings). Returns the count removed.
    pub async fn end_sessions_for_device(&self, device_id: &str) -> usize {
        let prefix = format!("{device_id}:");
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.owner_token.starts_with(&prefix));
        before - sessions.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list_all(&self) -> Vec<SessionView> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionView {
                id: s.id.clone(),
                user_agent: s.user_agent.clone(),
                started_at: s.started_at,
                idle_secs: s.last_activity.elapsed().as_secs(),
            })
            .collect()
    }

    /// Remove sessions idle past the TTL. Returns the count removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, s| s.last_activity.elapsed() <= ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "idle sessions swept");
        }
        removed
    }

    /// Background sweeper: runs every `period` until `shutdown` flips true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                    _ = crate::shutdown::triggered(shutdown.clone()) => {
                        debug!("session sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_touch_end_lifecycle() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        let s = mgr.create("tok-1", "ua").await;
        assert_eq!(mgr.active_count().await, 1);
        assert!(mgr.update_activity(&s.id).await);
        assert!(mgr.end(&s.id).await);
        assert!(!mgr.update_activity(&s.id).await);
        assert_eq!(mgr.active_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_idle_sessions() {
        let mgr = SessionManager::new(Duration::from_millis(50));
        let stale = mgr.create("tok-1", "ua").await;
        mgr.create("tok-2", "ua").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Keep the second session fresh.
        let fresh = mgr.create("tok-3", "ua").await;
        let _ = stale;

        let removed = mgr.sweep().await;
        assert_eq!(removed, 2);
        let remaining = mgr.list_all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[tokio::test]
    async fn bulk_invalidation_by_token() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        mgr.create("shared-token", "ua-a").await;
        mgr.create("shared-token", "ua-b").await;
        let other = mgr.create("other-token", "ua-c").await;

        assert_eq!(mgr.end_sessions_for_token("shared-token").await, 2);
        assert_eq!(mgr.active_count().await, 1);
        assert!(mgr.end(&other.id).await);
    }

    #[tokio::test]
    async fn list_all_is_redacted() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        mgr.create("secret-token", "ua").await;
        let json = serde_json::to_string(&mgr.list_all().await).unwrap();
        assert!(!json.contains("secret-token"));
    }
}
