//! Rotating pool of crawl sessions.
//!
//! The pool owns every [`Session`]; crawler tasks borrow one per request
//! through a [`SessionHandle`] and report the outcome back. Worn-out
//! sessions are removed lazily when encountered and their ids are
//! broadcast so the browser pool can retire instances bound to them.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::session::{Cookie, Session};
use crate::config::SessionPoolConfig;
use crate::storage::KeyValueStore;
use crate::storage::kv::{get_json, set_json};

/// Factory for new sessions; the default builds a plain [`Session`] from
/// the pool configuration. Callers override it to bind proxies or seed
/// cookies.
pub type CreateSessionFn = Arc<dyn Fn(&SessionPoolConfig) -> Session + Send + Sync>;

/// Persisted snapshot of the live pool.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolState {
    pub sessions: Vec<Session>,
    pub persisted_at: DateTime<Utc>,
}

/// Pool of reputation-tracked sessions.
pub struct SessionPool {
    config: SessionPoolConfig,
    sessions: Mutex<Vec<Session>>,
    create_session_fn: CreateSessionFn,
    store: Option<Arc<dyn KeyValueStore>>,
    retirement_tx: broadcast::Sender<String>,
}

impl SessionPool {
    pub fn new(
        config: SessionPoolConfig,
        create_session_fn: Option<CreateSessionFn>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let create_session_fn =
            create_session_fn.unwrap_or_else(|| Arc::new(|config: &SessionPoolConfig| Session::new(config)));
        let (retirement_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            config,
            sessions: Mutex::new(Vec::new()),
            create_session_fn,
            store,
            retirement_tx,
        }))
    }

    /// Restore persisted sessions, dropping ones no longer usable.
    pub async fn initialize(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if let Some(state) =
            get_json::<SessionPoolState>(store.as_ref(), &self.config.persist_state_key).await?
        {
            let total = state.sessions.len();
            let mut usable: Vec<Session> =
                state.sessions.into_iter().filter(Session::is_usable).collect();
            usable.truncate(self.config.max_pool_size);
            info!(
                restored = usable.len(),
                discarded = total - usable.len(),
                "session pool state restored"
            );
            *self.sessions.lock().await = usable;
        }
        Ok(())
    }

    /// Borrow a session: a fresh one while the pool is below target, a
    /// uniformly random usable one otherwise.
    pub async fn session(self: &Arc<Self>) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;

        // Lazy removal of sessions that wore out since last touched
        let mut retired_ids = Vec::new();
        sessions.retain(|s| {
            if s.is_usable() {
                true
            } else {
                retired_ids.push(s.id.clone());
                false
            }
        });
        for id in retired_ids {
            debug!(session = %id, "removing unusable session from pool");
            let _ = self.retirement_tx.send(id);
        }

        let session = if sessions.len() < self.config.max_pool_size {
            let session = (self.create_session_fn)(&self.config);
            debug!(session = %session.id, "created new session");
            sessions.push(session.clone());
            session
        } else {
            let index = rand::rng().random_range(0..sessions.len());
            sessions[index].clone()
        };

        SessionHandle {
            snapshot: session,
            pool: Arc::clone(self),
        }
    }

    /// Number of usable sessions currently pooled.
    pub async fn usable_session_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|s| s.is_usable())
            .count()
    }

    /// Ids of sessions retired by the pool, for the browser pool to act on.
    #[must_use]
    pub fn subscribe_retirements(&self) -> broadcast::Receiver<String> {
        self.retirement_tx.subscribe()
    }

    /// Snapshot live sessions into the key-value collaborator.
    pub async fn persist_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = SessionPoolState {
            sessions: self.sessions.lock().await.clone(),
            persisted_at: Utc::now(),
        };
        set_json(store.as_ref(), &self.config.persist_state_key, &snapshot)
            .await
            .context("failed to persist session pool state")?;
        debug!(
            sessions = snapshot.sessions.len(),
            "session pool state persisted"
        );
        Ok(())
    }

    async fn with_session<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock().await;
        let index = sessions.iter().position(|s| s.id == id)?;
        let result = mutate(&mut sessions[index]);
        if !sessions[index].is_usable() {
            let id = sessions[index].id.clone();
            sessions.remove(index);
            debug!(session = %id, "session retired");
            let _ = self.retirement_tx.send(id);
        }
        Some(result)
    }
}

/// Borrowed session, valid for one request.
///
/// The handle carries an immutable snapshot for reads (proxy URL,
/// cookies); reputation updates go back through the pool so the owned
/// copy is the one that changes.
#[derive(Clone)]
pub struct SessionHandle {
    snapshot: Session,
    pool: Arc<SessionPool>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    #[must_use]
    pub fn proxy_url(&self) -> Option<&str> {
        self.snapshot.proxy_url.as_deref()
    }

    /// Cookies stored for the origin of `url` at borrow time.
    pub fn cookies_for(&self, url: &str) -> Result<&[Cookie]> {
        self.snapshot.cookies_for(url)
    }

    pub async fn mark_good(&self) {
        if self
            .pool
            .with_session(&self.snapshot.id, Session::mark_good)
            .await
            .is_none()
        {
            warn!(session = %self.snapshot.id, "mark_good on session no longer pooled");
        }
    }

    pub async fn mark_bad(&self) {
        if self
            .pool
            .with_session(&self.snapshot.id, Session::mark_bad)
            .await
            .is_none()
        {
            warn!(session = %self.snapshot.id, "mark_bad on session no longer pooled");
        }
    }

    /// Retire the session immediately (e.g. on a blocking response).
    pub async fn retire(&self) {
        self.pool
            .with_session(&self.snapshot.id, Session::retire)
            .await;
    }

    /// Store cookies for the origin of `url` on the pooled session.
    pub async fn set_cookies(&self, url: &str, cookies: Vec<Cookie>) -> Result<()> {
        let url = url.to_string();
        let outcome = self
            .pool
            .with_session(&self.snapshot.id, move |session| {
                session.set_cookies(&url, cookies)
            })
            .await;
        match outcome {
            Some(result) => result,
            None => Ok(()), // session already rotated out; cookies are moot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    fn small_pool_config() -> SessionPoolConfig {
        SessionPoolConfig {
            max_pool_size: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pool_grows_to_target_then_reuses() {
        let pool = SessionPool::new(small_pool_config(), None, None).unwrap();

        let mut ids = std::collections::HashSet::new();
        for _ in 0..3 {
            ids.insert(pool.session().await.id().to_string());
        }
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.usable_session_count().await, 3);

        // Pool is at target; the next borrow reuses an existing identity
        let reused = pool.session().await;
        assert!(ids.contains(reused.id()));
        assert_eq!(pool.usable_session_count().await, 3);
    }

    #[tokio::test]
    async fn bad_marks_retire_and_signal() {
        let pool = SessionPool::new(small_pool_config(), None, None).unwrap();
        let mut retirements = pool.subscribe_retirements();

        let handle = pool.session().await;
        for _ in 0..3 {
            handle.mark_bad().await;
        }

        assert_eq!(retirements.recv().await.unwrap(), handle.id());
        assert_eq!(pool.usable_session_count().await, 0);
    }

    #[tokio::test]
    async fn persistence_round_trip_drops_unusable() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let pool =
            SessionPool::new(small_pool_config(), None, Some(Arc::clone(&store))).unwrap();

        let good = pool.session().await;
        good.mark_good().await;
        let bad = pool.session().await;
        bad.mark_bad().await;
        bad.mark_bad().await;
        bad.mark_bad().await; // retired and removed

        pool.persist_state().await.unwrap();

        let restored =
            SessionPool::new(small_pool_config(), None, Some(Arc::clone(&store))).unwrap();
        restored.initialize().await.unwrap();
        assert_eq!(restored.usable_session_count().await, 1);
    }

    #[tokio::test]
    async fn custom_factory_binds_proxies() {
        let factory: CreateSessionFn = Arc::new(|config| {
            let mut session = Session::new(config);
            session.proxy_url = Some("http://proxy.test:8000".to_string());
            session
        });
        let pool = SessionPool::new(small_pool_config(), Some(factory), None).unwrap();
        let handle = pool.session().await;
        assert_eq!(handle.proxy_url(), Some("http://proxy.test:8000"));
    }
}
