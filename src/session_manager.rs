//! SessionRegistry - Thread-safe registry of live sessions
//!
//! Opening a session allocates its id, scratch directory and option overlay.
//! Closing one tears it down in a fixed order:
//!
//! 1. mark the session closed, waiting out any statement that is
//!    registering a query or writing a cached table right now
//! 2. force-cancel every job the session still has running
//! 3. evict the session's private cached tables (global ones stay)
//! 4. delete the scratch directory
//!
//! The session is unlinked from the registry before teardown starts, so a
//! second `close` of the same id finds nothing and returns quietly. No
//! registry lock is held while the controller talks to the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::info;

use crate::cache::CacheRegistry;
use crate::config::FrontendConfig;
use crate::controller::QueryController;
use crate::error::{FrontendError, Result};
use crate::session::{Session, SessionId};

/// Session information for listings
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user: String,
    pub created_at: SystemTime,
    pub cached_tables: usize,
    pub active_queries: usize,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    cache: Arc<CacheRegistry>,
    controller: Arc<QueryController>,
    config: FrontendConfig,
}

impl SessionRegistry {
    pub fn new(
        config: FrontendConfig,
        cache: Arc<CacheRegistry>,
        controller: Arc<QueryController>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cache,
            controller,
            config,
        }
    }

    /// Open a session for `user`
    ///
    /// Starts from the server defaults (unbounded timeout, cooperative
    /// cancellation unless configured otherwise), then applies
    /// `initial_config`. An invalid option rejects the whole open.
    pub fn open(&self, user: &str, initial_config: &BTreeMap<String, String>) -> Result<SessionId> {
        let options = self.config.session_defaults().merged(initial_config)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Session::create(id, user, options, &self.config.scratch_root)?;

        info!(session = id, user, scratch = ?session.scratch_dir(), "session opened");
        self.sessions.write().unwrap().insert(id, Arc::new(session));
        Ok(id)
    }

    /// Close a session. Unknown or already closed ids are a no-op.
    ///
    /// Returns true if a session was actually torn down.
    pub fn close(&self, id: SessionId) -> bool {
        let session = match self.sessions.write().unwrap().remove(&id) {
            Some(session) => session,
            None => return false,
        };

        session.mark_closed();
        let cancelled = self.controller.cancel_session(id);
        let evicted = self.cache.evict_session(id);
        session.release_scratch();

        info!(
            session = id,
            cancelled_queries = cancelled,
            evicted_tables = evicted.len(),
            "session closed"
        );
        true
    }

    /// Close every session. Used at process shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().unwrap().keys().copied().collect();
        ids.into_iter().filter(|id| self.close(*id)).count()
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(FrontendError::SessionNotFound(id))
    }

    pub fn exists(&self, id: SessionId) -> bool {
        self.sessions.read().unwrap().contains_key(&id)
    }

    pub fn get_config(&self, id: SessionId, key: &str) -> Result<Option<String>> {
        Ok(self.get(id)?.get_option(key))
    }

    /// Set an option. Applies to statements submitted afterwards only.
    pub fn set_config(&self, id: SessionId, key: &str, value: &str) -> Result<()> {
        self.get(id)?.set_option(key, value)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().unwrap().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|s| SessionInfo {
                id: s.id,
                user: s.user.clone(),
                created_at: s.created_at,
                cached_tables: self.cache.session_entries(s.id).len(),
                active_queries: self.controller.active_queries(Some(s.id)).len(),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
