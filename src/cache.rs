//! CacheRegistry - Thread-safe registry of cached tables
//!
//! A cached table is a materialized query result registered under a name,
//! either privately for one session or in the global namespace.
//!
//! # Architecture
//!
//! - Entries are grouped by namespace (`CacheScope`) in one `RwLock`-protected
//!   map, so every mutation is atomic with respect to readers
//! - Each session's private namespace is independent of the global one; the
//!   same name may exist in both
//! - Session entries disappear with their session (`evict_session`), global
//!   entries only through `evict_global` or `clear`
//!
//! # Usage
//!
//! ```no_run
//! use sqlfront::cache::{CacheRegistry, CacheScope};
//! use sqlfront::engine::ResultSet;
//!
//! let registry = CacheRegistry::new();
//! registry.put("daily", CacheScope::Session(1), ResultSet::default()).unwrap();
//! registry.put("shared", CacheScope::Global, ResultSet::default()).unwrap();
//!
//! // Session 2 sees the global table, not session 1's private one
//! assert!(registry.get("shared", 2).is_ok());
//! assert!(registry.get("daily", 2).is_err());
//!
//! registry.evict_session(1);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::engine::ResultSet;
use crate::error::{FrontendError, Result};
use crate::session::SessionId;

/// Namespace of a cached table. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Private to one session, evicted when it closes
    Session(SessionId),
    /// Visible to every session
    Global,
}

impl CacheScope {
    pub fn is_global(&self) -> bool {
        matches!(self, CacheScope::Global)
    }

    pub fn owner(&self) -> Option<SessionId> {
        match self {
            CacheScope::Session(id) => Some(*id),
            CacheScope::Global => None,
        }
    }
}

/// Cached table entry
#[derive(Debug)]
pub struct CacheEntry {
    pub name: String,
    pub scope: CacheScope,
    pub data: Arc<ResultSet>,
    pub created_at: SystemTime,
}

/// Cached table information for listings
#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub name: String,
    pub scope: CacheScope,
    pub row_count: usize,
}

impl From<&CacheEntry> for CacheInfo {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            name: entry.name.clone(),
            scope: entry.scope,
            row_count: entry.data.row_count(),
        }
    }
}

type Namespace = HashMap<String, Arc<CacheEntry>>;

/// CacheRegistry - manages cached tables of all sessions
pub struct CacheRegistry {
    namespaces: RwLock<HashMap<CacheScope, Namespace>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and normalize a table name
    ///
    /// Allowed characters: [a-zA-Z0-9_]
    /// Length: 1-128 characters
    /// Names are case-insensitive.
    fn normalize_name(name: &str) -> Result<String> {
        if name.is_empty() || name.len() > 128 {
            return Err(FrontendError::InvalidTableName(
                "Name must be 1-128 characters".to_string(),
            ));
        }

        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(FrontendError::InvalidTableName(
                "Name can only contain a-z, A-Z, 0-9, _".to_string(),
            ));
        }

        Ok(name.to_ascii_lowercase())
    }

    /// Register a cached table
    ///
    /// Fails with `DuplicateName` if the name already exists in `scope`'s
    /// namespace.
    pub fn put(&self, name: &str, scope: CacheScope, data: ResultSet) -> Result<()> {
        let name = Self::normalize_name(name)?;
        let mut namespaces = self.namespaces.write().unwrap();
        let namespace = namespaces.entry(scope).or_default();

        if namespace.contains_key(&name) {
            return Err(FrontendError::DuplicateName(name));
        }

        namespace.insert(
            name.clone(),
            Arc::new(CacheEntry {
                name,
                scope,
                data: Arc::new(data),
                created_at: SystemTime::now(),
            }),
        );
        Ok(())
    }

    /// Look up a table on behalf of `session`
    ///
    /// The session's own entries shadow global ones. Other sessions' private
    /// entries are never visible.
    pub fn get(&self, name: &str, session: SessionId) -> Result<Arc<ResultSet>> {
        let key = Self::normalize_name(name)?;
        let namespaces = self.namespaces.read().unwrap();

        [CacheScope::Session(session), CacheScope::Global]
            .iter()
            .find_map(|scope| namespaces.get(scope).and_then(|ns| ns.get(&key)))
            .map(|entry| Arc::clone(&entry.data))
            .ok_or_else(|| FrontendError::CacheEntryNotFound(name.to_string()))
    }

    /// Look up a table in the global namespace only
    pub fn get_global(&self, name: &str) -> Result<Arc<ResultSet>> {
        let key = Self::normalize_name(name)?;
        let namespaces = self.namespaces.read().unwrap();

        namespaces
            .get(&CacheScope::Global)
            .and_then(|ns| ns.get(&key))
            .map(|entry| Arc::clone(&entry.data))
            .ok_or_else(|| FrontendError::CacheEntryNotFound(name.to_string()))
    }

    /// Remove every private entry of `session`, returning their names
    ///
    /// Runs under one write lock: readers see either all of the session's
    /// entries or none.
    pub fn evict_session(&self, session: SessionId) -> Vec<String> {
        let removed = self
            .namespaces
            .write()
            .unwrap()
            .remove(&CacheScope::Session(session));

        let mut names: Vec<String> = removed.map(|ns| ns.into_keys().collect()).unwrap_or_default();
        names.sort();
        names
    }

    /// Remove one private entry of `session`
    pub fn evict_session_entry(&self, session: SessionId, name: &str) -> Result<()> {
        self.evict(CacheScope::Session(session), name)
    }

    /// Remove a global entry
    pub fn evict_global(&self, name: &str) -> Result<()> {
        self.evict(CacheScope::Global, name)
    }

    fn evict(&self, scope: CacheScope, name: &str) -> Result<()> {
        let key = Self::normalize_name(name)?;
        let mut namespaces = self.namespaces.write().unwrap();

        let namespace = namespaces
            .get_mut(&scope)
            .ok_or_else(|| FrontendError::CacheEntryNotFound(name.to_string()))?;
        namespace
            .remove(&key)
            .ok_or_else(|| FrontendError::CacheEntryNotFound(name.to_string()))?;

        if namespace.is_empty() {
            namespaces.remove(&scope);
        }
        Ok(())
    }

    /// Private entries of `session`
    pub fn session_entries(&self, session: SessionId) -> Vec<CacheInfo> {
        self.list_scope(CacheScope::Session(session))
    }

    pub fn global_entries(&self) -> Vec<CacheInfo> {
        self.list_scope(CacheScope::Global)
    }

    fn list_scope(&self, scope: CacheScope) -> Vec<CacheInfo> {
        let namespaces = self.namespaces.read().unwrap();
        let mut infos: Vec<CacheInfo> = namespaces
            .get(&scope)
            .map(|ns| ns.values().map(|e| CacheInfo::from(&**e)).collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// True when no session-private entry exists for any session
    pub fn is_empty_excluding_global(&self) -> bool {
        self.namespaces
            .read()
            .unwrap()
            .iter()
            .all(|(scope, ns)| scope.is_global() || ns.is_empty())
    }

    /// Total number of entries in all namespaces
    pub fn len(&self) -> usize {
        self.namespaces.read().unwrap().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything, global entries included. Process shutdown only.
    pub fn clear(&self) -> usize {
        let mut namespaces = self.namespaces.write().unwrap();
        let count = namespaces.values().map(HashMap::len).sum();
        namespaces.clear();
        count
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}
