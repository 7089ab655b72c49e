//! Session - Per-client state
//!
//! Each client connection owns one session that tracks its option overlay
//! and a private scratch directory. Cached tables owned by the session are
//! indexed by owner in the `CacheRegistry`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tempfile::TempDir;
use tracing::warn;

use crate::config::{QuerySettings, SessionOptions};
use crate::error::{FrontendError, Result};

/// Unique identifier for a session
pub type SessionId = u64;

/// Explicit per-call view of a session, handed to the engine.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user: String,
    pub scratch_dir: PathBuf,
    pub settings: QuerySettings,
}

/// Session state for a client connection
///
/// Created when a client connects and destroyed when it disconnects.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub created_at: SystemTime,
    /// Option overlay. The mutex serializes `SET` calls on this session.
    options: Mutex<SessionOptions>,
    /// Set once by `mark_closed`. Held while a statement registers work
    /// or writes a private cached table.
    closed: Mutex<bool>,
    /// Removed exactly once, on close
    scratch: Mutex<Option<TempDir>>,
    scratch_path: PathBuf,
}

impl Session {
    /// Create a session with its own scratch directory under `scratch_root`
    pub fn create(
        id: SessionId,
        user: &str,
        options: SessionOptions,
        scratch_root: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("sqlfront-session-{}-", id))
            .tempdir_in(scratch_root)?;
        let scratch_path = scratch.path().to_path_buf();

        Ok(Self {
            id,
            user: user.to_string(),
            created_at: SystemTime::now(),
            options: Mutex::new(options),
            closed: Mutex::new(false),
            scratch: Mutex::new(Some(scratch)),
            scratch_path,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_path
    }

    pub fn get_option(&self, key: &str) -> Option<String> {
        self.options.lock().unwrap().get(key).map(str::to_string)
    }

    pub fn set_option(&self, key: &str, value: &str) -> Result<()> {
        self.options.lock().unwrap().set(key, value)
    }

    /// Copy of the current overlay
    pub fn options(&self) -> SessionOptions {
        self.options.lock().unwrap().clone()
    }

    /// Snapshot for one statement. `settings` is captured here, so later
    /// `SET` calls never affect a statement already submitted.
    pub fn context(&self, options: &SessionOptions) -> SessionContext {
        SessionContext {
            session_id: self.id,
            user: self.user.clone(),
            scratch_dir: self.scratch_path.clone(),
            settings: options.query_settings(),
        }
    }

    /// Run `f` only if the session is still open.
    ///
    /// `mark_closed` waits for a running `f` to return, so whatever `f`
    /// registers is visible to the teardown that follows.
    pub fn while_open<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let closed = self.closed.lock().unwrap();
        if *closed {
            return Err(FrontendError::SessionNotFound(self.id));
        }
        let result = f();
        drop(closed);
        result
    }

    /// First step of teardown. Returns false if already closed.
    pub fn mark_closed(&self) -> bool {
        let mut closed = self.closed.lock().unwrap();
        !std::mem::replace(&mut *closed, true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    /// Delete the scratch directory. Only the first call does anything.
    pub fn release_scratch(&self) {
        if let Some(dir) = self.scratch.lock().unwrap().take() {
            if let Err(e) = dir.close() {
                warn!(session = self.id, error = %e, "failed to delete scratch directory");
            }
        }
    }

    pub fn has_scratch(&self) -> bool {
        self.scratch.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::config::{CancellationMode, STATEMENT_TIMEOUT_KEY};
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_session(id: SessionId, root: &Path) -> Session {
        let options = SessionOptions::with_defaults(None, CancellationMode::Cooperative);
        Session::create(id, "alice", options, root).unwrap()
    }

    #[test]
    fn test_session_new() {
        let root = tempdir().unwrap();
        let session = make_session(1, root.path());

        assert_eq!(session.id, 1);
        assert_eq!(session.user, "alice");
        assert!(session.scratch_dir().is_dir());
        assert!(session.scratch_dir().starts_with(root.path()));
        assert_eq!(session.get_option(STATEMENT_TIMEOUT_KEY).as_deref(), Some("0"));
    }

    #[test]
    fn test_scratch_unique_per_session() {
        let root = tempdir().unwrap();
        let a = make_session(1, root.path());
        let b = make_session(2, root.path());

        assert_ne!(a.scratch_dir(), b.scratch_dir());
    }

    #[test]
    fn test_release_scratch_is_idempotent() {
        let root = tempdir().unwrap();
        let session = make_session(1, root.path());
        let path = session.scratch_dir().to_path_buf();

        session.release_scratch();
        assert!(!path.exists());
        assert!(!session.has_scratch());

        session.release_scratch();
        assert!(!path.exists());
    }

    #[test]
    fn test_while_open_rejects_after_close() {
        let root = tempdir().unwrap();
        let session = make_session(4, root.path());

        assert_eq!(session.while_open(|| Ok(1)).unwrap(), 1);
        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert!(session.is_closed());

        let mut ran = false;
        let result = session.while_open(|| {
            ran = true;
            Ok(())
        });
        match result {
            Err(FrontendError::SessionNotFound(4)) => {}
            other => panic!("Expected SessionNotFound error, got: {:?}", other),
        }
        assert!(!ran);
    }

    #[test]
    fn test_context_captures_settings() {
        let root = tempdir().unwrap();
        let session = make_session(1, root.path());
        session.set_option(STATEMENT_TIMEOUT_KEY, "3").unwrap();

        let ctx = session.context(&session.options());
        session.set_option(STATEMENT_TIMEOUT_KEY, "0").unwrap();

        assert_eq!(ctx.settings.timeout, Some(Duration::from_secs(3)));
        assert_eq!(ctx.session_id, 1);
        assert_eq!(ctx.scratch_dir, session.scratch_dir());
    }
}
