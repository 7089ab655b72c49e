//! SqlFrontend - the surface exposed to client transports
//!
//! Wires the session registry, cache registry and query controller
//! together. Every statement failure is caught here and turned into a
//! `RenderedError` for the caller's transport; a failing statement never
//! affects its session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::cache::{CacheRegistry, CacheScope};
use crate::config::{FrontendConfig, SessionOptions};
use crate::controller::QueryController;
use crate::engine::{ExecutionEngine, ResultSet, Value};
use crate::error::{FrontendError, Result};
use crate::metrics::{Metrics, StatementKind};
use crate::render::{render_failure, RenderedError, Transport};
use crate::session::{Session, SessionId};
use crate::session_manager::SessionRegistry;
use crate::statement::Statement;

/// Successful statement outcome
#[derive(Debug, Clone)]
pub struct StatementResult {
    pub kind: StatementKind,
    pub rows: Arc<ResultSet>,
}

impl StatementResult {
    fn new(kind: StatementKind, rows: ResultSet) -> Self {
        Self { kind, rows: Arc::new(rows) }
    }

    fn empty(kind: StatementKind) -> Self {
        Self::new(kind, ResultSet::default())
    }
}

fn key_value_rows<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> ResultSet {
    ResultSet {
        columns: vec!["key".to_string(), "value".to_string()],
        rows: pairs
            .map(|(k, v)| vec![Value::Str(k.to_string()), Value::Str(v.to_string())])
            .collect(),
    }
}

pub struct SqlFrontend {
    sessions: Arc<SessionRegistry>,
    cache: Arc<CacheRegistry>,
    controller: Arc<QueryController>,
    metrics: Option<Arc<Metrics>>,
}

impl SqlFrontend {
    pub fn new(config: FrontendConfig, engine: Arc<dyn ExecutionEngine>) -> Self {
        let metrics = config.metrics.then(|| Arc::new(Metrics::new()));
        let cache = Arc::new(CacheRegistry::new());
        let controller = Arc::new(QueryController::new(engine, metrics.clone()));
        let sessions = Arc::new(SessionRegistry::new(
            config,
            Arc::clone(&cache),
            Arc::clone(&controller),
        ));

        Self { sessions, cache, controller, metrics }
    }

    pub fn open_session(&self, user: &str, initial_config: &BTreeMap<String, String>) -> Result<SessionId> {
        self.sessions.open(user, initial_config)
    }

    /// Idempotent; returns false if the session was not open
    pub fn close_session(&self, id: SessionId) -> bool {
        self.sessions.close(id)
    }

    /// Execute one statement on behalf of `session`.
    ///
    /// `overlay` applies option overrides to this statement only.
    pub fn execute(
        &self,
        session: SessionId,
        sql: &str,
        overlay: Option<&BTreeMap<String, String>>,
        transport: Transport,
    ) -> std::result::Result<StatementResult, RenderedError> {
        let start = Instant::now();
        let outcome = self.run_statement(session, sql, overlay);
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                if let Some(m) = &self.metrics {
                    m.record_statement(result.kind, duration_ms);
                }
                Ok(result)
            }
            Err(cause) => {
                let rendered = render_failure(&cause, transport);
                if let Some(m) = &self.metrics {
                    m.record_failure();
                }
                debug!(
                    session,
                    transport = transport.as_str(),
                    code = %rendered.code,
                    duration_ms,
                    "statement failed"
                );
                Err(rendered)
            }
        }
    }

    fn run_statement(
        &self,
        session_id: SessionId,
        sql: &str,
        overlay: Option<&BTreeMap<String, String>>,
    ) -> anyhow::Result<StatementResult> {
        let session = self.sessions.get(session_id)?;
        let statement = Statement::parse(sql)?;
        let kind = statement.kind();

        let options = match overlay {
            Some(overlay) => session.options().merged(overlay)?,
            None => session.options(),
        };

        match statement {
            Statement::SetList => Ok(StatementResult::new(kind, key_value_rows(options.iter()))),
            Statement::SetShow(key) => {
                let value = options.get(&key).unwrap_or("<undefined>");
                Ok(StatementResult::new(kind, key_value_rows(std::iter::once((key.as_str(), value)))))
            }
            Statement::SetAssign { key, value } => {
                self.sessions.set_config(session_id, &key, &value)?;
                Ok(StatementResult::new(
                    kind,
                    key_value_rows(std::iter::once((key.as_str(), value.as_str()))),
                ))
            }
            Statement::Cache { name, global, query } => {
                let scope = if global { CacheScope::Global } else { CacheScope::Session(session_id) };
                let rows = self.submit(&session, &options, &query)?;
                // A session closed mid-statement has already been evicted
                session.while_open(|| self.cache.put(&name, scope, rows))?;
                info!(session = session_id, table = %name, global, "table cached");
                Ok(StatementResult::empty(kind))
            }
            Statement::Uncache { name, global, if_exists } => {
                let evicted = if global {
                    self.cache.evict_global(&name)
                } else {
                    self.cache.evict_session_entry(session_id, &name)
                };
                match evicted {
                    Err(FrontendError::CacheEntryNotFound(_)) if if_exists => {}
                    other => other?,
                }
                Ok(StatementResult::empty(kind))
            }
            Statement::ScanCached { name, global } => {
                let rows = if global {
                    self.cache.get_global(&name)?
                } else {
                    self.cache.get(&name, session_id)?
                };
                Ok(StatementResult { kind, rows })
            }
            Statement::Query(sql) => {
                let rows = self.submit(&session, &options, &sql)?;
                Ok(StatementResult::new(kind, rows))
            }
        }
    }

    /// Run `sql` on the engine. Registration happens only while the session
    /// is open, so a concurrent close always sees the query and cancels it.
    fn submit(&self, session: &Session, options: &SessionOptions, sql: &str) -> anyhow::Result<ResultSet> {
        let pending = session.while_open(|| Ok(self.controller.register(&session.context(options), sql)))?;
        self.controller.run(pending)
    }

    /// Close every session, then drop global cached tables
    pub fn shutdown(&self) {
        let sessions = self.sessions.close_all();
        let tables = self.cache.clear();
        info!(sessions, tables, "front end shut down");
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn cache(&self) -> &CacheRegistry {
        &self.cache
    }

    pub fn controller(&self) -> &QueryController {
        &self.controller
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }
}
