//! QueryController - per-query watchdog and cancellation
//!
//! # Lifecycle
//!
//! ```text
//!            engine: Success           client sees rows
//!   RUNNING ───────────────────────► COMPLETED
//!      │     engine: Failed / Killed   client sees the engine error
//!      ├───────────────────────────► FAILED
//!      │     watchdog fires first      client sees "Query timed out"
//!      └───────────────────────────► TIMED_OUT ──► (engine: Killed, internal)
//! ```
//!
//! The calling thread waits on the query's own completion channel and a
//! `crossbeam_channel::after` deadline, whichever is ready first. Watchdogs of
//! different queries are therefore independent of one another.
//!
//! The status transition out of RUNNING happens under the record's mutex, so
//! only one of {COMPLETED, FAILED, TIMED_OUT} can ever be reached. When the
//! watchdog wins, the client is answered immediately and a
//! `CancellationDirective` is sent with the mode captured at submission; the
//! engine's kill notification arrives later and only updates bookkeeping.
//!
//! A record stays registered until the engine reports the end of its job.
//! No registry lock is held while calling into the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, RecvError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CancellationMode, QuerySettings};
use crate::engine::{
    CancellationDirective, ExecutionEngine, JobHandle, ResultSet, TaskEnd, TaskEndCallback,
};
use crate::metrics::Metrics;
use crate::session::{SessionContext, SessionId};

pub type QueryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Returned to the client when the watchdog fires
#[derive(Error, Debug)]
#[error("Query timed out")]
pub struct QueryTimedOut {
    pub timeout: Duration,
}

/// Returned when the engine killed the job for a reason other than the
/// watchdog, e.g. the owning session closed.
#[derive(Error, Debug)]
#[error("Query was cancelled")]
pub struct QueryCancelled;

#[derive(Debug, Default)]
struct QueryState {
    status: QueryStatus,
    job: Option<JobHandle>,
    /// A cancel was requested before the engine handed out a job handle
    cancel_pending: bool,
    cancel_issued_at: Option<Instant>,
    killed_at: Option<Instant>,
}

struct QueryRecord {
    id: QueryId,
    session_id: SessionId,
    sql: String,
    submitted_at: Instant,
    settings: QuerySettings,
    state: Mutex<QueryState>,
}

/// Introspection view of a tracked query
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub id: QueryId,
    pub session_id: SessionId,
    pub sql: String,
    pub status: QueryStatus,
    pub job: Option<JobHandle>,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationMode,
    pub elapsed: Duration,
}

impl QueryRecord {
    fn info(&self) -> QueryInfo {
        let state = self.state.lock().unwrap();
        QueryInfo {
            id: self.id,
            session_id: self.session_id,
            sql: self.sql.clone(),
            status: state.status,
            job: state.job.clone(),
            timeout: self.settings.timeout,
            cancellation: self.settings.cancellation,
            elapsed: self.submitted_at.elapsed(),
        }
    }
}

/// State shared with task-end callbacks running on engine threads
struct Tracker {
    queries: RwLock<HashMap<QueryId, Arc<QueryRecord>>>,
    metrics: Option<Arc<Metrics>>,
}

impl Tracker {
    fn forget(&self, id: QueryId) {
        self.queries.write().unwrap().remove(&id);
    }

    /// Bookkeeping for the engine's terminal notification
    fn on_task_end(&self, record: &QueryRecord, end: &TaskEnd) {
        let killed = matches!(end, TaskEnd::Killed);
        let (before, cancel_issued_at) = {
            let mut state = record.state.lock().unwrap();
            let before = state.status;
            if before == QueryStatus::Running {
                state.status = match end {
                    TaskEnd::Success(_) => QueryStatus::Completed,
                    TaskEnd::Failed(_) | TaskEnd::Killed => QueryStatus::Failed,
                };
            }
            if killed {
                state.killed_at = Some(Instant::now());
            }
            (before, state.cancel_issued_at)
        };

        if killed {
            let latency_ms = cancel_issued_at.map(|t| t.elapsed().as_millis() as u64);
            if let Some(m) = &self.metrics {
                m.record_kill(latency_ms);
            }
            info!(
                query = record.id,
                session = record.session_id,
                latency_ms = ?latency_ms,
                "job killed"
            );
        } else if before == QueryStatus::TimedOut {
            debug!(
                query = record.id,
                outcome = end.label(),
                "job ended after its query timed out; outcome discarded"
            );
        }

        self.forget(record.id);
    }
}

/// A query tracked by the controller but not yet submitted
pub struct PendingQuery {
    record: Arc<QueryRecord>,
    ctx: SessionContext,
}

impl PendingQuery {
    pub fn id(&self) -> QueryId {
        self.record.id
    }
}

/// Submits queries to the engine and enforces their deadlines
pub struct QueryController {
    engine: Arc<dyn ExecutionEngine>,
    tracker: Arc<Tracker>,
    next_id: AtomicU64,
}

impl QueryController {
    pub fn new(engine: Arc<dyn ExecutionEngine>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            engine,
            tracker: Arc::new(Tracker {
                queries: RwLock::new(HashMap::new()),
                metrics,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Run `sql` for the session described by `ctx`.
    ///
    /// Blocks until the engine reports a result or the session's statement
    /// timeout elapses, whichever comes first. On timeout the error is a
    /// `QueryTimedOut` and the job may still be running; it is cancelled in
    /// the mode captured in `ctx.settings`.
    pub fn execute(&self, ctx: &SessionContext, sql: &str) -> anyhow::Result<ResultSet> {
        self.run(self.register(ctx, sql))
    }

    /// Track a query as RUNNING without submitting it yet.
    ///
    /// From here on `cancel_session` sees the query; a cancel that arrives
    /// before submission is applied as soon as the engine hands out a job.
    /// The returned value must be passed to `run`.
    pub fn register(&self, ctx: &SessionContext, sql: &str) -> PendingQuery {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(QueryRecord {
            id,
            session_id: ctx.session_id,
            sql: sql.to_string(),
            submitted_at: Instant::now(),
            settings: ctx.settings,
            state: Mutex::new(QueryState::default()),
        });
        self.tracker.queries.write().unwrap().insert(id, Arc::clone(&record));
        PendingQuery { record, ctx: ctx.clone() }
    }

    /// Submit a registered query and wait for its outcome
    pub fn run(&self, query: PendingQuery) -> anyhow::Result<ResultSet> {
        let PendingQuery { record, ctx } = query;
        let id = record.id;
        let sql = record.sql.as_str();

        let (tx, rx) = bounded::<TaskEnd>(1);
        let on_end: TaskEndCallback = {
            let tracker = Arc::clone(&self.tracker);
            let record = Arc::clone(&record);
            Box::new(move |end| {
                tracker.on_task_end(&record, &end);
                // The client may already have its answer
                let _ = tx.send(end);
            })
        };

        let job = match self.engine.submit(sql, &ctx, on_end) {
            Ok(job) => job,
            Err(e) => {
                self.tracker.forget(id);
                return Err(e.context("Failed to submit query"));
            }
        };
        debug!(query = id, session = ctx.session_id, %job, "query submitted");

        let cancel_pending = {
            let mut state = record.state.lock().unwrap();
            state.job = Some(job.clone());
            state.cancel_pending
        };
        if cancel_pending {
            self.issue_cancel(CancellationDirective { job, mode: CancellationMode::Forceful });
        }

        let watchdog = match record.settings.timeout {
            Some(timeout) => after(timeout.saturating_sub(record.submitted_at.elapsed())),
            None => never(),
        };

        select! {
            recv(rx) -> end => return self.deliver(&record, end),
            recv(watchdog) -> _ => {}
        }

        match self.time_out(&record) {
            Some(timeout) => Err(QueryTimedOut { timeout }.into()),
            // The engine reached a terminal state first; its answer is on the way
            None => self.deliver(&record, rx.recv()),
        }
    }

    /// Move a running query to TIMED_OUT and cancel its job.
    ///
    /// Returns `None` if the query already left RUNNING.
    fn time_out(&self, record: &QueryRecord) -> Option<Duration> {
        let job = {
            let mut state = record.state.lock().unwrap();
            if state.status != QueryStatus::Running {
                return None;
            }
            state.status = QueryStatus::TimedOut;
            state.cancel_issued_at = Some(Instant::now());
            state.job.clone()
        };

        let timeout = record.settings.timeout.unwrap_or_default();
        if let Some(m) = &self.tracker.metrics {
            m.record_timeout();
        }
        warn!(
            query = record.id,
            session = record.session_id,
            timeout = ?timeout,
            mode = record.settings.cancellation.as_str(),
            "query timed out"
        );

        if let Some(job) = job {
            self.issue_cancel(CancellationDirective { job, mode: record.settings.cancellation });
        }
        Some(timeout)
    }

    fn deliver(
        &self,
        record: &QueryRecord,
        end: Result<TaskEnd, RecvError>,
    ) -> anyhow::Result<ResultSet> {
        match end {
            Ok(TaskEnd::Success(rows)) => Ok(rows),
            Ok(TaskEnd::Failed(cause)) => Err(cause),
            Ok(TaskEnd::Killed) => Err(QueryCancelled.into()),
            Err(RecvError) => {
                self.tracker.forget(record.id);
                Err(anyhow::anyhow!("Engine dropped query {} without reporting its end", record.id))
            }
        }
    }

    /// Send a directive to the engine. Failures are logged and counted; they
    /// never change what the client was already told.
    fn issue_cancel(&self, directive: CancellationDirective) {
        debug!(job = %directive.job, mode = directive.mode.as_str(), "issuing cancellation");
        if let Err(e) = self.engine.cancel(&directive) {
            if let Some(m) = &self.tracker.metrics {
                m.record_cancel_failure();
            }
            warn!(job = %directive.job, error = %e, "cancellation failed");
        }
    }

    /// Forcefully cancel every job of `session` that is still executing,
    /// including timed-out jobs left to finish cooperatively.
    ///
    /// Returns the number of queries affected.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let records: Vec<Arc<QueryRecord>> = self
            .tracker
            .queries
            .read()
            .unwrap()
            .values()
            .filter(|r| r.session_id == session)
            .cloned()
            .collect();

        let mut directives = Vec::new();
        let mut affected = 0;
        for record in &records {
            let mut state = record.state.lock().unwrap();
            let executing = match state.status {
                QueryStatus::Running => true,
                QueryStatus::TimedOut => state.killed_at.is_none(),
                _ => false,
            };
            if !executing {
                continue;
            }

            affected += 1;
            state.cancel_issued_at.get_or_insert_with(Instant::now);
            match &state.job {
                Some(job) => directives.push(CancellationDirective {
                    job: job.clone(),
                    mode: CancellationMode::Forceful,
                }),
                None => state.cancel_pending = true,
            }
        }

        for directive in directives {
            self.issue_cancel(directive);
        }
        affected
    }

    /// Queries whose jobs have not yet been confirmed terminated
    pub fn active_queries(&self, session: Option<SessionId>) -> Vec<QueryInfo> {
        let queries = self.tracker.queries.read().unwrap();
        let mut infos: Vec<QueryInfo> = queries
            .values()
            .filter(|r| session.map_or(true, |s| r.session_id == s))
            .map(|r| r.info())
            .collect();
        infos.sort_by_key(|q| q.id);
        infos
    }

    pub fn query_info(&self, id: QueryId) -> Option<QueryInfo> {
        self.tracker
            .queries
            .read()
            .unwrap()
            .get(&id)
            .map(|r| r.info())
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.queries.read().unwrap().len()
    }
}
