//! LocalEngine - in-process reference implementation of `ExecutionEngine`
//!
//! Each submitted job runs on its own worker thread and evaluates a
//! single-row projection (see `eval`). Cancellation follows the directive's
//! mode:
//!
//! - **Forceful**: the worker is woken out of any blocking sleep at once and
//!   the job ends as `Killed` almost immediately.
//! - **Cooperative**: nothing is interrupted. The worker notices the request
//!   at its next check-point, i.e. after the current expression finishes
//!   naturally, and then ends as `Killed`.
//!
//! Every job end is recorded as a `JobReport` so callers can observe when
//! the engine actually stopped working, independently of what the client
//! was told. Only the latest `HISTORY_LIMIT` reports and directives are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use super::eval::{evaluate, parse_select, TaskControl};
use super::{CancellationDirective, EngineError, ExecutionEngine, JobHandle, TaskEnd, TaskEndCallback};
use crate::session::SessionContext;

/// How a job ended, as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Killed,
}

/// Record of a finished job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: JobHandle,
    pub outcome: JobOutcome,
    pub started_at: Instant,
    pub ended_at: Instant,
}

/// A cancellation directive as received by the engine
#[derive(Debug, Clone)]
pub struct ReceivedDirective {
    pub directive: CancellationDirective,
    pub received_at: Instant,
}

/// Cancellation state shared between the engine and one worker thread
struct JobControl {
    cancel_requested: AtomicBool,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
}

impl JobControl {
    fn new() -> Self {
        let (interrupt_tx, interrupt_rx) = bounded(1);
        Self {
            cancel_requested: AtomicBool::new(false),
            interrupt_tx,
            interrupt_rx,
        }
    }

    fn request_cancel(&self, interrupt: bool) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if interrupt {
            // Full channel means an interrupt is already pending
            let _ = self.interrupt_tx.try_send(());
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

impl TaskControl for JobControl {
    fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        match self.interrupt_rx.recv_timeout(duration) {
            Ok(()) => Err(EngineError::Interrupted),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(duration);
                Ok(())
            }
        }
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Job reports and directives kept for observation. Older ones are dropped.
pub const HISTORY_LIMIT: usize = 1000;

/// Most recent entries plus a count of everything ever recorded
struct History<T> {
    recent: VecDeque<T>,
    total: usize,
    limit: usize,
}

impl<T: Clone> History<T> {
    fn new(limit: usize) -> Self {
        Self { recent: VecDeque::with_capacity(limit.min(HISTORY_LIMIT)), total: 0, limit }
    }

    fn push(&mut self, item: T) {
        if self.recent.len() >= self.limit {
            self.recent.pop_front();
        }
        self.recent.push_back(item);
        self.total += 1;
    }

    fn to_vec(&self) -> Vec<T> {
        self.recent.iter().cloned().collect()
    }
}

/// Thread-per-job engine
pub struct LocalEngine {
    jobs: Arc<RwLock<HashMap<JobHandle, Arc<JobControl>>>>,
    reports: Arc<(Mutex<History<JobReport>>, Condvar)>,
    directives: Mutex<History<ReceivedDirective>>,
    next_job: AtomicU64,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_LIMIT)
    }

    /// Keep at most `limit` job reports and `limit` directives
    pub fn with_history_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            reports: Arc::new((Mutex::new(History::new(limit)), Condvar::new())),
            directives: Mutex::new(History::new(limit)),
            next_job: AtomicU64::new(1),
        }
    }

    /// Number of jobs still executing
    pub fn running_jobs(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn reports(&self) -> Vec<JobReport> {
        self.reports.0.lock().unwrap().to_vec()
    }

    pub fn directives(&self) -> Vec<ReceivedDirective> {
        self.directives.lock().unwrap().to_vec()
    }

    /// Block until `job` has ended or `timeout` elapses.
    pub fn wait_for_report(&self, job: &JobHandle, timeout: Duration) -> Option<JobReport> {
        let (lock, cvar) = &*self.reports;
        let deadline = Instant::now() + timeout;
        let mut reports = lock.lock().unwrap();

        loop {
            if let Some(report) = reports.recent.iter().find(|r| &r.job == job) {
                return Some(report.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            reports = cvar.wait_timeout(reports, deadline - now).unwrap().0;
        }
    }

    /// Block until `count` jobs have ended in total, or `timeout` elapses.
    pub fn wait_for_reports(&self, count: usize, timeout: Duration) -> Vec<JobReport> {
        let (lock, cvar) = &*self.reports;
        let deadline = Instant::now() + timeout;
        let mut reports = lock.lock().unwrap();

        while reports.total < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            reports = cvar.wait_timeout(reports, deadline - now).unwrap().0;
        }
        reports.to_vec()
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine for LocalEngine {
    fn submit(
        &self,
        sql: &str,
        ctx: &SessionContext,
        on_end: TaskEndCallback,
    ) -> anyhow::Result<JobHandle> {
        let job = JobHandle(format!(
            "job-{}-s{}",
            self.next_job.fetch_add(1, Ordering::SeqCst),
            ctx.session_id
        ));
        let control = Arc::new(JobControl::new());
        self.jobs.write().unwrap().insert(job.clone(), Arc::clone(&control));

        let jobs = Arc::clone(&self.jobs);
        let reports = Arc::clone(&self.reports);
        let sql = sql.to_string();
        let worker_job = job.clone();
        let started_at = Instant::now();

        let spawned = thread::Builder::new()
            .name(format!("sqlfront-{}", job))
            .spawn(move || {
                let result = parse_select(&sql).and_then(|p| evaluate(&p, &*control));

                let end = match result {
                    _ if control.is_cancelled() => TaskEnd::Killed,
                    Ok(rows) => TaskEnd::Success(rows),
                    Err(EngineError::Interrupted) => TaskEnd::Killed,
                    Err(e) => TaskEnd::Failed(
                        anyhow::Error::new(e)
                            .context(format!("Job {} aborted due to task failure", worker_job)),
                    ),
                };
                let outcome = match &end {
                    TaskEnd::Success(_) => JobOutcome::Succeeded,
                    TaskEnd::Failed(_) => JobOutcome::Failed,
                    TaskEnd::Killed => JobOutcome::Killed,
                };
                debug!(job = %worker_job, ?outcome, "job ended");

                jobs.write().unwrap().remove(&worker_job);
                {
                    let (lock, cvar) = &*reports;
                    lock.lock().unwrap().push(JobReport {
                        job: worker_job,
                        outcome,
                        started_at,
                        ended_at: Instant::now(),
                    });
                    cvar.notify_all();
                }

                on_end(end);
            });

        if let Err(e) = spawned {
            self.jobs.write().unwrap().remove(&job);
            return Err(anyhow::Error::new(e).context("Failed to start job worker"));
        }

        Ok(job)
    }

    fn cancel(&self, directive: &CancellationDirective) -> anyhow::Result<()> {
        self.directives.lock().unwrap().push(ReceivedDirective {
            directive: directive.clone(),
            received_at: Instant::now(),
        });

        let control = self.jobs.read().unwrap().get(&directive.job).cloned();
        match control {
            Some(control) => {
                debug!(job = %directive.job, mode = directive.mode.as_str(), "cancelling job");
                control.request_cancel(directive.interrupt_on_cancel());
            }
            None => debug!(job = %directive.job, "cancel for finished or unknown job ignored"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod local_engine_tests {
    use super::*;
    use crate::config::{CancellationMode, QuerySettings};
    use crossbeam_channel::unbounded;
    use std::path::PathBuf;

    fn ctx() -> SessionContext {
        SessionContext {
            session_id: 1,
            user: "tester".to_string(),
            scratch_dir: PathBuf::from("/tmp"),
            settings: QuerySettings::default(),
        }
    }

    fn submit(engine: &LocalEngine, sql: &str) -> (JobHandle, Receiver<TaskEnd>) {
        let (tx, rx) = unbounded();
        let job = engine
            .submit(sql, &ctx(), Box::new(move |end| {
                let _ = tx.send(end);
            }))
            .unwrap();
        (job, rx)
    }

    #[test]
    fn test_success_reports_rows() {
        let engine = LocalEngine::new();
        let (job, rx) = submit(&engine, "SELECT 42 AS answer");

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            TaskEnd::Success(rs) => assert_eq!(rs.columns, vec!["answer"]),
            other => panic!("Expected success, got: {:?}", other),
        }
        let report = engine.wait_for_report(&job, Duration::from_secs(5)).unwrap();
        assert_eq!(report.outcome, JobOutcome::Succeeded);
        assert_eq!(engine.running_jobs(), 0);
    }

    #[test]
    fn test_failure_wraps_cause() {
        let engine = LocalEngine::new();
        let (_job, rx) = submit(&engine, "SELECT raise_error('disk full')");

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            TaskEnd::Failed(err) => {
                assert!(err.to_string().contains("aborted due to task failure"));
                assert!(err.chain().any(|c| c.to_string().contains("disk full")));
            }
            other => panic!("Expected failure, got: {:?}", other),
        }
    }

    #[test]
    fn test_forceful_cancel_interrupts_sleep() {
        let engine = LocalEngine::new();
        let (job, rx) = submit(&engine, "SELECT sleep(5000)");
        thread::sleep(Duration::from_millis(100));

        let issued = Instant::now();
        engine
            .cancel(&CancellationDirective { job: job.clone(), mode: CancellationMode::Forceful })
            .unwrap();

        assert!(matches!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), TaskEnd::Killed));
        let report = engine.wait_for_report(&job, Duration::from_secs(2)).unwrap();
        assert_eq!(report.outcome, JobOutcome::Killed);
        assert!(report.ended_at.duration_since(issued) < Duration::from_millis(500));
    }

    #[test]
    fn test_cooperative_cancel_waits_for_checkpoint() {
        let engine = LocalEngine::new();
        let (job, rx) = submit(&engine, "SELECT sleep(600)");
        thread::sleep(Duration::from_millis(50));

        engine
            .cancel(&CancellationDirective { job: job.clone(), mode: CancellationMode::Cooperative })
            .unwrap();

        // Still sleeping shortly after the directive
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(matches!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), TaskEnd::Killed));
        let report = engine.wait_for_report(&job, Duration::from_secs(1)).unwrap();
        assert!(report.ended_at.duration_since(report.started_at) >= Duration::from_millis(550));
    }

    #[test]
    fn test_history_is_bounded() {
        let engine = LocalEngine::with_history_limit(3);
        let jobs: Vec<JobHandle> = (0..5).map(|_| submit(&engine, "SELECT 1").0).collect();

        let reports = engine.wait_for_reports(5, Duration::from_secs(5));
        assert_eq!(reports.len(), 3);
        assert_eq!(engine.reports().len(), 3);

        for job in &jobs {
            engine
                .cancel(&CancellationDirective { job: job.clone(), mode: CancellationMode::Forceful })
                .unwrap();
        }
        let directives = engine.directives();
        assert_eq!(directives.len(), 3);
        assert_eq!(directives[2].directive.job, jobs[4]);
    }

    #[test]
    fn test_cancel_unknown_job_is_ignored() {
        let engine = LocalEngine::new();
        let directive = CancellationDirective {
            job: JobHandle("job-404".to_string()),
            mode: CancellationMode::Forceful,
        };
        assert!(engine.cancel(&directive).is_ok());
        assert_eq!(engine.directives().len(), 1);
    }
}
