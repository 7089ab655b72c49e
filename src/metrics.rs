//! Performance metrics for the query front end
//!
//! Lightweight, thread-safe counters collected per process (not per
//! session):
//! - Statement latencies with percentile calculations (p50, p95, p99)
//! - Slow statement detection
//! - Per-statement-kind counts and average latencies
//! - Watchdog timeouts, kill notifications and cancellation failures
//!
//! All counters are atomics; the latency and slow-statement windows are
//! bounded `VecDeque`s behind a mutex.
//!
//! # Example
//!
//! ```no_run
//! use sqlfront::metrics::{Metrics, StatementKind};
//!
//! let metrics = Metrics::new();
//! metrics.record_statement(StatementKind::Query, 15);
//!
//! let stats = metrics.snapshot();
//! println!("p50: {}ms", stats.statement_p50_ms);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Rolling window of statement latencies kept for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Only the most recent slow statements are kept.
const MAX_SLOW_STATEMENTS: usize = 10;

/// Statements taking at least this long are recorded as slow.
pub const SLOW_STATEMENT_THRESHOLD_MS: u64 = 1000;

/// Kind of client statement, for per-kind counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Submitted to the execution engine
    Query,
    /// `CACHE TABLE`
    Cache,
    /// `UNCACHE TABLE`
    Uncache,
    /// `SET`
    Set,
    /// Read of a cached table
    Scan,
}

impl StatementKind {
    const ALL: [StatementKind; 5] = [
        StatementKind::Query,
        StatementKind::Cache,
        StatementKind::Uncache,
        StatementKind::Set,
        StatementKind::Scan,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Query => "Query",
            StatementKind::Cache => "Cache",
            StatementKind::Uncache => "Uncache",
            StatementKind::Set => "Set",
            StatementKind::Scan => "Scan",
        }
    }
}

/// Thread-safe metrics collector. One per process, shared via `Arc`.
pub struct Metrics {
    statement_count: AtomicU64,
    slow_statement_count: AtomicU64,
    failed_statement_count: AtomicU64,

    latencies_ms: Mutex<VecDeque<u64>>,
    latency_sum_ms: AtomicU64,

    kind_counts: [AtomicU64; 5],
    kind_latency_sums: [AtomicU64; 5],

    timeout_count: AtomicU64,
    kill_count: AtomicU64,
    /// Sum of directive-to-kill latencies (ms)
    kill_latency_sum_ms: AtomicU64,
    last_kill_latency_ms: AtomicU64,
    cancel_failure_count: AtomicU64,

    slow_statements: Mutex<VecDeque<SlowStatement>>,

    started_at: Instant,
}

/// A recorded slow statement
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowStatement {
    pub kind: String,
    pub duration_ms: u64,
    /// ms since metrics started
    pub timestamp_ms: u64,
}

/// Statistics for one statement kind
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStat {
    pub kind: String,
    pub count: u64,
    pub avg_ms: u64,
}

/// Point-in-time copy of all metrics
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub statement_count: u64,
    pub slow_statement_count: u64,
    pub failed_statement_count: u64,
    pub statement_p50_ms: u64,
    pub statement_p95_ms: u64,
    pub statement_p99_ms: u64,
    pub statement_avg_ms: u64,

    pub timeout_count: u64,
    pub kill_count: u64,
    pub kill_avg_latency_ms: u64,
    pub last_kill_latency_ms: u64,
    pub cancel_failure_count: u64,

    pub top_slow_statements: Vec<SlowStatement>,
    pub kind_stats: Vec<KindStat>,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            statement_count: AtomicU64::new(0),
            slow_statement_count: AtomicU64::new(0),
            failed_statement_count: AtomicU64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            latency_sum_ms: AtomicU64::new(0),
            kind_counts: Default::default(),
            kind_latency_sums: Default::default(),
            timeout_count: AtomicU64::new(0),
            kill_count: AtomicU64::new(0),
            kill_latency_sum_ms: AtomicU64::new(0),
            last_kill_latency_ms: AtomicU64::new(0),
            cancel_failure_count: AtomicU64::new(0),
            slow_statements: Mutex::new(VecDeque::with_capacity(MAX_SLOW_STATEMENTS)),
            started_at: Instant::now(),
        }
    }

    /// Record a successful statement. Failures go through `record_failure`.
    ///
    /// O(1) amortized: atomic increments plus bounded deque operations.
    pub fn record_statement(&self, kind: StatementKind, duration_ms: u64) {
        self.statement_count.fetch_add(1, Ordering::Relaxed);
        self.kind_counts[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.kind_latency_sums[kind.index()].fetch_add(duration_ms, Ordering::Relaxed);

        {
            let mut latencies = self.latencies_ms.lock().unwrap();
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                if let Some(old) = latencies.pop_front() {
                    self.latency_sum_ms.fetch_sub(old, Ordering::Relaxed);
                }
            }
            latencies.push_back(duration_ms);
            self.latency_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        }

        if duration_ms >= SLOW_STATEMENT_THRESHOLD_MS {
            self.slow_statement_count.fetch_add(1, Ordering::Relaxed);

            let slow = SlowStatement {
                kind: kind.as_str().to_string(),
                duration_ms,
                timestamp_ms: self.started_at.elapsed().as_millis() as u64,
            };

            let mut slow_statements = self.slow_statements.lock().unwrap();
            if slow_statements.len() >= MAX_SLOW_STATEMENTS {
                slow_statements.pop_front();
            }
            slow_statements.push_back(slow);
        }
    }

    pub fn record_failure(&self) {
        self.failed_statement_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a kill notification. `latency_ms` is measured from the
    /// cancellation directive, when one was issued.
    pub fn record_kill(&self, latency_ms: Option<u64>) {
        self.kill_count.fetch_add(1, Ordering::Relaxed);
        if let Some(ms) = latency_ms {
            self.kill_latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
            self.last_kill_latency_ms.store(ms, Ordering::Relaxed);
        }
    }

    pub fn record_cancel_failure(&self) {
        self.cancel_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// O(LATENCY_WINDOW_SIZE) for the percentile sort.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99, avg) = {
            let latencies = self.latencies_ms.lock().unwrap();
            if latencies.is_empty() {
                (0, 0, 0, 0)
            } else {
                let mut sorted: Vec<u64> = latencies.iter().copied().collect();
                sorted.sort_unstable();

                let len = sorted.len();
                let p50 = sorted[len * 50 / 100];
                let p95 = sorted[len * 95 / 100];
                let p99 = sorted.get(len * 99 / 100).copied().unwrap_or(sorted[len - 1]);
                let avg = self.latency_sum_ms.load(Ordering::Relaxed) / len as u64;

                (p50, p95, p99, avg)
            }
        };

        let kill_count = self.kill_count.load(Ordering::Relaxed);
        let kill_avg = if kill_count > 0 {
            self.kill_latency_sum_ms.load(Ordering::Relaxed) / kill_count
        } else {
            0
        };

        let top_slow = self.slow_statements.lock().unwrap().iter().cloned().collect();

        MetricsSnapshot {
            statement_count: self.statement_count.load(Ordering::Relaxed),
            slow_statement_count: self.slow_statement_count.load(Ordering::Relaxed),
            failed_statement_count: self.failed_statement_count.load(Ordering::Relaxed),
            statement_p50_ms: p50,
            statement_p95_ms: p95,
            statement_p99_ms: p99,
            statement_avg_ms: avg,
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            kill_count,
            kill_avg_latency_ms: kill_avg,
            last_kill_latency_ms: self.last_kill_latency_ms.load(Ordering::Relaxed),
            cancel_failure_count: self.cancel_failure_count.load(Ordering::Relaxed),
            top_slow_statements: top_slow,
            kind_stats: self.kind_stats(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Kinds seen so far, most frequent first
    fn kind_stats(&self) -> Vec<KindStat> {
        let mut stats: Vec<KindStat> = StatementKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.kind_counts[kind.index()].load(Ordering::Relaxed);
                if count == 0 {
                    return None;
                }
                let sum = self.kind_latency_sums[kind.index()].load(Ordering::Relaxed);
                Some(KindStat {
                    kind: kind.as_str().to_string(),
                    count,
                    avg_ms: sum / count,
                })
            })
            .collect();

        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_new() {
        let snap = Metrics::new().snapshot();

        assert_eq!(snap.statement_count, 0);
        assert_eq!(snap.slow_statement_count, 0);
        assert_eq!(snap.timeout_count, 0);
        assert_eq!(snap.statement_p50_ms, 0);
        assert!(snap.top_slow_statements.is_empty());
        assert!(snap.kind_stats.is_empty());
    }

    #[test]
    fn test_record_statement_counts_by_kind() {
        let m = Metrics::new();
        m.record_statement(StatementKind::Query, 10);
        m.record_statement(StatementKind::Query, 30);
        m.record_statement(StatementKind::Set, 1);

        let snap = m.snapshot();
        assert_eq!(snap.statement_count, 3);
        assert_eq!(snap.kind_stats[0].kind, "Query");
        assert_eq!(snap.kind_stats[0].count, 2);
        assert_eq!(snap.kind_stats[0].avg_ms, 20);
        assert_eq!(snap.kind_stats[1].kind, "Set");
    }

    #[test]
    fn test_slow_statement_tracking() {
        let m = Metrics::new();
        m.record_statement(StatementKind::Query, SLOW_STATEMENT_THRESHOLD_MS - 1);
        assert_eq!(m.snapshot().slow_statement_count, 0);

        m.record_statement(StatementKind::Query, SLOW_STATEMENT_THRESHOLD_MS);
        let snap = m.snapshot();
        assert_eq!(snap.slow_statement_count, 1);
        assert_eq!(snap.top_slow_statements[0].duration_ms, SLOW_STATEMENT_THRESHOLD_MS);
    }

    #[test]
    fn test_slow_statement_buffer_is_bounded() {
        let m = Metrics::new();
        for i in 0..(MAX_SLOW_STATEMENTS as u64 + 5) {
            m.record_statement(StatementKind::Query, SLOW_STATEMENT_THRESHOLD_MS + i);
        }

        let snap = m.snapshot();
        assert_eq!(snap.top_slow_statements.len(), MAX_SLOW_STATEMENTS);
        assert_eq!(snap.top_slow_statements[0].duration_ms, SLOW_STATEMENT_THRESHOLD_MS + 5);
    }

    #[test]
    fn test_percentiles() {
        let m = Metrics::new();
        for i in 1..=100 {
            m.record_statement(StatementKind::Query, i);
        }

        let snap = m.snapshot();
        assert_eq!(snap.statement_p50_ms, 51);
        assert_eq!(snap.statement_p95_ms, 96);
        assert_eq!(snap.statement_p99_ms, 100);
        assert_eq!(snap.statement_avg_ms, 50);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let m = Metrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_statement(StatementKind::Query, 1000);
        }
        for _ in 0..LATENCY_WINDOW_SIZE {
            m.record_statement(StatementKind::Query, 1);
        }

        assert_eq!(m.snapshot().statement_avg_ms, 1);
    }

    #[test]
    fn test_kill_latency() {
        let m = Metrics::new();
        m.record_timeout();
        m.record_kill(Some(100));
        m.record_kill(Some(300));
        m.record_cancel_failure();

        let snap = m.snapshot();
        assert_eq!(snap.timeout_count, 1);
        assert_eq!(snap.kill_count, 2);
        assert_eq!(snap.kill_avg_latency_ms, 200);
        assert_eq!(snap.last_kill_latency_ms, 300);
        assert_eq!(snap.cancel_failure_count, 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_statement(StatementKind::Scan, 2);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().statement_count, 800);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = Metrics::new();
        m.record_statement(StatementKind::Cache, 5);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"statementCount\":1"));
        assert!(json.contains("\"kindStats\""));
    }
}
