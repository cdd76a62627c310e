//! Threshold monitor - watches the results file during a benchmark pass
//!
//! The monitor runs as its own tokio task alongside the benchmark client:
//! - Tails the results file for newly appended records
//! - Evaluates each record's latency statistics against the thresholds
//! - Raises the signal file once per violating combination
//!
//! A [`MonitorHandle`] owns the task. Stopping it triggers one final drain so
//! a record appended just before the client exited is still evaluated, and
//! dropping the handle aborts the task so it can never outlive its pass.

mod signal;
mod tail;

pub use signal::{Signal, SignalFile, SignalPayload};
pub use tail::JsonTail;

use crate::record::BenchRecord;
use crate::summary::BestRecords;
use crate::threshold::{Breach, Statistic, Thresholds};
use crate::types::Combination;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A combination whose record breached at least one threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub combination: Combination,
    pub breaches: Vec<Breach>,
}

/// What a monitor observed over its lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub records_seen: usize,
    pub violations: Vec<Violation>,
    /// Times the best-record file was rewritten
    pub best_updates: usize,
}

/// Combinations already signalled, oldest first.
///
/// Once more than `limit` are held the oldest half is forgotten, so a
/// long-running monitor may signal a very old combination again.
#[derive(Debug)]
struct SeenSet {
    set: HashSet<Combination>,
    order: VecDeque<Combination>,
    limit: usize,
}

impl SeenSet {
    fn new(limit: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Returns false if `combination` was already present.
    fn insert(&mut self, combination: Combination) -> bool {
        if !self.set.insert(combination) {
            return false;
        }
        self.order.push_back(combination);
        if self.order.len() > self.limit {
            let forget = self.order.len() / 2;
            for old in self.order.drain(..forget) {
                self.set.remove(&old);
            }
            debug!(forgotten = forget, kept = self.order.len(), "Trimmed signalled combinations");
        }
        true
    }
}

/// Default cap on remembered signalled combinations
pub const DEFAULT_SEEN_LIMIT: usize = 10_000;

/// Evaluates appended records against latency thresholds.
pub struct ThresholdMonitor {
    tail: JsonTail,
    thresholds: Thresholds,
    signal: SignalFile,
    statistic: Statistic,
    expected: Option<Combination>,
    signalled: SeenSet,
    best: Option<(BestRecords, PathBuf)>,
    report: MonitorReport,
}

impl ThresholdMonitor {
    pub fn new(
        tail: JsonTail,
        thresholds: Thresholds,
        signal: SignalFile,
        statistic: Statistic,
    ) -> Self {
        Self {
            tail,
            thresholds,
            signal,
            statistic,
            expected: None,
            signalled: SeenSet::new(DEFAULT_SEEN_LIMIT),
            best: None,
            report: MonitorReport::default(),
        }
    }

    /// Only evaluate records for this combination. Records that carry no
    /// combination keys are attributed to it.
    pub fn expecting(mut self, combination: Combination) -> Self {
        self.expected = Some(combination);
        self
    }

    /// Remember at most `limit` signalled combinations.
    pub fn with_seen_limit(mut self, limit: usize) -> Self {
        self.signalled = SeenSet::new(limit);
        self
    }

    /// Keep the highest-concurrency record within thresholds per length
    /// pair, rewriting `path` whenever it improves.
    pub fn with_best_output(mut self, records: BestRecords, path: impl Into<PathBuf>) -> Self {
        self.best = Some((records, path.into()));
        self
    }

    pub fn report(&self) -> &MonitorReport {
        &self.report
    }

    /// Evaluate everything appended since the previous poll.
    pub async fn poll_once(&mut self) -> Vec<Violation> {
        let mut violations = Vec::new();
        for record in self.tail.poll().await {
            if let Some(violation) = self.evaluate(&record).await {
                violations.push(violation);
            }
        }
        violations
    }

    async fn evaluate(&mut self, record: &BenchRecord) -> Option<Violation> {
        let combination = match (record.combination(), self.expected) {
            (Some(seen), Some(expected)) if seen != expected => {
                debug!(%seen, %expected, "Ignoring record for a different combination");
                return None;
            }
            (Some(seen), _) => seen,
            (None, Some(expected)) => expected,
            (None, None) => {
                debug!("Ignoring record without concurrency/input_len/output_len");
                return None;
            }
        };
        self.report.records_seen += 1;

        let breaches = self.thresholds.breaches(record, self.statistic);
        if breaches.is_empty() {
            debug!(%combination, "Record within thresholds");
            self.offer_best(combination, record).await;
            return None;
        }

        if !self.signalled.insert(combination) {
            debug!(%combination, "Violation already signalled for this combination");
            return None;
        }

        let payload = SignalPayload::new(combination, breaches.clone());
        match self.signal.raise(&payload).await {
            Ok(true) => info!(
                %combination,
                breaches = ?breaches.iter().map(ToString::to_string).collect::<Vec<_>>(),
                signal = %self.signal.path().display(),
                "Threshold violated; signal raised"
            ),
            Ok(false) => debug!(%combination, "Signal file already present"),
            Err(e) => warn!(
                %combination,
                signal = %self.signal.path().display(),
                error = %e,
                "Failed to write signal file"
            ),
        }

        let violation = Violation {
            combination,
            breaches,
        };
        self.report.violations.push(violation.clone());
        Some(violation)
    }

    async fn offer_best(&mut self, combination: Combination, record: &BenchRecord) {
        let Some((best, path)) = &mut self.best else {
            return;
        };
        if !best.offer(combination.pair(), combination.concurrency, record) {
            return;
        }
        match best.write(path).await {
            Ok(()) => {
                self.report.best_updates += 1;
                info!(%combination, output = %path.display(), "New best record within thresholds");
            }
            Err(e) => warn!(%combination, error = %e, "Failed to write best records"),
        }
    }

    /// Poll until `shutdown` resolves, then drain once more.
    pub async fn run_until<F>(mut self, poll_interval: Duration, shutdown: F) -> MonitorReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        self.poll_once().await;
        self.report
    }

    /// Run the monitor as a background task owned by the returned handle.
    pub fn spawn(self, poll_interval: Duration) -> MonitorHandle {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(poll_interval, async move {
            // A dropped sender also means stop
            let _ = stop_rx.await;
        }));
        MonitorHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Owned handle to a running monitor task.
pub struct MonitorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<MonitorReport>>,
}

impl MonitorHandle {
    /// Ask the monitor to finish and wait up to `timeout` for its report.
    ///
    /// On timeout the task is aborted and `None` is returned.
    pub async fn stop(mut self, timeout: Duration) -> Option<MonitorReport> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let mut task = self.task.take()?;

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "Threshold monitor task failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis(),
                    "Threshold monitor did not stop in time; aborting"
                );
                task.abort();
                None
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Dropping threshold monitor handle; aborting task");
            task.abort();
        }
    }
}
