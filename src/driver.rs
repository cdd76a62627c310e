//! Batch driver - runs the task list and applies the escalation policy
//!
//! Each pass runs the GPU sampler and the threshold monitor alongside one
//! blocking benchmark runner invocation:
//!
//! ```text
//! clear stale signal → start sampler → start monitor → run benchmark
//!   → stop monitor (final drain) → stop sampler → merge GPU summary
//!   → consume signal → report → cool down
//! ```
//!
//! In grid mode the first violation for a length pair skips every remaining
//! concurrency level of that pair. This assumes latency only grows with
//! concurrency; a transient spike at one level will hide the levels above it.

use crate::bench::{BenchmarkRunner, RunnerExit};
use crate::config::BatchSettings;
use crate::merge::{MergeOutcome, merge_gpu_into_results};
use crate::monitor::{JsonTail, MonitorReport, Signal, SignalFile, ThresholdMonitor};
use crate::record::{BenchRecord, read_last_record};
use crate::sampler::SamplerHandle;
use crate::summary::{BatchSummary, BestRecords, PassOutcome, PassStatus};
use crate::telemetry;
use crate::threshold::Breach;
use crate::types::{BenchError, LengthPair, Task, TaskMode};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod search;

pub use search::{SearchOutcome, SearchRange, SearchStep};

/// Result of one executed (non-skipped) pass.
struct PassReport {
    outcome: PassOutcome,
    record: Option<BenchRecord>,
}

/// Runs a batch of benchmark passes.
pub struct BatchDriver<R> {
    settings: BatchSettings,
    runner: R,
    metrics: Option<PrometheusHandle>,
}

impl<R: BenchmarkRunner> BatchDriver<R> {
    pub fn new(settings: BatchSettings, runner: R) -> Self {
        Self {
            settings,
            runner,
            metrics: None,
        }
    }

    /// Write a metrics snapshot into the run directory when the batch ends.
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Run every task in order.
    ///
    /// Returns the batch summary, or the first runner failure when
    /// `continue_on_failure` is off. `summary.json` is rewritten after every
    /// pass, so a cancelled or failed batch still leaves its progress behind.
    pub async fn run(&self, tasks: &[Task]) -> Result<BatchSummary, BenchError> {
        let layout = &self.settings.layout;
        layout.create().await?;
        info!(
            run_dir = %layout.root().display(),
            tasks = tasks.len(),
            thresholds = %self.settings.thresholds,
            "Starting benchmark batch"
        );

        let signal = SignalFile::new(layout.signal_file());
        let mut summary = BatchSummary::new(
            layout.root(),
            &self.settings.model_name,
            &self.settings.thresholds,
            self.settings.monitor.statistic,
        );
        let mut best = BestRecords::default();
        let mut violated: HashSet<LengthPair> = HashSet::new();

        for (index, task) in tasks.iter().enumerate() {
            let combination = task.combination();
            let pair = task.pair();

            if skips(task, &violated) {
                info!(%combination, "Skipping: threshold already violated at a lower concurrency");
                counter!("llmbench_skipped_passes_total").increment(1);
                counter!("llmbench_passes_total", "status" => PassStatus::Skipped.as_str())
                    .increment(1);
                summary.push(PassOutcome::new(task, PassStatus::Skipped));
                summary.write(&layout.summary_file()).await?;
                continue;
            }

            info!(
                %combination,
                num_requests = task.num_requests,
                pass = index + 1,
                of = tasks.len(),
                "Starting benchmark pass"
            );
            let report = self.run_pass(task, &signal).await?;
            let status = report.outcome.status;
            counter!("llmbench_passes_total", "status" => status.as_str()).increment(1);
            histogram!("llmbench_pass_duration_seconds").record(report.outcome.duration_secs);

            if let Some(record) = &report.record {
                summary.offer_throughput(record);
                if status == PassStatus::Completed
                    && best.offer(pair, task.concurrency, record)
                {
                    best.write(&layout.best_file()).await?;
                }
            }

            match status {
                PassStatus::Completed => {
                    info!(%combination, "Pass completed within thresholds");
                }
                PassStatus::Violated => {
                    counter!("llmbench_threshold_violations_total").increment(1);
                    gauge!("llmbench_best_concurrency", "pair" => pair.to_string())
                        .set(f64::from(task.concurrency));
                    let last_within = summary.pair(pair).and_then(|p| p.last_within);
                    info!(
                        %pair,
                        best_concurrency = task.concurrency,
                        last_within = ?last_within,
                        breaches = ?report.outcome.breaches.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "Best concurrency under thresholds = {}",
                        task.concurrency
                    );
                    if task.task_mode == TaskMode::Grid {
                        violated.insert(pair);
                    }
                }
                PassStatus::Failed => {
                    warn!(
                        %combination,
                        status = ?report.outcome.runner_status,
                        log = %layout.client_log(&combination).display(),
                        "Benchmark runner failed"
                    );
                }
                PassStatus::Skipped => {}
            }

            let failed = status == PassStatus::Failed;
            let runner_status = report.outcome.runner_status.clone();
            summary.push(report.outcome);
            summary.write(&layout.summary_file()).await?;

            if failed && !self.settings.continue_on_failure {
                self.finish(&mut summary).await?;
                return Err(BenchError::RunnerFailed {
                    combination,
                    status: runner_status.unwrap_or_default(),
                    log: layout.client_log(&combination),
                });
            }

            let more = tasks[index + 1..].iter().any(|t| !skips(t, &violated));
            if more && !self.settings.cooldown.is_zero() {
                debug!(cooldown_ms = self.settings.cooldown.as_millis(), "Cooling down");
                tokio::time::sleep(self.settings.cooldown).await;
            }
        }

        self.finish(&mut summary).await?;
        info!(
            run_dir = %layout.root().display(),
            completed = summary.count(PassStatus::Completed),
            violated = summary.count(PassStatus::Violated),
            skipped = summary.count(PassStatus::Skipped),
            failed = summary.count(PassStatus::Failed),
            "Benchmark batch finished"
        );
        Ok(summary)
    }

    async fn finish(&self, summary: &mut BatchSummary) -> Result<(), BenchError> {
        let layout = &self.settings.layout;
        summary.finish();
        summary.write(&layout.summary_file()).await?;
        if self.settings.write_metrics
            && let Some(handle) = &self.metrics
        {
            telemetry::write_snapshot(handle, &layout.metrics_file()).await;
        }
        Ok(())
    }

    async fn run_pass(&self, task: &Task, signal: &SignalFile) -> Result<PassReport, BenchError> {
        let settings = &self.settings;
        let layout = &settings.layout;
        let combination = task.combination();
        let started = Instant::now();

        match signal.consume().await {
            Ok(Some(_)) => warn!(path = %signal.path().display(), "Removed stale signal file"),
            Ok(None) => {}
            Err(e) => warn!(path = %signal.path().display(), error = %e, "Failed to clear signal file"),
        }

        let sampler = match &settings.gpu_sampler {
            Some(config) => {
                let metadata = settings.pass_metadata(task);
                match SamplerHandle::start(
                    config,
                    settings.gpu_count,
                    &layout.gpu_dir(&combination),
                    combination,
                    &metadata,
                )
                .await
                {
                    Ok(handle) => Some((handle, config.stop_timeout_secs)),
                    Err(e) => {
                        warn!(%combination, error = %e, "GPU sampler failed to start; continuing without GPU stats");
                        None
                    }
                }
            }
            None => None,
        };

        let monitor = (!settings.thresholds.is_empty()).then(|| {
            ThresholdMonitor::new(
                JsonTail::from_end(layout.results_file()),
                settings.thresholds.clone(),
                signal.clone(),
                settings.monitor.statistic,
            )
            .expecting(combination)
            .spawn(Duration::from_millis(settings.monitor.poll_interval_ms))
        });

        let exit = self.runner.run(task, settings).await;

        let report = match monitor {
            Some(handle) => {
                let report = handle
                    .stop(Duration::from_millis(settings.monitor.stop_timeout_ms))
                    .await;
                if report.is_none() {
                    warn!(%combination, "Threshold monitor did not report; relying on signal file");
                }
                report
            }
            None => None,
        };

        let summary_path = match sampler {
            Some((handle, stop_timeout_secs)) => {
                let path = handle.summary_path().to_path_buf();
                handle.stop(Duration::from_secs(stop_timeout_secs)).await;
                Some(path)
            }
            None => None,
        };

        let exit: RunnerExit = exit?;

        let mut outcome = PassOutcome::new(task, PassStatus::Completed);
        outcome.runner_status = Some(exit.status.clone());

        if exit.success
            && let Some(gpu_log) = &summary_path
        {
            let merged = match merge_gpu_into_results(&layout.results_file(), gpu_log).await {
                Ok(MergeOutcome::Merged) => MergeOutcome::Merged.as_str(),
                Ok(other) => {
                    debug!(%combination, outcome = other.as_str(), "GPU summary not merged");
                    other.as_str()
                }
                Err(e) => {
                    warn!(%combination, error = %e, "Failed to merge GPU summary");
                    "error"
                }
            };
            counter!("llmbench_gpu_merges_total", "outcome" => merged).increment(1);
            outcome.gpu_merge = Some(merged.to_string());
        }

        let consumed = match signal.consume().await {
            Ok(consumed) => consumed,
            Err(e) => {
                warn!(path = %signal.path().display(), error = %e, "Failed to consume signal file");
                None
            }
        };
        if let Some(payload) = consumed.as_ref().and_then(|s| s.payload.as_ref())
            && payload.combination() != combination
        {
            warn!(%combination, signalled = %payload.combination(), "Signal names a different combination");
        }
        let breaches = violation_breaches(consumed.as_ref(), report.as_ref());

        outcome.status = match (exit.success, breaches) {
            (false, _) => PassStatus::Failed,
            (true, Some(breaches)) => {
                outcome.breaches = breaches;
                PassStatus::Violated
            }
            (true, None) => PassStatus::Completed,
        };
        outcome.duration_secs = started.elapsed().as_secs_f64();

        let record = if exit.success {
            match read_last_record(&layout.results_file()).await {
                Ok(Some(record))
                    if record.combination().is_none_or(|c| c == combination) =>
                {
                    Some(record)
                }
                Ok(_) => {
                    warn!(%combination, "No results record found for this pass");
                    None
                }
                Err(e) => {
                    warn!(%combination, error = %e, "Failed to read results file");
                    None
                }
            }
        } else {
            None
        };

        Ok(PassReport { outcome, record })
    }
}

/// Whether `task` is skipped because its pair already violated.
fn skips(task: &Task, violated: &HashSet<LengthPair>) -> bool {
    task.task_mode == TaskMode::Grid && violated.contains(&task.pair())
}

/// Breaches for a pass, or `None` when it stayed within thresholds.
///
/// The signal file is authoritative; the monitor's own report fills in the
/// breaches when the marker could not be written or decoded.
fn violation_breaches(
    signal: Option<&Signal>,
    report: Option<&MonitorReport>,
) -> Option<Vec<Breach>> {
    let signalled = signal
        .and_then(|s| s.payload.as_ref())
        .map(|p| p.breaches.clone())
        .filter(|b| !b.is_empty());
    let reported = report
        .and_then(|r| r.violations.first())
        .map(|v| v.breaches.clone());

    match (signalled.or(reported), signal) {
        (Some(breaches), _) => Some(breaches),
        (None, Some(_)) => Some(Vec::new()),
        (None, None) => None,
    }
}
