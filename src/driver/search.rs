//! Concurrency bisection for a single length pair.
//!
//! Instead of walking every level of a grid, `search` halves the range
//! `[min, max]` after each pass: a pass within thresholds moves the lower
//! bound up, anything else (a breach, a runner failure, or no record)
//! moves the upper bound down. Like grid mode this assumes latency grows
//! with concurrency.

use super::BatchDriver;
use crate::bench::BenchmarkRunner;
use crate::monitor::SignalFile;
use crate::record::BenchRecord;
use crate::summary::{BatchSummary, BestRecords, PassStatus};
use crate::tasks::{PlanError, RequestNum};
use crate::types::{BenchError, LengthPair, Task, TaskMode};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Inclusive concurrency bounds for a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRange {
    min: u32,
    max: u32,
}

impl SearchRange {
    pub fn new(min: u32, max: u32) -> Result<Self, PlanError> {
        if min == 0 || min > max {
            return Err(PlanError::InvalidSearchRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// One tried level.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchStep {
    pub concurrency: u32,
    pub status: PassStatus,
    pub within: bool,
}

#[derive(Debug)]
pub struct SearchOutcome {
    pub pair: LengthPair,
    /// Highest tried concurrency that stayed within thresholds
    pub best_concurrency: Option<u32>,
    pub best: Option<BenchRecord>,
    pub steps: Vec<SearchStep>,
    pub summary: BatchSummary,
}

impl<R: BenchmarkRunner> BatchDriver<R> {
    /// Bisect `range` for the highest concurrency of `pair` that stays
    /// within thresholds. With no thresholds every pass qualifies and the
    /// search converges on `range.max()`.
    pub async fn search(
        &self,
        pair: LengthPair,
        range: SearchRange,
        request_num: RequestNum,
    ) -> Result<SearchOutcome, BenchError> {
        let settings = &self.settings;
        let layout = &settings.layout;
        layout.create().await?;
        info!(
            run_dir = %layout.root().display(),
            %pair,
            min = range.min(),
            max = range.max(),
            thresholds = %settings.thresholds,
            "Starting concurrency search"
        );

        let signal = SignalFile::new(layout.signal_file());
        let mut summary = BatchSummary::new(
            layout.root(),
            &settings.model_name,
            &settings.thresholds,
            settings.monitor.statistic,
        );
        let mut best_records = BestRecords::default();
        let mut best: Option<BenchRecord> = None;
        let mut steps = Vec::new();

        let (mut lo, mut hi) = (range.min(), range.max());
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let task = Task {
                task_mode: TaskMode::Custom,
                input_len: pair.input_len,
                output_len: pair.output_len,
                concurrency: mid,
                num_requests: request_num.for_concurrency(mid),
            };
            info!(%pair, concurrency = mid, lo, hi, iteration = steps.len() + 1, "Trying concurrency");

            let report = self.run_pass(&task, &signal).await?;
            let status = report.outcome.status;
            counter!("llmbench_passes_total", "status" => status.as_str()).increment(1);
            histogram!("llmbench_pass_duration_seconds").record(report.outcome.duration_secs);

            let within = status == PassStatus::Completed
                && report.record.as_ref().is_some_and(|record| {
                    settings
                        .thresholds
                        .is_satisfied_by(record, settings.monitor.statistic)
                });

            if let Some(record) = &report.record {
                summary.offer_throughput(record);
            }
            match (&report.record, within) {
                (Some(record), true) => {
                    info!(%pair, concurrency = mid, "Within thresholds; trying higher");
                    if best_records.offer(pair, mid, record) {
                        best_records.write(&layout.best_file()).await?;
                    }
                    best = Some(record.clone());
                    lo = mid + 1;
                }
                _ => {
                    match status {
                        PassStatus::Failed => warn!(
                            %pair,
                            concurrency = mid,
                            status = ?report.outcome.runner_status,
                            "Benchmark runner failed; treating as over the limit"
                        ),
                        PassStatus::Violated => {
                            counter!("llmbench_threshold_violations_total").increment(1);
                            info!(%pair, concurrency = mid, "Threshold violated; trying lower");
                        }
                        _ => warn!(%pair, concurrency = mid, "No usable record; trying lower"),
                    }
                    // mid >= range.min >= 1
                    hi = mid - 1;
                }
            }

            steps.push(SearchStep {
                concurrency: mid,
                status,
                within,
            });
            summary.push(report.outcome);
            summary.write(&layout.summary_file()).await?;

            if lo <= hi && !settings.cooldown.is_zero() {
                debug!(cooldown_ms = settings.cooldown.as_millis(), "Cooling down");
                tokio::time::sleep(settings.cooldown).await;
            }
        }

        self.finish(&mut summary).await?;
        let best_concurrency = best.as_ref().and_then(BenchRecord::concurrency);
        match best_concurrency {
            Some(c) => info!(%pair, best_concurrency = c, steps = steps.len(), "Search finished"),
            None => warn!(%pair, steps = steps.len(), "No tried concurrency stayed within thresholds"),
        }

        Ok(SearchOutcome {
            pair,
            best_concurrency,
            best,
            steps,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{FakeRunner, settings};
    use crate::threshold::{Metric, Thresholds};

    const PAIR: LengthPair = LengthPair {
        input_len: 128,
        output_len: 64,
    };

    fn tried(outcome: &SearchOutcome) -> Vec<u32> {
        outcome.steps.iter().map(|s| s.concurrency).collect()
    }

    #[test]
    fn test_search_range_validation() {
        assert!(SearchRange::new(1, 128).is_ok());
        assert!(SearchRange::new(4, 4).is_ok());
        assert!(matches!(
            SearchRange::new(0, 8),
            Err(PlanError::InvalidSearchRange { min: 0, max: 8 })
        ));
        assert!(SearchRange::new(16, 8).is_err());
    }

    #[tokio::test]
    async fn test_search_bisects_to_highest_within() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), None);
        settings.thresholds = Thresholds::new().with(Metric::Ttft, 400.0);
        // Violates from 21 upward
        let driver = BatchDriver::new(settings, FakeRunner::new(21));

        let outcome = driver
            .search(PAIR, SearchRange::new(1, 32).unwrap(), RequestNum::Auto)
            .await
            .unwrap();

        assert_eq!(outcome.best_concurrency, Some(20));
        assert_eq!(tried(&outcome), vec![16, 24, 20, 22, 21]);
        let within: Vec<bool> = outcome.steps.iter().map(|s| s.within).collect();
        assert_eq!(within, vec![true, false, true, false, false]);
        assert_eq!(outcome.steps[1].status, PassStatus::Violated);

        let best = std::fs::read_to_string(driver.settings().layout.best_file()).unwrap();
        assert!(best.contains("\"concurrency\":\"20\""));
        assert!(driver.settings().layout.summary_file().exists());
        assert!(!driver.settings().layout.signal_file().exists());
    }

    #[tokio::test]
    async fn test_search_nothing_within() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BatchDriver::new(settings(dir.path(), Some("ttft:400")), FakeRunner::new(1));

        let outcome = driver
            .search(PAIR, SearchRange::new(1, 8).unwrap(), RequestNum::Times(2))
            .await
            .unwrap();

        assert_eq!(outcome.best_concurrency, None);
        assert!(outcome.best.is_none());
        assert_eq!(tried(&outcome), vec![4, 2, 1]);
        assert_eq!(outcome.summary.count(PassStatus::Violated), 3);
    }

    #[tokio::test]
    async fn test_search_treats_runner_failure_as_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = FakeRunner::new(u32::MAX);
        runner.fail_at = Some(8);
        let driver = BatchDriver::new(settings(dir.path(), Some("ttft:400")), runner);

        let outcome = driver
            .search(PAIR, SearchRange::new(1, 15).unwrap(), RequestNum::Auto)
            .await
            .unwrap();

        // 8 fails, then 1..7 all pass
        assert_eq!(tried(&outcome), vec![8, 4, 6, 7]);
        assert_eq!(outcome.steps[0].status, PassStatus::Failed);
        assert_eq!(outcome.best_concurrency, Some(7));
    }

    #[tokio::test]
    async fn test_search_without_thresholds_reaches_max() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BatchDriver::new(settings(dir.path(), None), FakeRunner::new(1));

        let outcome = driver
            .search(PAIR, SearchRange::new(3, 3).unwrap(), RequestNum::Auto)
            .await
            .unwrap();

        assert_eq!(tried(&outcome), vec![3]);
        assert_eq!(outcome.best_concurrency, Some(3));
        assert_eq!(driver.runner.calls(), vec![(128, 64, 3)]);
    }
}
