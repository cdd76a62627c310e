//! Batch outcome bookkeeping: `summary.json` and `best.jsonl`.

use crate::merge::write_atomic;
use crate::record::BenchRecord;
use crate::threshold::{Breach, Statistic, Thresholds};
use crate::types::{BenchError, LengthPair, Task, TaskMode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    /// Runner succeeded and every threshold held
    Completed,
    /// Runner succeeded but at least one threshold was breached
    Violated,
    /// Not run: an earlier level of the same pair violated (grid mode)
    Skipped,
    /// Runner exited non-zero
    Failed,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Completed => "completed",
            PassStatus::Violated => "violated",
            PassStatus::Skipped => "skipped",
            PassStatus::Failed => "failed",
        }
    }
}

/// One entry in the batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    pub input_len: u32,
    pub output_len: u32,
    pub concurrency: u32,
    pub num_requests: u32,
    pub task_mode: TaskMode,
    pub status: PassStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breaches: Vec<Breach>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_merge: Option<String>,
    pub duration_secs: f64,
}

impl PassOutcome {
    pub fn new(task: &Task, status: PassStatus) -> Self {
        Self {
            input_len: task.input_len,
            output_len: task.output_len,
            concurrency: task.concurrency,
            num_requests: task.num_requests,
            task_mode: task.task_mode,
            status,
            breaches: Vec::new(),
            runner_status: None,
            gpu_merge: None,
            duration_secs: 0.0,
        }
    }

    pub fn pair(&self) -> LengthPair {
        LengthPair {
            input_len: self.input_len,
            output_len: self.output_len,
        }
    }
}

/// Escalation result for one length pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairResult {
    pub input_len: u32,
    pub output_len: u32,
    /// Highest concurrency that stayed within all thresholds
    pub last_within: Option<u32>,
    /// First concurrency that breached a threshold
    pub violated_at: Option<u32>,
}

/// Highest-concurrency record within thresholds, per length pair.
#[derive(Debug, Default)]
pub struct BestRecords {
    by_pair: BTreeMap<LengthPair, (u32, Value)>,
}

impl BestRecords {
    /// Keep `record` if it beats the current best for `pair`. Returns
    /// whether it was kept.
    pub fn offer(&mut self, pair: LengthPair, concurrency: u32, record: &BenchRecord) -> bool {
        match self.by_pair.get(&pair) {
            Some((best, _)) if *best >= concurrency => false,
            _ => {
                self.by_pair
                    .insert(pair, (concurrency, record.clone().into_value()));
                true
            }
        }
    }

    /// Load a previously written `best.jsonl`. A missing file is empty;
    /// lines without combination keys are ignored.
    pub async fn load(path: &Path) -> Result<Self, BenchError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(BenchError::io(path, e)),
        };
        let mut best = Self::default();
        for record in contents.lines().filter_map(BenchRecord::parse_line) {
            if let Some(combination) = record.combination() {
                best.offer(combination.pair(), combination.concurrency, &record);
            }
        }
        Ok(best)
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }

    /// One JSON object per line, ordered by length pair.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for (_, record) in self.by_pair.values() {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }

    pub async fn write(&self, path: &Path) -> Result<(), BenchError> {
        write_atomic(path, self.to_jsonl().as_bytes())
            .await
            .map_err(|e| BenchError::io(path, e))
    }
}

/// Everything `summary.json` reports about a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_dir: PathBuf,
    pub model_name: String,
    pub thresholds: String,
    pub statistic: Statistic,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub passes: Vec<PassOutcome>,
    pub pairs: Vec<PairResult>,
    /// Record with the highest `total_token_throughput` seen in the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_throughput: Option<Value>,
}

impl BatchSummary {
    pub fn new(
        run_dir: &Path,
        model_name: &str,
        thresholds: &Thresholds,
        statistic: Statistic,
    ) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            model_name: model_name.to_string(),
            thresholds: thresholds.to_string(),
            statistic,
            started_at: chrono::Local::now().to_rfc3339(),
            finished_at: None,
            passes: Vec::new(),
            pairs: Vec::new(),
            best_throughput: None,
        }
    }

    /// Record a pass and fold it into its pair's result.
    pub fn push(&mut self, outcome: PassOutcome) {
        let pair = outcome.pair();
        let index = match self
            .pairs
            .iter()
            .position(|p| p.input_len == pair.input_len && p.output_len == pair.output_len)
        {
            Some(i) => i,
            None => {
                self.pairs.push(PairResult {
                    input_len: pair.input_len,
                    output_len: pair.output_len,
                    ..PairResult::default()
                });
                self.pairs.len() - 1
            }
        };
        let result = &mut self.pairs[index];
        match outcome.status {
            PassStatus::Completed => {
                result.last_within = result.last_within.max(Some(outcome.concurrency));
            }
            PassStatus::Violated if result.violated_at.is_none() => {
                result.violated_at = Some(outcome.concurrency);
            }
            _ => {}
        }
        self.passes.push(outcome);
    }

    pub fn pair(&self, pair: LengthPair) -> Option<&PairResult> {
        self.pairs
            .iter()
            .find(|p| p.input_len == pair.input_len && p.output_len == pair.output_len)
    }

    /// Keep `record` as the best-throughput record if it beats the current one.
    pub fn offer_throughput(&mut self, record: &BenchRecord) {
        let Some(candidate) = record.total_token_throughput() else {
            return;
        };
        let current = self
            .best_throughput
            .as_ref()
            .and_then(|v| v.get("total_token_throughput"))
            .and_then(Value::as_f64);
        if current.is_none_or(|c| candidate > c) {
            self.best_throughput = Some(record.clone().into_value());
        }
    }

    pub fn count(&self, status: PassStatus) -> usize {
        self.passes.iter().filter(|p| p.status == status).count()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(chrono::Local::now().to_rfc3339());
    }

    pub async fn write(&self, path: &Path) -> Result<(), BenchError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| BenchError::io(path, std::io::Error::other(e)))?;
        write_atomic(path, &bytes)
            .await
            .map_err(|e| BenchError::io(path, e))
    }
}
