//! Per-run output directory layout.
//!
//! ```text
//! {output_root}/{model}_tp{tp}_{precision}_{YYYYmmdd_HHMMSS}/
//! ├── results.json                     benchmark client records (append-only)
//! ├── best_signal.json                 transient threshold signal
//! ├── best.jsonl                       best record per length pair
//! ├── summary.json                     pass outcomes, rewritten after every pass
//! ├── metrics.prom                     Prometheus text snapshot
//! ├── server.log                       inference server output (if launched)
//! ├── gpu_utilization/in{I}_out{O}_c{C}/
//! └── client_logs/in{I}_out{O}_c{C}.log
//! ```

use crate::types::{BenchError, Combination};
use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    result_filename: String,
}

impl RunLayout {
    pub fn new<Tz: TimeZone>(
        output_root: &Path,
        model_name: &str,
        tensor_parallel_size: u32,
        precision: &str,
        started: DateTime<Tz>,
        result_filename: &str,
    ) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let dir_name = format!(
            "{}_tp{}_{}_{}",
            sanitize(model_name),
            tensor_parallel_size,
            sanitize(precision),
            started.format("%Y%m%d_%H%M%S")
        );
        Self {
            root: output_root.join(dir_name),
            result_filename: result_filename.to_string(),
        }
    }

    /// Use an existing directory as the run root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            result_filename: "results.json".to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_file(&self) -> PathBuf {
        self.root.join(&self.result_filename)
    }

    pub fn result_filename(&self) -> &str {
        &self.result_filename
    }

    pub fn signal_file(&self) -> PathBuf {
        self.root.join("best_signal.json")
    }

    pub fn best_file(&self) -> PathBuf {
        self.root.join("best.jsonl")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.root.join("metrics.prom")
    }

    pub fn server_log(&self) -> PathBuf {
        self.root.join("server.log")
    }

    pub fn gpu_dir(&self, combination: &Combination) -> PathBuf {
        self.root.join("gpu_utilization").join(combination.label())
    }

    pub fn client_log(&self, combination: &Combination) -> PathBuf {
        self.root
            .join("client_logs")
            .join(format!("{}.log", combination.label()))
    }

    /// Create the run directory and its fixed subdirectories.
    pub async fn create(&self) -> Result<(), BenchError> {
        for dir in [
            self.root.clone(),
            self.root.join("gpu_utilization"),
            self.root.join("client_logs"),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| BenchError::io(&dir, e))?;
        }
        Ok(())
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
