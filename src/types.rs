//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// An (input_len, output_len) pair. Escalation decisions are tracked per pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LengthPair {
    pub input_len: u32,
    pub output_len: u32,
}

impl fmt::Display for LengthPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in{}_out{}", self.input_len, self.output_len)
    }
}

/// One load level for one length pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Combination {
    pub input_len: u32,
    pub output_len: u32,
    pub concurrency: u32,
}

impl Combination {
    pub fn pair(&self) -> LengthPair {
        LengthPair {
            input_len: self.input_len,
            output_len: self.output_len,
        }
    }

    /// Directory/file stem used for per-combination artifacts.
    pub fn label(&self) -> String {
        format!("{}_c{}", self.pair(), self.concurrency)
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input_len={} output_len={} concurrency={}",
            self.input_len, self.output_len, self.concurrency
        )
    }
}

/// Escalation policy attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Stop escalating concurrency for a length pair after its first violation
    #[default]
    Grid,
    /// Every task runs regardless of earlier violations
    Custom,
}

/// A single benchmark pass to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub task_mode: TaskMode,
    pub input_len: u32,
    pub output_len: u32,
    pub concurrency: u32,
    pub num_requests: u32,
}

impl Task {
    pub fn combination(&self) -> Combination {
        Combination {
            input_len: self.input_len,
            output_len: self.output_len,
            concurrency: self.concurrency,
        }
    }

    pub fn pair(&self) -> LengthPair {
        self.combination().pair()
    }
}

/// Errors from the batch driver and the collaborators it runs
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("failed to spawn {what}: {source}")]
    SpawnFailed {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("benchmark runner failed for {combination} ({status}); see {}", log.display())]
    RunnerFailed {
        combination: Combination,
        status: String,
        log: PathBuf,
    },

    #[error("inference server failed: {0}")]
    Server(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch interrupted")]
    Interrupted,
}

impl BenchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combination_label() {
        let combo = Combination {
            input_len: 1024,
            output_len: 128,
            concurrency: 32,
        };
        assert_eq!(combo.label(), "in1024_out128_c32");
        assert_eq!(
            combo.pair(),
            LengthPair {
                input_len: 1024,
                output_len: 128
            }
        );
    }

    #[test]
    fn test_task_mode_defaults_to_grid() {
        let task: Task = serde_json::from_str(
            r#"{"input_len": 1, "output_len": 2, "concurrency": 4, "num_requests": 4}"#,
        )
        .unwrap();
        assert_eq!(task.task_mode, TaskMode::Grid);

        let task: Task = serde_json::from_str(
            r#"{"task_mode": "custom", "input_len": 1, "output_len": 2, "concurrency": 4, "num_requests": 8}"#,
        )
        .unwrap();
        assert_eq!(task.task_mode, TaskMode::Custom);
    }
}
