//! Task plans: which (input_len, output_len, concurrency) passes to run.
//!
//! A plan is either a grid (every scene crossed with every concurrency
//! level) or a custom list of explicit triples. Alternatively an external
//! generator command can print the task list as JSON.

use crate::types::{Task, TaskMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors building a task list
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("grid mode requires non-empty scenes and concurrency")]
    EmptyGrid,

    #[error("custom mode requires non-empty scenes")]
    EmptyCustom,

    #[error("invalid scene {scene:?} in {mode} mode (expected {expected})")]
    InvalidScene {
        scene: Vec<u32>,
        mode: &'static str,
        expected: &'static str,
    },

    #[error("lengths and concurrency must be positive, got {0:?}")]
    NonPositive(Vec<u32>),

    #[error("invalid search range [{min}, {max}] (need 1 <= min <= max)")]
    InvalidSearchRange { min: u32, max: u32 },

    #[error("unsupported request_num rule '{0}' (expected auto or xN)")]
    InvalidRequestNum(String),

    #[error("task generator failed to run: {0}")]
    GeneratorSpawn(#[source] std::io::Error),

    #[error("task generator exited with {status}: {stderr}")]
    GeneratorFailed { status: String, stderr: String },

    #[error("task generator printed invalid task list: {0}")]
    GeneratorOutput(#[source] serde_json::Error),
}

/// How many prompts a pass sends, relative to its concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestNum {
    /// One request per concurrent slot
    #[default]
    Auto,
    /// `concurrency × n` requests
    Times(u32),
}

impl RequestNum {
    pub fn for_concurrency(&self, concurrency: u32) -> u32 {
        match self {
            RequestNum::Auto => concurrency,
            RequestNum::Times(n) => concurrency.saturating_mul(*n),
        }
    }
}

impl FromStr for RequestNum {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "auto" {
            return Ok(RequestNum::Auto);
        }
        s.strip_prefix('x')
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .map(RequestNum::Times)
            .ok_or_else(|| PlanError::InvalidRequestNum(s.to_string()))
    }
}

impl fmt::Display for RequestNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestNum::Auto => f.write_str("auto"),
            RequestNum::Times(n) => write!(f, "x{n}"),
        }
    }
}

impl Serialize for RequestNum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestNum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Benchmark plan configuration
///
/// ```yaml
/// mode: grid
/// scenes: [[1024, 128], [4096, 512]]
/// concurrency: [1, 8, 32, 64]
/// request_num: x4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub mode: TaskMode,

    /// `[input, output]` pairs in grid mode, `[input, output, concurrency]`
    /// triples in custom mode
    #[serde(default = "default_scenes")]
    pub scenes: Vec<Vec<u32>>,

    /// Concurrency levels (grid mode only)
    #[serde(default = "default_concurrency")]
    pub concurrency: Vec<u32>,

    #[serde(default)]
    pub request_num: RequestNum,

    /// External command printing a JSON task list; replaces the static plan
    #[serde(default)]
    pub generator: Option<Vec<String>>,
}

fn default_scenes() -> Vec<Vec<u32>> {
    vec![vec![1024, 128]]
}

fn default_concurrency() -> Vec<u32> {
    vec![1, 2, 4, 8, 16, 32, 64]
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            mode: TaskMode::default(),
            scenes: default_scenes(),
            concurrency: default_concurrency(),
            request_num: RequestNum::default(),
            generator: None,
        }
    }
}

impl PlanConfig {
    /// Expand the static plan into tasks.
    ///
    /// Grid tasks are grouped by scene with concurrency ascending, which the
    /// escalation policy relies on.
    pub fn build_tasks(&self) -> Result<Vec<Task>, PlanError> {
        let mut tasks = Vec::new();
        match self.mode {
            TaskMode::Grid => {
                if self.scenes.is_empty() || self.concurrency.is_empty() {
                    return Err(PlanError::EmptyGrid);
                }
                let mut levels = self.concurrency.clone();
                levels.sort_unstable();
                levels.dedup();
                if levels.contains(&0) {
                    return Err(PlanError::NonPositive(levels));
                }

                for scene in &self.scenes {
                    let [input_len, output_len] = scene[..] else {
                        return Err(PlanError::InvalidScene {
                            scene: scene.clone(),
                            mode: "grid",
                            expected: "[input_len, output_len]",
                        });
                    };
                    if input_len == 0 || output_len == 0 {
                        return Err(PlanError::NonPositive(scene.clone()));
                    }
                    for &concurrency in &levels {
                        tasks.push(Task {
                            task_mode: TaskMode::Grid,
                            input_len,
                            output_len,
                            concurrency,
                            num_requests: self.request_num.for_concurrency(concurrency),
                        });
                    }
                }
            }
            TaskMode::Custom => {
                if self.scenes.is_empty() {
                    return Err(PlanError::EmptyCustom);
                }
                for scene in &self.scenes {
                    let [input_len, output_len, concurrency] = scene[..] else {
                        return Err(PlanError::InvalidScene {
                            scene: scene.clone(),
                            mode: "custom",
                            expected: "[input_len, output_len, concurrency]",
                        });
                    };
                    if scene.contains(&0) {
                        return Err(PlanError::NonPositive(scene.clone()));
                    }
                    tasks.push(Task {
                        task_mode: TaskMode::Custom,
                        input_len,
                        output_len,
                        concurrency,
                        num_requests: self.request_num.for_concurrency(concurrency),
                    });
                }
            }
        }
        Ok(tasks)
    }

    /// Resolve the task list, running the external generator if configured.
    pub async fn resolve(&self) -> Result<Vec<Task>, PlanError> {
        let tasks = match self.generator.as_deref() {
            Some([program, args @ ..]) => run_generator(program, args).await?,
            _ => self.build_tasks()?,
        };
        info!(tasks = tasks.len(), "Task plan resolved");
        Ok(tasks)
    }
}

/// Run an external task generator and parse its stdout as a JSON task list.
pub async fn run_generator(program: &str, args: &[String]) -> Result<Vec<Task>, PlanError> {
    debug!(program, args = ?args, "Running task generator");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(PlanError::GeneratorSpawn)?;

    if !output.status.success() {
        return Err(PlanError::GeneratorFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }

    let tasks: Vec<Task> =
        serde_json::from_slice(&output.stdout).map_err(PlanError::GeneratorOutput)?;
    if let Some(bad) = tasks
        .iter()
        .find(|t| t.input_len == 0 || t.output_len == 0 || t.concurrency == 0)
    {
        return Err(PlanError::NonPositive(vec![
            bad.input_len,
            bad.output_len,
            bad.concurrency,
        ]));
    }
    Ok(tasks)
}
