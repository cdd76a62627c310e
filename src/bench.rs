//! Benchmark runner - runs one benchmark pass to completion
//!
//! The runner is the only collaborator the driver blocks on. The trait is the
//! seam between the escalation policy and the external client, so the policy
//! can be exercised without spawning processes.

use crate::config::BatchSettings;
use crate::process::{GroupGuard, group_command, spawn_logged};
use crate::types::{BenchError, Task};
use async_trait::async_trait;
use tracing::{debug, info};

/// How a runner invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerExit {
    pub success: bool,
    pub status: String,
}

impl RunnerExit {
    pub fn ok() -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
        }
    }
}

/// Runs one benchmark pass and appends its record to the results file.
#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    async fn run(&self, task: &Task, settings: &BatchSettings) -> Result<RunnerExit, BenchError>;
}

/// Runs the configured benchmark client command (`vllm bench serve` by default).
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Build the benchmark client arguments for one pass.
pub fn build_args(task: &Task, settings: &BatchSettings) -> Vec<String> {
    let bench = &settings.bench;
    let layout = &settings.layout;

    let mut args = bench.args_prefix.clone();
    args.extend([
        "--backend".to_string(),
        bench.backend.clone(),
        "--model".to_string(),
        settings.model_path.clone(),
        "--served-model-name".to_string(),
        settings.model_name.clone(),
        "--dataset-name".to_string(),
        bench.dataset_name.clone(),
        "--host".to_string(),
        settings.host.clone(),
        "--port".to_string(),
        settings.port.to_string(),
        "--max-concurrency".to_string(),
        task.concurrency.to_string(),
        "--num-prompts".to_string(),
        task.num_requests.to_string(),
        "--random-input-len".to_string(),
        task.input_len.to_string(),
        "--random-output-len".to_string(),
        task.output_len.to_string(),
        "--save-result".to_string(),
        "--append-result".to_string(),
        "--result-dir".to_string(),
        layout.root().display().to_string(),
        "--result-filename".to_string(),
        layout.result_filename().to_string(),
    ]);

    let metadata = settings.pass_metadata(task);
    if !metadata.is_empty() {
        args.push("--metadata".to_string());
        args.extend(metadata.iter().map(|(k, v)| format!("{k}={v}")));
    }

    args.extend(bench.extra_args.iter().cloned());
    args
}

#[async_trait]
impl BenchmarkRunner for CommandRunner {
    async fn run(&self, task: &Task, settings: &BatchSettings) -> Result<RunnerExit, BenchError> {
        let combination = task.combination();
        let log_path = settings.layout.client_log(&combination);
        let args = build_args(task, settings);
        debug!(command = %settings.bench.command, args = ?args, "Benchmark client command");

        let mut cmd = group_command(&settings.bench.command);
        cmd.args(&args).envs(&settings.bench.env);

        info!(%combination, num_requests = task.num_requests, "Running benchmark client");
        let mut child = spawn_logged(cmd, "benchmark runner", &log_path, "bench").await?;
        let guard = GroupGuard::new(&child);

        let status = child
            .wait()
            .await
            .map_err(|e| BenchError::io(&log_path, e))?;
        guard.disarm();

        debug!(%combination, %status, "Benchmark client exited");
        Ok(RunnerExit {
            success: status.success(),
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchSettings, Config, RunOverrides};
    use crate::types::TaskMode;

    #[test]
    fn test_build_args() {
        let mut config = Config::default();
        config.bench.extra_args = vec!["--ignore-eos".to_string()];
        let settings = BatchSettings::resolve(
            &config,
            RunOverrides {
                model_path: "/models/llama".to_string(),
                gpu_count: 2,
                host: "10.0.0.1".to_string(),
                port: 9000,
                ..RunOverrides::default()
            },
        )
        .unwrap();
        let task = Task {
            task_mode: TaskMode::Grid,
            input_len: 1024,
            output_len: 128,
            concurrency: 16,
            num_requests: 64,
        };

        let args = build_args(&task, &settings);
        assert_eq!(&args[..2], ["bench", "serve"]);

        let flag = |name: &str| {
            let i = args.iter().position(|a| a == name).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(flag("--max-concurrency"), "16");
        assert_eq!(flag("--num-prompts"), "64");
        assert_eq!(flag("--random-input-len"), "1024");
        assert_eq!(flag("--served-model-name"), "llama");
        assert_eq!(flag("--port"), "9000");
        assert_eq!(flag("--result-filename"), "results.json");
        assert!(args.contains(&"concurrency=16".to_string()));
        assert!(args.contains(&"input_len=1024".to_string()));
        assert_eq!(args.last().unwrap(), "--ignore-eos");
    }
}
