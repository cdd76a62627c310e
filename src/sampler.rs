//! GPU utilization sampler lifecycle.
//!
//! The sampler is an external script that polls the GPUs until it receives
//! SIGINT, then appends one summary line to `{log_path}/{summary_filename}`.
//! It runs in its own process group so the interrupt reaches any helper it
//! forked.

use crate::config::SamplerConfig;
use crate::process::{group_command, interrupt_and_wait, signal_group, spawn_logged};
use crate::types::{BenchError, Combination};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Build the sampler arguments for one pass.
pub fn build_args(
    config: &SamplerConfig,
    gpu_count: u32,
    out_dir: &Path,
    metadata: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = config.args_prefix.clone();
    args.extend([
        "--gpu-num".to_string(),
        gpu_count.to_string(),
        "--interval".to_string(),
        config.interval_secs.to_string(),
        "--gpu-utilization-threshold".to_string(),
        config.utilization_threshold.to_string(),
        "--log-path".to_string(),
        out_dir.display().to_string(),
    ]);
    if !metadata.is_empty() {
        args.push("--metadata".to_string());
        args.extend(metadata.iter().map(|(k, v)| format!("{k}={v}")));
    }
    args
}

/// A sampler running alongside one benchmark pass.
///
/// Dropping the handle without [`SamplerHandle::stop`] kills the sampler's
/// process group; no summary is expected in that case.
pub struct SamplerHandle {
    child: Option<Child>,
    summary_path: PathBuf,
    combination: Combination,
}

impl SamplerHandle {
    /// Start the sampler, writing into `out_dir`.
    pub async fn start(
        config: &SamplerConfig,
        gpu_count: u32,
        out_dir: &Path,
        combination: Combination,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Self, BenchError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| BenchError::io(out_dir, e))?;

        let args = build_args(config, gpu_count, out_dir, metadata);
        debug!(command = %config.command, args = ?args, "GPU sampler command");

        let mut cmd = group_command(&config.command);
        cmd.args(&args);
        let child = spawn_logged(cmd, "GPU sampler", &out_dir.join("sampler.log"), "sampler").await?;
        info!(%combination, pid = child.id(), "GPU sampler started");

        Ok(Self {
            child: Some(child),
            summary_path: out_dir.join(&config.summary_filename),
            combination,
        })
    }

    /// Where the sampler writes its summary line.
    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Interrupt the sampler and wait for it to write its summary.
    pub async fn stop(mut self, timeout: Duration) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let status = interrupt_and_wait(&mut child, timeout, "GPU sampler").await;
        match &status {
            Some(s) => debug!(combination = %self.combination, status = %s, "GPU sampler stopped"),
            None => warn!(combination = %self.combination, "GPU sampler exit status unknown"),
        }
        status
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.take()
            && let Some(pid) = child.id()
        {
            debug!(pid, "Killing GPU sampler on drop");
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
        }
    }
}
