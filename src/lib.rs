//! # llmbench
//!
//! Threshold-driven concurrency sweeps for LLM inference servers.
//!
//! This crate provides:
//! - **Batch driver**: Runs (input_len, output_len, concurrency) passes in order,
//!   or bisects concurrency for a single length pair
//! - **Threshold monitor**: Tails the results file and signals latency violations
//! - **Collaborators**: Benchmark client, GPU sampler and inference server
//!   processes, each in its own process group
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        llmbench                             │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ BatchDriver                                          │   │
//! │  │ - Walks the task plan, concurrency ascending         │   │
//! │  │ - Grid mode: skips a pair after its first violation  │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │        │                 │                    │             │
//! │        ▼                 ▼                    ▼             │
//! │  ┌───────────┐   ┌────────────────┐   ┌───────────────┐    │
//! │  │ GPU       │   │ Benchmark      │   │ Threshold     │    │
//! │  │ sampler   │   │ runner         │──▶│ monitor       │    │
//! │  │ (SIGINT)  │   │ (blocking)     │   │ (tokio task)  │    │
//! │  └───────────┘   └────────────────┘   └───────────────┘    │
//! │        │           results.json              │              │
//! │        ▼                                     ▼              │
//! │   GPU summary ──merge──▶ results.json   best_signal.json    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bench;
mod config;
pub mod driver;
pub mod layout;
pub mod merge;
pub mod monitor;
mod process;
pub mod record;
pub mod sampler;
pub mod server;
pub mod summary;
pub mod tasks;
pub mod telemetry;
pub mod threshold;
mod types;

pub use bench::{BenchmarkRunner, CommandRunner, RunnerExit};
pub use config::{
    BatchSettings, BenchConfig, Config, MonitorConfig, RunOverrides, SamplerConfig,
    model_name_from_path,
};
pub use driver::{BatchDriver, SearchOutcome, SearchRange, SearchStep};
pub use layout::RunLayout;
pub use merge::{MergeError, MergeOutcome, merge_gpu_into_results};
pub use monitor::{MonitorHandle, MonitorReport, SignalFile, ThresholdMonitor, Violation};
pub use record::BenchRecord;
pub use server::{ServerConfig, ServerHandle};
pub use summary::{BatchSummary, BestRecords, PassOutcome, PassStatus};
pub use tasks::{PlanConfig, PlanError, RequestNum};
pub use threshold::{Breach, Metric, Statistic, ThresholdError, Thresholds};
pub use types::{BenchError, Combination, LengthPair, Task, TaskMode};

use anyhow::{Context, Result};
use tracing::info;

/// Launch the configured inference server and wait until it is healthy.
pub async fn start_server(settings: &BatchSettings) -> Result<Option<ServerHandle>> {
    let Some(config) = &settings.server else {
        return Ok(None);
    };

    let config = config.resolved(
        &settings.model_name,
        settings.tensor_parallel_size,
        &settings.precision,
    );

    settings.layout.create().await?;
    let mut server = ServerHandle::launch(
        &config,
        &settings.model_path,
        &settings.host,
        settings.port,
        &settings.layout.server_log(),
    )
    .await?;
    server
        .wait_ready(config.ready_timeout(), std::time::Duration::from_secs(2))
        .await
        .with_context(|| {
            format!(
                "Inference server did not become ready; see {}",
                settings.layout.server_log().display()
            )
        })?;
    info!(pid = ?server.pid(), "Inference server started");
    Ok(Some(server))
}
