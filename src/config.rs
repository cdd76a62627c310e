//! Configuration for llmbench

use crate::layout::RunLayout;
use crate::server::ServerConfig;
use crate::tasks::PlanConfig;
use crate::threshold::{Statistic, Thresholds};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Benchmark client invocation
    #[serde(default)]
    pub bench: BenchConfig,

    /// Which passes to run
    #[serde(default)]
    pub plan: PlanConfig,

    /// GPU sampler run alongside every pass (null to disable)
    #[serde(default = "default_gpu_sampler")]
    pub gpu_sampler: Option<SamplerConfig>,

    /// Threshold monitor tuning
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Inference server launch options (used with --launch-server or `serve`)
    #[serde(default)]
    pub server: ServerConfig,

    /// Latency objectives, e.g. "ttft:400 tpot:50" (CLI overrides)
    #[serde(default)]
    pub thresholds: Option<String>,

    /// Pause between passes so residual load drains
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Record a failed pass and keep going instead of aborting the batch
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Directory under which per-run directories are created
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Write a Prometheus text snapshot into the run directory
    #[serde(default = "default_write_metrics")]
    pub write_metrics: bool,
}

/// How to invoke the benchmark client.
///
/// ```json
/// {
///   "command": "vllm",
///   "args_prefix": ["bench", "serve"],
///   "backend": "vllm",
///   "dataset_name": "random",
///   "extra_args": ["--ignore-eos"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_bench_command")]
    pub command: String,

    /// Arguments placed before the generated flags
    #[serde(default = "default_bench_args_prefix")]
    pub args_prefix: Vec<String>,

    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,

    /// Appended after the generated flags
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Extra environment for the client process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Extra `key=value` metadata recorded with every result
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// File name of the results file inside the run directory
    #[serde(default = "default_result_filename")]
    pub result_filename: String,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            command: default_bench_command(),
            args_prefix: default_bench_args_prefix(),
            backend: default_backend(),
            dataset_name: default_dataset_name(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            metadata: BTreeMap::new(),
            result_filename: default_result_filename(),
        }
    }
}

/// How to invoke the GPU sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_sampler_command")]
    pub command: String,

    #[serde(default = "default_sampler_args_prefix")]
    pub args_prefix: Vec<String>,

    /// Seconds between samples
    #[serde(default = "default_sampler_interval")]
    pub interval_secs: u64,

    /// Samples below this utilization (%) are treated as idle
    #[serde(default)]
    pub utilization_threshold: f64,

    /// How long to wait for the summary after SIGINT
    #[serde(default = "default_sampler_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Summary file the sampler writes inside its output directory
    #[serde(default = "default_summary_filename")]
    pub summary_filename: String,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            command: default_sampler_command(),
            args_prefix: default_sampler_args_prefix(),
            interval_secs: default_sampler_interval(),
            utilization_threshold: 0.0,
            stop_timeout_secs: default_sampler_stop_timeout(),
            summary_filename: default_summary_filename(),
        }
    }
}

/// Threshold monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Which statistic is compared against the bounds
    #[serde(default)]
    pub statistic: Statistic,

    #[serde(default = "default_monitor_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            statistic: Statistic::default(),
            stop_timeout_ms: default_monitor_stop_timeout_ms(),
        }
    }
}

fn default_gpu_sampler() -> Option<SamplerConfig> {
    Some(SamplerConfig::default())
}

fn default_bench_command() -> String {
    "vllm".to_string()
}

fn default_bench_args_prefix() -> Vec<String> {
    vec!["bench".to_string(), "serve".to_string()]
}

fn default_backend() -> String {
    "vllm".to_string()
}

fn default_dataset_name() -> String {
    "random".to_string()
}

fn default_result_filename() -> String {
    "results.json".to_string()
}

fn default_sampler_command() -> String {
    "python3".to_string()
}

fn default_sampler_args_prefix() -> Vec<String> {
    vec!["mt-gmi-utilization.py".to_string()]
}

fn default_sampler_interval() -> u64 {
    2
}

fn default_sampler_stop_timeout() -> u64 {
    10
}

fn default_summary_filename() -> String {
    "result.log".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_monitor_stop_timeout_ms() -> u64 {
    5000
}

fn default_cooldown_ms() -> u64 {
    10_000
}

fn default_output_root() -> PathBuf {
    PathBuf::from("bench_logs")
}

fn default_write_metrics() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bench: BenchConfig::default(),
            plan: PlanConfig::default(),
            gpu_sampler: default_gpu_sampler(),
            monitor: MonitorConfig::default(),
            server: ServerConfig::default(),
            thresholds: None,
            cooldown_ms: default_cooldown_ms(),
            continue_on_failure: false,
            output_root: default_output_root(),
            write_metrics: default_write_metrics(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON or YAML file (by extension)
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&contents, is_yaml(path))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(contents: &str, yaml: bool) -> Result<Self> {
        if yaml {
            Ok(serde_yaml::from_str(contents)?)
        } else {
            Ok(serde_json::from_str(contents)?)
        }
    }

    /// Warn about settings that are legal but probably unintended.
    pub fn validate(&self) {
        if self.cooldown_ms == 0 {
            warn!("cooldown_ms is 0; passes may be skewed by the previous pass's tail load");
        }
        if let Some(sampler) = &self.gpu_sampler
            && sampler.interval_secs == 0
        {
            warn!("gpu_sampler.interval_secs is 0; the sampler may busy-loop");
        }
        if self.monitor.poll_interval_ms == 0 {
            warn!("monitor.poll_interval_ms is 0; the monitor will poll continuously");
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub model_path: String,
    pub gpu_count: u32,
    pub model_name: Option<String>,
    pub precision: Option<String>,
    pub host: String,
    pub port: u16,
    pub thresholds: Option<String>,
    pub tensor_parallel_size: Option<u32>,
    pub output_root: Option<PathBuf>,
    pub launch_server: bool,
    pub no_gpu_sampler: bool,
}

/// Everything the batch driver needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub model_path: String,
    pub model_name: String,
    pub gpu_count: u32,
    pub tensor_parallel_size: u32,
    pub precision: String,
    pub host: String,
    pub port: u16,
    pub thresholds: Thresholds,
    pub bench: BenchConfig,
    pub gpu_sampler: Option<SamplerConfig>,
    pub monitor: MonitorConfig,
    /// Set when the driver should launch the inference server itself
    pub server: Option<ServerConfig>,
    pub cooldown: Duration,
    pub continue_on_failure: bool,
    pub write_metrics: bool,
    pub layout: RunLayout,
}

impl BatchSettings {
    /// Merge CLI overrides into the loaded config.
    pub fn resolve(config: &Config, overrides: RunOverrides) -> Result<Self> {
        if overrides.model_path.trim().is_empty() {
            bail!("model path must not be empty");
        }
        if overrides.gpu_count == 0 {
            bail!("GPU count must be at least 1");
        }

        let threshold_spec = overrides
            .thresholds
            .as_deref()
            .or(config.thresholds.as_deref())
            .unwrap_or("");
        let thresholds: Thresholds = threshold_spec
            .parse()
            .with_context(|| format!("Invalid threshold specification '{threshold_spec}'"))?;

        let model_name = overrides
            .model_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| model_name_from_path(&overrides.model_path));
        let tensor_parallel_size = overrides
            .tensor_parallel_size
            .or(config.server.tensor_parallel_size)
            .unwrap_or(overrides.gpu_count);
        let precision = overrides
            .precision
            .or_else(|| config.server.dtype.clone())
            .unwrap_or_else(|| "auto".to_string());
        let output_root = overrides
            .output_root
            .unwrap_or_else(|| config.output_root.clone());

        let layout = RunLayout::new(
            &output_root,
            &model_name,
            tensor_parallel_size,
            &precision,
            chrono::Local::now(),
            &config.bench.result_filename,
        );

        Ok(Self {
            model_path: overrides.model_path,
            model_name,
            gpu_count: overrides.gpu_count,
            tensor_parallel_size,
            precision,
            host: overrides.host,
            port: overrides.port,
            thresholds,
            bench: config.bench.clone(),
            gpu_sampler: if overrides.no_gpu_sampler {
                None
            } else {
                config.gpu_sampler.clone()
            },
            monitor: config.monitor.clone(),
            server: overrides.launch_server.then(|| config.server.clone()),
            cooldown: Duration::from_millis(config.cooldown_ms),
            continue_on_failure: config.continue_on_failure,
            write_metrics: config.write_metrics,
            layout,
        })
    }

    /// Metadata recorded with every pass (client results and GPU summaries).
    pub fn pass_metadata(&self, task: &crate::types::Task) -> BTreeMap<String, String> {
        let mut metadata = self.bench.metadata.clone();
        metadata.insert("model_name".to_string(), self.model_name.clone());
        metadata.insert("precision".to_string(), self.precision.clone());
        metadata.insert("tp".to_string(), self.tensor_parallel_size.to_string());
        metadata.insert("gpu_count".to_string(), self.gpu_count.to_string());
        metadata.insert("concurrency".to_string(), task.concurrency.to_string());
        metadata.insert("input_len".to_string(), task.input_len.to_string());
        metadata.insert("output_len".to_string(), task.output_len.to_string());
        metadata.insert("num_requests".to_string(), task.num_requests.to_string());
        metadata
    }
}

/// Last path segment of a model path, e.g. `/data/models/Qwen3-8B/` → `Qwen3-8B`.
pub fn model_name_from_path(model_path: &str) -> String {
    model_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(model_path)
        .to_string()
}
