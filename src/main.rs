//! llmbench - Threshold-driven concurrency sweeps for LLM inference servers
//!
//! This binary runs benchmark passes against an inference server, escalating
//! concurrency per length pair until a latency objective is violated, and
//! exposes the monitor, merger, task planner and server launcher standalone.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use llmbench::{
    BatchDriver, BatchSettings, BatchSummary, BenchError, BestRecords, CommandRunner, Config,
    LengthPair, RequestNum, RunOverrides, SearchOutcome, SearchRange, ServerHandle, SignalFile,
    Statistic, ThresholdMonitor, Thresholds, merge_gpu_into_results, model_name_from_path,
    monitor::{DEFAULT_SEEN_LIMIT, JsonTail},
    telemetry,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long the inference server gets to exit after SIGINT
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "llmbench")]
#[command(about = "Threshold-driven concurrency sweeps for LLM inference servers")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (includes collaborator output)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a benchmark batch
    Run(RunArgs),

    /// Bisect the highest concurrency within thresholds for one length pair
    Search(SearchArgs),

    /// Watch a results file and raise a signal file on threshold violations
    Monitor {
        /// Results file to tail
        #[arg(long)]
        log_file: PathBuf,

        /// Latency objectives, e.g. "ttft:400 tpot:50"
        #[arg(long)]
        threshold: String,

        /// Signal file to create on violation
        #[arg(long)]
        signal_file: PathBuf,

        #[arg(long, value_enum, default_value_t = Statistic::P99)]
        statistic: Statistic,

        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Evaluate records already in the file, not just new ones
        #[arg(long)]
        from_start: bool,

        /// Best record within thresholds per length pair (JSON lines)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Signalled combinations remembered before the oldest are forgotten
        #[arg(long, default_value_t = DEFAULT_SEEN_LIMIT)]
        max_seen_size: usize,
    },

    /// Merge a GPU sampler summary into the last results record
    Merge {
        /// Results file (JSON lines)
        #[arg(long)]
        json: PathBuf,

        /// GPU sampler summary log
        #[arg(long)]
        gpu_log: PathBuf,
    },

    /// Print the task list a config resolves to
    Tasks {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Launch the inference server in the foreground
    Serve {
        #[arg(long)]
        model_path: String,

        #[arg(long)]
        model_name: Option<String>,

        #[arg(long)]
        precision: Option<String>,

        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value = "8000")]
        port: u16,

        /// Tensor-parallel degree (default: config, then 1)
        #[arg(long)]
        tp: Option<u32>,

        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "server.log")]
        log_file: PathBuf,

        /// Print the command line and exit
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Model path passed to the benchmark client (and server)
    #[arg(long)]
    model_path: String,

    /// Number of GPUs the server uses
    #[arg(long)]
    gpu_count: u32,

    /// Served model name (default: last segment of the model path)
    #[arg(long)]
    model_name: Option<String>,

    /// Precision tag recorded with results (default: auto)
    #[arg(long)]
    precision: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8000")]
    port: u16,

    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Latency objectives, e.g. "ttft:400 tpot:50" (overrides config)
    #[arg(long)]
    threshold: Option<String>,

    /// Tensor-parallel degree (default: GPU count)
    #[arg(long)]
    tp: Option<u32>,

    /// Directory for per-run output (overrides config)
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Start the inference server before the batch and stop it after
    #[arg(long)]
    launch_server: bool,

    /// Do not run the GPU sampler
    #[arg(long)]
    no_gpu_sampler: bool,
}

#[derive(ClapArgs, Debug)]
struct SearchArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long)]
    input_len: u32,

    #[arg(long)]
    output_len: u32,

    #[arg(long, default_value = "1")]
    min_concurrency: u32,

    #[arg(long, default_value = "128")]
    max_concurrency: u32,

    /// Requests per pass: auto or xN (default: config plan)
    #[arg(long)]
    request_num: Option<RequestNum>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Collaborator output is logged under the "bench", "sampler" and "server"
    // targets at debug level, e.g. RUST_LOG=info,bench=debug.
    let filter = if args.verbose {
        EnvFilter::new("llmbench=debug,bench=debug,sampler=debug,server=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run) => run_batch(run).await,
        Commands::Search(search) => run_search(search).await,
        Commands::Monitor {
            log_file,
            threshold,
            signal_file,
            statistic,
            poll_interval_ms,
            from_start,
            output,
            max_seen_size,
        } => {
            let thresholds: Thresholds = threshold
                .parse()
                .with_context(|| format!("Invalid threshold specification '{threshold}'"))?;
            if thresholds.is_empty() {
                info!("No thresholds configured; nothing to monitor");
                return Ok(());
            }
            let tail = if from_start {
                JsonTail::new(&log_file)
            } else {
                JsonTail::from_end(&log_file)
            };
            info!(
                log_file = %log_file.display(),
                signal_file = %signal_file.display(),
                thresholds = %thresholds,
                "Monitoring results file"
            );
            let mut monitor = ThresholdMonitor::new(
                tail,
                thresholds,
                SignalFile::new(signal_file),
                statistic,
            )
            .with_seen_limit(max_seen_size);
            if let Some(output) = output {
                let best = BestRecords::load(&output).await?;
                if !best.is_empty() {
                    info!(pairs = best.len(), output = %output.display(), "Loaded existing best records");
                }
                monitor = monitor.with_best_output(best, output);
            }
            let report = monitor
                .run_until(Duration::from_millis(poll_interval_ms), shutdown_signal())
                .await;
            info!(
                records = report.records_seen,
                violations = report.violations.len(),
                best_updates = report.best_updates,
                "Monitor stopped"
            );
            Ok(())
        }
        Commands::Merge { json, gpu_log } => {
            let outcome = merge_gpu_into_results(&json, &gpu_log).await?;
            println!("{}", outcome.as_str());
            Ok(())
        }
        Commands::Tasks { config } => {
            let config = load_config(config.as_deref()).await?;
            let tasks = config.plan.resolve().await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            Ok(())
        }
        Commands::Serve {
            model_path,
            model_name,
            precision,
            host,
            port,
            tp,
            config,
            log_file,
            dry_run,
        } => {
            let config = load_config(config.as_deref()).await?;
            let model_name = model_name.unwrap_or_else(|| model_name_from_path(&model_path));
            let tp = tp.or(config.server.tensor_parallel_size).unwrap_or(1);
            let precision = precision.unwrap_or_else(|| "auto".to_string());
            let server = config.server.resolved(&model_name, tp, &precision);

            if dry_run {
                let mut line = vec![server.command.clone()];
                line.extend(server.build_args(&model_path, &host, port));
                println!("{}", line.join(" "));
                return Ok(());
            }

            let mut handle = ServerHandle::launch(&server, &model_path, &host, port, &log_file)
                .await
                .context("Failed to launch inference server")?;
            info!(log = %log_file.display(), "Inference server running; Ctrl-C to stop");
            tokio::select! {
                status = handle.wait() => {
                    warn!(status = ?status, "Inference server exited");
                }
                _ = shutdown_signal() => {
                    handle.shutdown(SERVER_STOP_TIMEOUT).await;
                }
            }
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.validate();
    Ok(config)
}

fn overrides(args: RunArgs) -> RunOverrides {
    RunOverrides {
        model_path: args.model_path,
        gpu_count: args.gpu_count,
        model_name: args.model_name,
        precision: args.precision,
        host: args.host,
        port: args.port,
        thresholds: args.threshold,
        tensor_parallel_size: args.tp,
        output_root: args.output_root,
        launch_server: args.launch_server,
        no_gpu_sampler: args.no_gpu_sampler,
    }
}

fn log_settings(settings: &BatchSettings) {
    info!(
        model = %settings.model_name,
        tp = settings.tensor_parallel_size,
        precision = %settings.precision,
        endpoint = %format!("{}:{}", settings.host, settings.port),
        thresholds = %settings.thresholds,
        "Configuration loaded"
    );
}

fn install_metrics(settings: &BatchSettings) -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    if settings.write_metrics {
        telemetry::install()
    } else {
        None
    }
}

async fn run_batch(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref()).await?;
    let settings = BatchSettings::resolve(&config, overrides(args))?;
    let tasks = config.plan.resolve().await.context("Failed to build task plan")?;
    log_settings(&settings);

    let metrics = install_metrics(&settings);
    let run_dir = settings.layout.root().to_path_buf();

    // Cancelling the batch drops every owned collaborator handle, which
    // kills their process groups.
    let result = tokio::select! {
        result = execute(settings, &tasks, metrics) => result,
        _ = shutdown_signal() => Err(anyhow!(BenchError::Interrupted)),
    };

    println!("Run directory: {}", run_dir.display());
    result
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let config = load_config(args.run.config.as_deref()).await?;
    let range = SearchRange::new(args.min_concurrency, args.max_concurrency)?;
    let request_num = args.request_num.unwrap_or(config.plan.request_num);
    let pair = LengthPair {
        input_len: args.input_len,
        output_len: args.output_len,
    };
    if pair.input_len == 0 || pair.output_len == 0 {
        bail!("input and output lengths must be positive");
    }
    let settings = BatchSettings::resolve(&config, overrides(args.run))?;
    if settings.thresholds.is_empty() {
        bail!("search needs at least one threshold (--threshold or config)");
    }
    log_settings(&settings);

    let metrics = install_metrics(&settings);
    let run_dir = settings.layout.root().to_path_buf();

    let result = tokio::select! {
        result = execute_search(settings, pair, range, request_num, metrics) => result,
        _ = shutdown_signal() => Err(anyhow!(BenchError::Interrupted)),
    };

    println!("Run directory: {}", run_dir.display());
    result
}

async fn execute_search(
    settings: BatchSettings,
    pair: LengthPair,
    range: SearchRange,
    request_num: RequestNum,
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> Result<()> {
    let server = llmbench::start_server(&settings).await?;
    let driver = BatchDriver::new(settings, CommandRunner::new()).with_metrics(metrics);

    let result = driver.search(pair, range, request_num).await;

    if let Some(server) = server {
        server.shutdown(SERVER_STOP_TIMEOUT).await;
    }

    print_search(&result?);
    Ok(())
}

fn print_search(outcome: &SearchOutcome) {
    println!();
    println!("{:>12} {:>10} {:>8}", "concurrency", "status", "within");
    for step in &outcome.steps {
        println!(
            "{:>12} {:>10} {:>8}",
            step.concurrency,
            step.status.as_str(),
            step.within
        );
    }
    match outcome.best_concurrency {
        Some(c) => println!("Best concurrency for {}: {c}", outcome.pair),
        None => println!("No concurrency for {} stayed within thresholds", outcome.pair),
    }
}

async fn execute(
    settings: BatchSettings,
    tasks: &[llmbench::Task],
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> Result<()> {
    let server = llmbench::start_server(&settings).await?;
    let driver = BatchDriver::new(settings, CommandRunner::new()).with_metrics(metrics);

    let result = driver.run(tasks).await;

    if let Some(server) = server {
        server.shutdown(SERVER_STOP_TIMEOUT).await;
    }

    let summary = result?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!(
        "{:>10} {:>10} {:>12} {:>12}",
        "input_len", "output_len", "last_within", "violated_at"
    );
    for pair in &summary.pairs {
        let show = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "{:>10} {:>10} {:>12} {:>12}",
            pair.input_len,
            pair.output_len,
            show(pair.last_within),
            show(pair.violated_at)
        );
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
