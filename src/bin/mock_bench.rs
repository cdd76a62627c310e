//! Mock benchmark client for testing llmbench
//!
//! Accepts the `vllm bench serve` flags llmbench generates and appends one
//! vLLM-style result record to `{result_dir}/{result_filename}`. Latencies
//! are synthetic and grow linearly with concurrency:
//!
//! ```text
//! p99_ttft_ms = ttft_base_ms + ttft_per_concurrency_ms × max_concurrency
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-bench")]
#[command(about = "Mock benchmark client for testing")]
struct Args {
    /// Leading subcommand words (e.g. `bench serve`), accepted and ignored
    #[arg(hide = true)]
    words: Vec<String>,

    #[arg(long, default_value = "vllm")]
    backend: String,

    #[arg(long, default_value = "mock-model")]
    model: String,

    #[arg(long)]
    served_model_name: Option<String>,

    #[arg(long, default_value = "random")]
    dataset_name: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8000")]
    port: u16,

    #[arg(long, default_value = "1")]
    max_concurrency: u32,

    #[arg(long, default_value = "1")]
    num_prompts: u32,

    #[arg(long, default_value = "1024")]
    random_input_len: u32,

    #[arg(long, default_value = "128")]
    random_output_len: u32,

    #[arg(long)]
    save_result: bool,

    #[arg(long)]
    append_result: bool,

    #[arg(long, default_value = ".")]
    result_dir: PathBuf,

    #[arg(long, default_value = "results.json")]
    result_filename: String,

    /// `key=value` pairs copied into the record as strings
    #[arg(long, num_args = 0..)]
    metadata: Vec<String>,

    /// Synthetic p99 TTFT at zero concurrency (ms)
    #[arg(long, default_value = "50")]
    ttft_base_ms: f64,

    /// Synthetic p99 TTFT added per concurrent request (ms)
    #[arg(long, default_value = "10")]
    ttft_per_concurrency_ms: f64,

    /// Synthetic p99 TPOT (ms)
    #[arg(long, default_value = "5")]
    tpot_ms: f64,

    /// Exit non-zero without writing a record at this concurrency
    #[arg(long)]
    fail_at_concurrency: Option<u32>,

    /// Simulated benchmark duration (ms)
    #[arg(long, default_value = "0")]
    duration_ms: u64,
}

fn record(args: &Args) -> Value {
    let concurrency = f64::from(args.max_concurrency);
    let ttft = args.ttft_base_ms + args.ttft_per_concurrency_ms * concurrency;
    let e2el = ttft + args.tpot_ms * f64::from(args.random_output_len);
    let tokens = f64::from(args.num_prompts)
        * f64::from(args.random_input_len + args.random_output_len);
    let duration_s = (e2el / 1000.0) * (f64::from(args.num_prompts) / concurrency).ceil();

    let mut fields = Map::new();
    for item in &args.metadata {
        if let Some((key, value)) = item.split_once('=') {
            fields.insert(key.to_string(), json!(value));
        }
    }
    let measured = json!({
        "backend": args.backend,
        "model_id": args.model,
        "served_model_name": args.served_model_name.as_deref().unwrap_or(&args.model),
        "dataset_name": args.dataset_name,
        "max_concurrency": args.max_concurrency,
        "num_prompts": args.num_prompts,
        "completed": args.num_prompts,
        "duration": duration_s,
        "total_token_throughput": tokens / duration_s,
        "mean_ttft_ms": ttft * 0.8,
        "median_ttft_ms": ttft * 0.75,
        "p99_ttft_ms": ttft,
        "mean_tpot_ms": args.tpot_ms * 0.8,
        "median_tpot_ms": args.tpot_ms * 0.75,
        "p99_tpot_ms": args.tpot_ms,
        "mean_e2el_ms": e2el * 0.8,
        "median_e2el_ms": e2el * 0.75,
        "p99_e2el_ms": e2el,
    });
    if let Value::Object(measured) = measured {
        fields.extend(measured);
    }
    Value::Object(fields)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_bench=debug")
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(
        host = %args.host,
        port = args.port,
        concurrency = args.max_concurrency,
        num_prompts = args.num_prompts,
        "Running mock benchmark"
    );

    if args.duration_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.duration_ms)).await;
    }

    if args.fail_at_concurrency == Some(args.max_concurrency) {
        eprintln!("mock failure at concurrency {}", args.max_concurrency);
        std::process::exit(2);
    }

    if !args.save_result {
        println!("{}", record(&args));
        return Ok(());
    }

    tokio::fs::create_dir_all(&args.result_dir).await?;
    let path = args.result_dir.join(&args.result_filename);
    let existing = if args.append_result {
        tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(args.append_result)
        .truncate(!args.append_result)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    // vLLM separates appended records with a newline and leaves the last
    // one unterminated
    let mut body = if existing > 0 { "\n".to_string() } else { String::new() };
    body.push_str(&record(&args).to_string());
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;

    info!(path = %path.display(), "Wrote result record");
    Ok(())
}
