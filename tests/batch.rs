//! End-to-end batch tests.
//!
//! Drives the real driver with the `mock-bench` binary as the benchmark
//! client and small `sh` scripts standing in for the GPU sampler.

#![cfg(unix)]

use llmbench::{
    BatchDriver, BatchSettings, BenchError, CommandRunner, Config, PassStatus, PlanConfig,
    RunOverrides, SamplerConfig,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

// ── Helpers ─────────────────────────────────────────────────────────────────

const MOCK_BENCH: &str = env!("CARGO_BIN_EXE_mock-bench");

/// Parses `--log-path` and the combination metadata, then idles until SIGINT.
const SAMPLER_PRELUDE: &str = r#"
out=""; c=""; i=""; o=""
while [ $# -gt 0 ]; do
  case "$1" in
    --log-path) out="$2"; shift 2 ;;
    concurrency=*) c="${1#concurrency=}"; shift ;;
    input_len=*) i="${1#input_len=}"; shift ;;
    output_len=*) o="${1#output_len=}"; shift ;;
    *) shift ;;
  esac
done
"#;

/// Writes a Python-literal summary line on SIGINT, like the real sampler.
const SAMPLER_SUMMARY: &str = r#"
trap 'printf "{\047concurrency\047: \047%s\047, \047input_len\047: \047%s\047, \047output_len\047: \047%s\047, \047gpu_nums\047: 1, \047gpu_usage_avg\047: 87.5, \047temperature_avg\047: 55.0, \047total_memory_avg\047: 81920.0, \047used_memory_avg\047: 40000.0, \047filtered\047: True}\n" "$c" "$i" "$o" >> "$out/result.log"; exit 0' INT
while true; do sleep 0.05; done
"#;

/// Interrupted before any sample was kept: empty summary.
const SAMPLER_EMPTY: &str = r#"
trap ': >> "$out/result.log"; exit 0' INT
while true; do sleep 0.05; done
"#;

struct Bench {
    dir: tempfile::TempDir,
}

impl Bench {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn sampler(&self, body: &str) -> SamplerConfig {
        let path = self.dir.path().join("sampler.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{SAMPLER_PRELUDE}{body}")).unwrap();
        SamplerConfig {
            command: "sh".to_string(),
            args_prefix: vec![path.display().to_string()],
            interval_secs: 1,
            stop_timeout_secs: 5,
            ..SamplerConfig::default()
        }
    }

    fn config(&self, mock_args: &[&str], sampler: Option<SamplerConfig>, levels: &[u32]) -> Config {
        let mut config = Config {
            gpu_sampler: sampler,
            cooldown_ms: 0,
            plan: PlanConfig {
                scenes: vec![vec![128, 64]],
                concurrency: levels.to_vec(),
                ..PlanConfig::default()
            },
            ..Config::default()
        };
        config.bench.command = MOCK_BENCH.to_string();
        config.bench.extra_args = mock_args.iter().map(|s| s.to_string()).collect();
        config.monitor.poll_interval_ms = 20;
        config
    }

    fn settings(&self, config: &Config, thresholds: Option<&str>) -> BatchSettings {
        BatchSettings::resolve(
            config,
            RunOverrides {
                model_path: "/models/mock-model".to_string(),
                gpu_count: 1,
                host: "127.0.0.1".to_string(),
                port: 8000,
                thresholds: thresholds.map(str::to_string),
                output_root: Some(self.dir.path().join("logs")),
                ..RunOverrides::default()
            },
        )
        .unwrap()
    }
}

fn records(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn concurrencies(records: &[Value]) -> Vec<String> {
    records
        .iter()
        .map(|r| r["concurrency"].as_str().unwrap().to_string())
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_violation_stops_escalation_and_merges_gpu_stats() {
    let bench = Bench::new();
    // p99 ttft = 130 + 10 × concurrency: 140, 210, 450, 770
    let config = bench.config(
        &[
            "--ttft-base-ms",
            "130",
            "--ttft-per-concurrency-ms",
            "10",
            "--duration-ms",
            "100",
        ],
        Some(bench.sampler(SAMPLER_SUMMARY)),
        &[1, 8, 32, 64],
    );
    let settings = bench.settings(&config, Some("ttft:400 tpot:50"));
    let layout = settings.layout.clone();
    let tasks = config.plan.build_tasks().unwrap();

    let driver = BatchDriver::new(settings, CommandRunner::new());
    let summary = driver.run(&tasks).await.unwrap();

    let statuses: Vec<PassStatus> = summary.passes.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![
            PassStatus::Completed,
            PassStatus::Completed,
            PassStatus::Violated,
            PassStatus::Skipped
        ]
    );

    // concurrency=64 never reached the client
    let results = records(&layout.results_file());
    assert_eq!(concurrencies(&results), vec!["1", "8", "32"]);
    assert!(!layout.client_log(&tasks[3].combination()).exists());
    assert!(layout.client_log(&tasks[2].combination()).exists());

    // Every executed pass got its GPU summary
    for record in &results {
        assert_eq!(record["gpu_usage_avg"], serde_json::json!(87.5));
        assert_eq!(record["gpu_nums"], serde_json::json!(1));
    }
    assert!(
        layout
            .gpu_dir(&tasks[2].combination())
            .join("result.log")
            .exists()
    );

    assert!(!layout.signal_file().exists());
    assert_eq!(summary.pairs[0].violated_at, Some(32));
    assert_eq!(summary.pairs[0].last_within, Some(8));

    let best = records(&layout.best_file());
    assert_eq!(concurrencies(&best), vec!["8"]);

    let written: Value =
        serde_json::from_str(&std::fs::read_to_string(layout.summary_file()).unwrap()).unwrap();
    assert_eq!(written["passes"][2]["status"], serde_json::json!("violated"));
    assert_eq!(written["passes"][2]["gpu_merge"], serde_json::json!("merged"));
}

#[tokio::test]
async fn test_without_thresholds_every_level_runs() {
    let bench = Bench::new();
    let config = bench.config(&["--ttft-base-ms", "5000"], None, &[1, 2, 4]);
    let settings = bench.settings(&config, None);
    let layout = settings.layout.clone();
    let tasks = config.plan.build_tasks().unwrap();

    let summary = BatchDriver::new(settings, CommandRunner::new())
        .run(&tasks)
        .await
        .unwrap();

    assert_eq!(summary.count(PassStatus::Completed), 3);
    assert_eq!(concurrencies(&records(&layout.results_file())), vec!["1", "2", "4"]);
    assert_eq!(concurrencies(&records(&layout.best_file())), vec!["4"]);
    assert!(summary.best_throughput.is_some());
}

#[tokio::test]
async fn test_signal_does_not_leak_between_pairs() {
    let bench = Bench::new();
    let mut config = bench.config(
        &["--ttft-base-ms", "0", "--ttft-per-concurrency-ms", "100"],
        None,
        &[2, 8],
    );
    config.plan.scenes = vec![vec![128, 64], vec![256, 32]];
    let settings = bench.settings(&config, Some("ttft:500"));
    let tasks = config.plan.build_tasks().unwrap();

    let summary = BatchDriver::new(settings, CommandRunner::new())
        .run(&tasks)
        .await
        .unwrap();

    // Each pair: c=2 → 200ms (ok), c=8 → 800ms (violated). The second
    // pair's c=2 pass must not inherit the first pair's signal.
    let statuses: Vec<(u32, PassStatus)> = summary
        .passes
        .iter()
        .map(|p| (p.concurrency, p.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (2, PassStatus::Completed),
            (8, PassStatus::Violated),
            (2, PassStatus::Completed),
            (8, PassStatus::Violated),
        ]
    );
}

#[tokio::test]
async fn test_runner_failure_aborts_batch() {
    let bench = Bench::new();
    let config = bench.config(&["--fail-at-concurrency", "2"], None, &[1, 2, 4]);
    let settings = bench.settings(&config, None);
    let layout = settings.layout.clone();
    let tasks = config.plan.build_tasks().unwrap();

    let err = BatchDriver::new(settings, CommandRunner::new())
        .run(&tasks)
        .await
        .unwrap_err();

    match err {
        BenchError::RunnerFailed {
            combination, log, ..
        } => {
            assert_eq!(combination.concurrency, 2);
            let log = std::fs::read_to_string(log).unwrap();
            assert!(log.contains("mock failure"));
        }
        other => panic!("expected RunnerFailed, got {other:?}"),
    }
    assert_eq!(concurrencies(&records(&layout.results_file())), vec!["1"]);
}

#[tokio::test]
async fn test_continue_on_failure_records_failed_pass() {
    let bench = Bench::new();
    let mut config = bench.config(&["--fail-at-concurrency", "2"], None, &[1, 2, 4]);
    config.continue_on_failure = true;
    let settings = bench.settings(&config, None);
    let tasks = config.plan.build_tasks().unwrap();

    let summary = BatchDriver::new(settings, CommandRunner::new())
        .run(&tasks)
        .await
        .unwrap();

    assert_eq!(summary.count(PassStatus::Failed), 1);
    assert_eq!(summary.count(PassStatus::Completed), 2);
    assert_eq!(summary.passes[1].status, PassStatus::Failed);
}

#[tokio::test]
async fn test_empty_gpu_summary_leaves_fields_absent() {
    let bench = Bench::new();
    let config = bench.config(
        &["--duration-ms", "200"],
        Some(bench.sampler(SAMPLER_EMPTY)),
        &[1],
    );
    let settings = bench.settings(&config, None);
    let layout = settings.layout.clone();
    let tasks = config.plan.build_tasks().unwrap();

    let summary = BatchDriver::new(settings, CommandRunner::new())
        .run(&tasks)
        .await
        .unwrap();

    assert_eq!(summary.passes[0].status, PassStatus::Completed);
    assert_eq!(summary.passes[0].gpu_merge.as_deref(), Some("no_gpu_data"));
    let results = records(&layout.results_file());
    assert_eq!(results.len(), 1);
    assert!(results[0].get("gpu_usage_avg").is_none());
}

/// Live (non-zombie) processes whose command line mentions `needle`.
#[cfg(target_os = "linux")]
fn live_processes_mentioning(needle: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap().flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if !String::from_utf8_lossy(&cmdline).contains(needle) {
            continue;
        }
        let live = std::fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.trim_start().chars().next()
            })
            .is_some_and(|state| !matches!(state, 'Z' | 'X'));
        if live {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropped_batch_kills_collaborators() {
    let bench = Bench::new();
    let config = bench.config(
        &["--duration-ms", "5000"],
        Some(bench.sampler(SAMPLER_SUMMARY)),
        &[1, 2],
    );
    let settings = bench.settings(&config, Some("ttft:1"));
    let layout = settings.layout.clone();
    let root = layout.root().display().to_string();
    let tasks = config.plan.build_tasks().unwrap();

    let driver = BatchDriver::new(settings, CommandRunner::new());
    let mut run = Box::pin(driver.run(&tasks));
    tokio::select! {
        result = &mut run => panic!("batch finished early: {result:?}"),
        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
    }
    // Client and sampler are both mid-pass
    assert!(live_processes_mentioning(&root).len() >= 2);

    drop(run);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let survivors = live_processes_mentioning(&root);
    assert!(survivors.is_empty(), "still running: {survivors:?}");
    assert!(!layout.signal_file().exists());
    assert!(records(&layout.results_file()).is_empty());
}

// ── CLI ─────────────────────────────────────────────────────────────────────

fn llmbench() -> std::process::Command {
    std::process::Command::new(env!("CARGO_BIN_EXE_llmbench"))
}

fn run_dir(output_root: &Path) -> PathBuf {
    std::fs::read_dir(output_root)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path()
}

#[test]
fn test_cli_run_prints_run_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bench.yaml");
    std::fs::write(
        &config_path,
        format!(
            "bench:\n  command: {MOCK_BENCH}\n  args_prefix: []\n  extra_args: [\"--ttft-per-concurrency-ms\", \"100\"]\nplan:\n  scenes: [[64, 16]]\n  concurrency: [1, 4, 8]\ngpu_sampler: null\ncooldown_ms: 0\nmonitor:\n  poll_interval_ms: 20\n"
        ),
    )
    .unwrap();
    let output_root = dir.path().join("logs");

    let output = llmbench()
        .args(["run", "--model-path", "/models/tiny", "--gpu-count", "2"])
        .args(["--threshold", "ttft:400", "--config"])
        .arg(&config_path)
        .arg("--output-root")
        .arg(&output_root)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Run directory:"));

    let run_dir = run_dir(&output_root);
    let name = run_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("tiny_tp2_auto_"), "{name}");

    // ttft = 50 + 100 × c: 150 ok, 450 violated, 8 skipped
    let results = records(&run_dir.join("results.json"));
    assert_eq!(concurrencies(&results), vec!["1", "4"]);
    assert!(run_dir.join("metrics.prom").exists());
}

#[test]
fn test_cli_search_finds_highest_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("bench.yaml");
    std::fs::write(
        &config_path,
        format!(
            "bench:\n  command: {MOCK_BENCH}\n  args_prefix: []\n  extra_args: [\"--ttft-per-concurrency-ms\", \"100\"]\ngpu_sampler: null\ncooldown_ms: 0\nmonitor:\n  poll_interval_ms: 20\n"
        ),
    )
    .unwrap();
    let output_root = dir.path().join("logs");

    let output = llmbench()
        .args(["search", "--model-path", "/models/tiny", "--gpu-count", "1"])
        .args(["--input-len", "64", "--output-len", "16"])
        .args(["--min-concurrency", "1", "--max-concurrency", "8"])
        .args(["--threshold", "ttft:400", "--config"])
        .arg(&config_path)
        .arg("--output-root")
        .arg(&output_root)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Best concurrency for in64_out16: 3"), "{stdout}");

    // ttft = 50 + 100 × c: 4 breaches, 2 and 3 stay under 400
    let run_dir = run_dir(&output_root);
    let results = records(&run_dir.join("results.json"));
    assert_eq!(concurrencies(&results), vec!["4", "2", "3"]);
    assert_eq!(concurrencies(&records(&run_dir.join("best.jsonl"))), vec!["3"]);
}

#[test]
fn test_cli_search_requires_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let output = llmbench()
        .args(["search", "--model-path", "/m", "--gpu-count", "1"])
        .args(["--input-len", "64", "--output-len", "16", "--output-root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("at least one threshold"));
}

#[test]
fn test_cli_rejects_bad_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let output = llmbench()
        .args(["run", "--model-path", "/m", "--gpu-count", "1"])
        .args(["--threshold", "latency:5", "--output-root"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown threshold metric"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_cli_tasks_prints_plan() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("plan.json");
    std::fs::write(
        &config_path,
        r#"{"plan": {"mode": "custom", "scenes": [[512, 64, 16]], "request_num": "x3"}}"#,
    )
    .unwrap();

    let output = llmbench()
        .args(["tasks", "--config"])
        .arg(&config_path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let tasks: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(tasks[0]["concurrency"], serde_json::json!(16));
    assert_eq!(tasks[0]["num_requests"], serde_json::json!(48));
    assert_eq!(tasks[0]["task_mode"], serde_json::json!("custom"));
}

#[test]
fn test_cli_merge() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.json");
    let gpu_log = dir.path().join("result.log");
    std::fs::write(
        &results,
        r#"{"concurrency": "4", "input_len": "64", "output_len": "16", "p99_ttft_ms": 12.0}"#,
    )
    .unwrap();
    std::fs::write(
        &gpu_log,
        "{'concurrency': '4', 'input_len': '64', 'output_len': '16', 'gpu_usage_avg': 70.0}\n",
    )
    .unwrap();

    let output = llmbench()
        .args(["merge", "--json"])
        .arg(&results)
        .arg("--gpu-log")
        .arg(&gpu_log)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "merged");
    assert_eq!(records(&results)[0]["gpu_usage_avg"], serde_json::json!(70.0));
}

#[test]
fn test_cli_serve_dry_run() {
    let output = llmbench()
        .args(["serve", "--model-path", "/models/qwen", "--port", "9000"])
        .args(["--tp", "2", "--precision", "bf16", "--dry-run"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let line = String::from_utf8_lossy(&output.stdout);
    assert!(line.starts_with("vllm serve /models/qwen --served-model-name qwen"));
    assert!(line.contains("--tensor-parallel-size 2"));
    assert!(line.contains("--dtype bf16"));
}
