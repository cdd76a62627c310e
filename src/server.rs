//! Inference server launcher
//!
//! Optional: most batches run against a server the operator started. With
//! `run --launch-server` (or the `serve` subcommand) the server is spawned
//! in its own process group and polled on `GET /health` until ready.

use crate::process::{group_command, interrupt_and_wait, signal_group, spawn_logged};
use crate::types::BenchError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, error, info, trace, warn};

/// Timeout for a single readiness check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch the inference server.
///
/// ```yaml
/// server:
///   tensor_parallel_size: 4
///   dtype: bfloat16
///   default_params:
///     max_num_seqs: 256
///     enable_prefix_caching: true
///   extra_args: ["--trust-remote-code"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_command")]
    pub command: String,

    /// Arguments placed before the model path
    #[serde(default = "default_server_args_prefix")]
    pub args_prefix: Vec<String>,

    #[serde(default)]
    pub served_model_name: Option<String>,

    #[serde(default)]
    pub dtype: Option<String>,

    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,

    #[serde(default = "default_pipeline_parallel_size")]
    pub pipeline_parallel_size: u32,

    #[serde(default)]
    pub gpu_memory_utilization: Option<f32>,

    #[serde(default)]
    pub max_model_len: Option<u32>,

    /// Fallback flags, keyed by name (`max_num_seqs` or `--max-num-seqs`).
    /// Only applied when the flag is not already given explicitly.
    #[serde(default)]
    pub default_params: BTreeMap<String, Value>,

    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long to wait for `/health` after spawning
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

fn default_server_command() -> String {
    "vllm".to_string()
}

fn default_server_args_prefix() -> Vec<String> {
    vec!["serve".to_string()]
}

fn default_pipeline_parallel_size() -> u32 {
    1
}

fn default_ready_timeout() -> u64 {
    1800
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_server_command(),
            args_prefix: default_server_args_prefix(),
            served_model_name: None,
            dtype: None,
            tensor_parallel_size: None,
            pipeline_parallel_size: default_pipeline_parallel_size(),
            gpu_memory_utilization: None,
            max_model_len: None,
            default_params: BTreeMap::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Fill unset identity fields from the run's resolved settings.
    ///
    /// A precision of `auto` leaves `dtype` to the server.
    pub fn resolved(
        &self,
        served_model_name: &str,
        tensor_parallel_size: u32,
        precision: &str,
    ) -> Self {
        let mut config = self.clone();
        config
            .served_model_name
            .get_or_insert_with(|| served_model_name.to_string());
        config.tensor_parallel_size.get_or_insert(tensor_parallel_size);
        if config.dtype.is_none() && precision != "auto" {
            config.dtype = Some(precision.to_string());
        }
        config
    }

    /// Build the server command line (without the program itself).
    ///
    /// Explicit settings and `extra_args` come first; `default_params` fill
    /// in only flags that are still missing. `true` becomes a bare flag and
    /// `false`/`null` are dropped.
    pub fn build_args(&self, model_path: &str, host: &str, port: u16) -> Vec<String> {
        let mut args = self.args_prefix.clone();
        args.push(model_path.to_string());

        if let Some(name) = &self.served_model_name {
            args.extend(["--served-model-name".to_string(), name.clone()]);
        }
        args.extend([
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);
        if let Some(tp) = self.tensor_parallel_size {
            args.extend(["--tensor-parallel-size".to_string(), tp.to_string()]);
        }
        if self.pipeline_parallel_size > 1 {
            args.extend([
                "--pipeline-parallel-size".to_string(),
                self.pipeline_parallel_size.to_string(),
            ]);
        }
        if let Some(dtype) = &self.dtype {
            args.extend(["--dtype".to_string(), dtype.clone()]);
        }
        if let Some(util) = self.gpu_memory_utilization {
            args.extend(["--gpu-memory-utilization".to_string(), util.to_string()]);
        }
        if let Some(len) = self.max_model_len {
            args.extend(["--max-model-len".to_string(), len.to_string()]);
        }
        args.extend(self.extra_args.iter().cloned());

        for (key, value) in &self.default_params {
            let flag = flag_name(key);
            if args.iter().any(|a| is_same_flag(a, &flag)) {
                trace!(flag = %flag, "Default param overridden by explicit flag");
                continue;
            }
            match value {
                Value::Bool(true) => args.push(flag),
                Value::Bool(false) | Value::Null => {}
                Value::String(s) => args.extend([flag, s.clone()]),
                other => args.extend([flag, other.to_string()]),
            }
        }
        args
    }
}

/// `max_num_seqs` → `--max-num-seqs`
fn flag_name(key: &str) -> String {
    if key.starts_with("--") {
        key.to_string()
    } else {
        format!("--{}", key.replace('_', "-"))
    }
}

fn is_same_flag(arg: &str, flag: &str) -> bool {
    arg == flag
        || arg
            .strip_prefix(flag)
            .is_some_and(|rest| rest.starts_with('='))
}

/// A running inference server.
///
/// Dropping the handle kills the server's process group.
pub struct ServerHandle {
    child: Option<Child>,
    health_url: String,
    client: reqwest::Client,
}

impl ServerHandle {
    /// Spawn the server, appending its output to `log_path`.
    pub async fn launch(
        config: &ServerConfig,
        model_path: &str,
        host: &str,
        port: u16,
        log_path: &Path,
    ) -> Result<Self, BenchError> {
        let args = config.build_args(model_path, host, port);
        info!(command = %config.command, args = ?args, log = %log_path.display(), "Launching inference server");

        let mut cmd = group_command(&config.command);
        cmd.args(&args).envs(&config.env);
        let child = spawn_logged(cmd, "inference server", log_path, "server").await?;

        Ok(Self {
            child: Some(child),
            health_url: format!("http://{}:{port}/health", health_host(host)),
            client: reqwest::Client::new(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Poll `/health` until it succeeds, the server exits, or `timeout` passes.
    pub async fn wait_ready(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), BenchError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_health().await {
                info!(url = %self.health_url, "Inference server is ready");
                return Ok(());
            }

            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        error!(%status, "Inference server exited during startup");
                        self.child = None;
                        return Err(BenchError::Server(format!(
                            "process exited during startup with {status}"
                        )));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to check server process status"),
                }
            }

            if Instant::now() > deadline {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "Inference server startup timed out"
                );
                return Err(BenchError::Server(format!(
                    "not healthy after {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn check_health(&self) -> bool {
        match tokio::time::timeout(
            HEALTH_CHECK_TIMEOUT,
            self.client.get(&self.health_url).send(),
        )
        .await
        {
            Ok(Ok(response)) => {
                let ok = response.status().is_success();
                trace!(status = %response.status(), "Readiness check answered");
                ok
            }
            Ok(Err(e)) => {
                trace!(error = %e, "Readiness check failed");
                false
            }
            Err(_) => {
                trace!("Readiness check timed out");
                false
            }
        }
    }

    /// Wait for the server to exit on its own.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        let status = child.wait().await.ok();
        self.child = None;
        status
    }

    /// Interrupt the server's process group, escalating after `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let status = interrupt_and_wait(&mut child, timeout, "inference server").await;
        info!(status = ?status, "Inference server stopped");
        status
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(child) = self.child.take()
            && let Some(pid) = child.id()
        {
            debug!(pid, "Killing inference server on drop");
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
        }
    }
}

/// Wildcard bind addresses are checked on loopback.
fn health_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_build_args_explicit_flags_win() {
        let config: ServerConfig = serde_yaml::from_str(
            r#"
served_model_name: qwen
tensor_parallel_size: 4
dtype: bfloat16
default_params:
  max_num_seqs: 256
  dtype: float16
  enable_prefix_caching: true
  enforce_eager: false
  "--block-size": 64
extra_args: ["--max-num-seqs=128", "--trust-remote-code"]
"#,
        )
        .unwrap();

        let args = config.build_args("/models/qwen", "0.0.0.0", 8000);
        assert_eq!(&args[..2], ["serve", "/models/qwen"]);

        let joined = args.join(" ");
        assert!(joined.contains("--served-model-name qwen"));
        assert!(joined.contains("--tensor-parallel-size 4"));
        assert!(joined.contains("--dtype bfloat16"));
        assert!(!joined.contains("--dtype float16"));
        assert!(!joined.contains("--max-num-seqs 256"));
        assert!(joined.contains("--enable-prefix-caching"));
        assert!(!joined.contains("--enforce-eager"));
        assert!(joined.contains("--block-size 64"));
        assert!(!joined.contains("--pipeline-parallel-size"));
    }

    #[test]
    fn test_resolved_keeps_explicit_settings() {
        let config = ServerConfig {
            tensor_parallel_size: Some(2),
            ..ServerConfig::default()
        };
        let resolved = config.resolved("qwen", 8, "auto");
        assert_eq!(resolved.served_model_name.as_deref(), Some("qwen"));
        assert_eq!(resolved.tensor_parallel_size, Some(2));
        assert_eq!(resolved.dtype, None);

        assert_eq!(config.resolved("qwen", 8, "fp8").dtype.as_deref(), Some("fp8"));
    }

    #[test]
    fn test_health_host() {
        assert_eq!(health_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(health_host("10.1.2.3"), "10.1.2.3");
    }

    /// Answers every connection with `200 OK`.
    async fn healthy_endpoint() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        port
    }

    fn sh_server(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".to_string(),
            args_prefix: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            ..ServerConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let port = healthy_endpoint().await;

        let config = sh_server("sleep 30");
        let mut server = ServerHandle::launch(
            &config,
            "model",
            "127.0.0.1",
            port,
            &dir.path().join("server.log"),
        )
        .await
        .unwrap();

        server
            .wait_ready(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        let status = server.shutdown(Duration::from_secs(2)).await;
        assert!(status.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_reports_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = sh_server("echo 'no GPU'; exit 3");
        let mut server = ServerHandle::launch(
            &config,
            "model",
            "127.0.0.1",
            1,
            &dir.path().join("server.log"),
        )
        .await
        .unwrap();

        let err = server
            .wait_ready(Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Server(ref msg) if msg.contains("exited")));
    }
}
