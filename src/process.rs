//! Helpers for running external collaborators.
//!
//! Every collaborator is spawned in its own process group so signals reach
//! the whole tree (benchmark clients and samplers fork helpers). Output is
//! appended to a per-pass log file and forwarded as debug-level tracing
//! events under a per-collaborator target.

use crate::types::BenchError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Strip ANSI escape sequences from a string.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: `pid` is the leader of a process group we spawned.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

/// Create a command that starts a new process group with colour disabled.
pub(crate) fn group_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Spawn `cmd`, appending its stdout and stderr to `log_path`.
///
/// `what` names the collaborator in errors; `target` is used only for the
/// forwarded debug events.
pub(crate) async fn spawn_logged(
    mut cmd: Command,
    what: &str,
    log_path: &Path,
    target: &'static str,
) -> Result<Child, BenchError> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BenchError::io(parent, e))?;
    }
    let log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
        .map_err(|e| BenchError::io(log_path, e))?;

    let mut child = cmd.spawn().map_err(|source| BenchError::SpawnFailed {
        what: what.to_string(),
        source,
    })?;

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone(), target, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx, target, "stderr"));
    }
    tokio::spawn(write_log(log, rx));

    Ok(child)
}

async fn forward_lines<R>(
    stream: R,
    tx: mpsc::UnboundedSender<String>,
    target: &'static str,
    name: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let clean = strip_ansi(&line);
        match target {
            "bench" => debug!(target: "bench", stream = name, "{}", clean),
            "sampler" => debug!(target: "sampler", stream = name, "{}", clean),
            _ => debug!(target: "server", stream = name, "{}", clean),
        }
        if tx.send(clean).is_err() {
            break;
        }
    }
}

async fn write_log(mut log: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = log.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write collaborator log");
            return;
        }
    }
    let _ = log.flush().await;
}

/// Kills a process group when dropped unless disarmed.
///
/// `kill_on_drop` only reaches the direct child; this also reaches whatever
/// the child forked when a pass is cancelled mid-flight.
pub(crate) struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    pub(crate) fn new(child: &Child) -> Self {
        Self { pid: child.id() }
    }

    pub(crate) fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.take() {
            debug!(pid, "Killing process group of cancelled collaborator");
            signal_group(pid, libc::SIGKILL);
        }
    }
}

/// Interrupt a child's process group and wait for it to exit.
///
/// Escalates to SIGKILL if the child is still running after `timeout`.
/// Returns the exit status when one was observed.
pub(crate) async fn interrupt_and_wait(
    child: &mut Child,
    timeout: Duration,
    what: &str,
) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id()
        && !signal_group(pid, libc::SIGINT)
    {
        warn!(what, pid, "Failed to send SIGINT to process group");
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!(what, error = %e, "Failed to wait for process");
            None
        }
        Err(_) => {
            warn!(
                what,
                timeout_ms = timeout.as_millis(),
                "Process ignored SIGINT; killing"
            );
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                signal_group(pid, libc::SIGKILL);
            }
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}
