use crate::threshold::Breach;
use crate::types::Combination;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Contents written into the signal file. Only the file's existence is
/// load-bearing; the payload is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub input_len: u32,
    pub output_len: u32,
    pub concurrency: u32,
    pub breaches: Vec<Breach>,
    pub timestamp: String,
}

impl SignalPayload {
    pub fn new(combination: Combination, breaches: Vec<Breach>) -> Self {
        Self {
            input_len: combination.input_len,
            output_len: combination.output_len,
            concurrency: combination.concurrency,
            breaches,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn combination(&self) -> Combination {
        Combination {
            input_len: self.input_len,
            output_len: self.output_len,
            concurrency: self.concurrency,
        }
    }
}

/// A consumed signal. `payload` is `None` when the marker existed but its
/// contents could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub payload: Option<SignalPayload>,
}

/// Filesystem marker meaning "the current combination violated a threshold".
///
/// Raising uses `create_new`, so concurrent or repeated raises produce the
/// file exactly once. Consuming renames the marker away before reading it,
/// which makes check-then-delete a single atomic step.
#[derive(Debug, Clone)]
pub struct SignalFile {
    path: PathBuf,
}

impl SignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the marker. Returns `false` if it already existed.
    pub async fn raise(&self, payload: &SignalPayload) -> std::io::Result<bool> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };

        let body = serde_json::to_vec_pretty(payload)?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(true)
    }

    /// Take the marker if present, leaving no file behind.
    pub async fn consume(&self) -> std::io::Result<Option<Signal>> {
        let claimed = self.claimed_path();
        match tokio::fs::rename(&self.path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let payload = tokio::fs::read(&claimed)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        tokio::fs::remove_file(&claimed).await?;
        Ok(Some(Signal { payload }))
    }

    fn claimed_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".consumed");
        self.path.with_file_name(name)
    }
}
