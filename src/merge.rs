//! Merge GPU sampler summaries into the benchmark results file.
//!
//! The sampler's summary log holds one line per finished monitoring window,
//! written either as JSON or as a Python dict literal. The last line is
//! matched against the last results record by concurrency and lengths, and
//! on a match its GPU averages are folded into that record in place.

use crate::record::{BenchRecord, last_non_empty_line};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// GPU fields copied from the summary into the results record.
pub const GPU_FIELDS: [&str; 5] = [
    "gpu_nums",
    "gpu_usage_avg",
    "temperature_avg",
    "total_memory_avg",
    "used_memory_avg",
];

const MATCH_KEYS: [&str; 3] = ["concurrency", "input_len", "output_len"];

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("last line of {} is not a JSON object", path.display())]
    InvalidResults { path: PathBuf },
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// GPU fields were written into the last record
    Merged,
    /// The summary log is absent or empty; results untouched
    NoGpuData,
    /// The results file has no records; nothing to merge into
    NoResults,
    /// The summary belongs to a different combination; results untouched
    Mismatch { key: String },
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Merged => "merged",
            MergeOutcome::NoGpuData => "no_gpu_data",
            MergeOutcome::NoResults => "no_results",
            MergeOutcome::Mismatch { .. } => "mismatch",
        }
    }
}

/// Parse one summary line as JSON, falling back to a Python dict literal.
pub fn parse_summary_line(line: &str) -> Option<Map<String, Value>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str(line) {
        return Some(map);
    }
    match serde_json::from_str(&python_literal_to_json(line)) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Rewrite a Python literal (single-quoted strings, True/False/None) as JSON.
///
/// Constants are only rewritten outside string literals.
fn python_literal_to_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        let in_string = in_single || in_double;
        match c {
            '\\' if in_string => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            c if !in_string && (c.is_ascii_alphabetic() || c == '_') => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    _ => &word,
                });
            }
            _ => out.push(c),
        }
    }
    out
}

fn key_as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Read the last GPU summary from `gpu_log`, if any.
pub async fn read_gpu_summary(gpu_log: &Path) -> Result<Option<Map<String, Value>>, MergeError> {
    let contents = match tokio::fs::read_to_string(gpu_log).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MergeError::Read {
                path: gpu_log.to_path_buf(),
                source,
            });
        }
    };
    Ok(last_non_empty_line(&contents).and_then(parse_summary_line))
}

/// Fold the last GPU summary into the last results record.
///
/// Merging the same summary twice yields the same record.
pub async fn merge_gpu_into_results(
    results: &Path,
    gpu_log: &Path,
) -> Result<MergeOutcome, MergeError> {
    let Some(gpu) = read_gpu_summary(gpu_log).await? else {
        debug!(gpu_log = %gpu_log.display(), "No GPU summary to merge");
        return Ok(MergeOutcome::NoGpuData);
    };

    let contents = match tokio::fs::read_to_string(results).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MergeOutcome::NoResults),
        Err(source) => {
            return Err(MergeError::Read {
                path: results.to_path_buf(),
                source,
            });
        }
    };

    // Byte range of the last non-empty line
    let trimmed_end = contents.trim_end().len();
    if trimmed_end == 0 {
        return Ok(MergeOutcome::NoResults);
    }
    let line_start = contents[..trimmed_end].rfind('\n').map_or(0, |i| i + 1);
    let last_line = &contents[line_start..trimmed_end];

    let record = BenchRecord::parse_line(last_line).ok_or_else(|| MergeError::InvalidResults {
        path: results.to_path_buf(),
    })?;

    for key in MATCH_KEYS {
        let ours = key_as_string(record.get(key));
        let theirs = key_as_string(gpu.get(key));
        if ours != theirs {
            warn!(
                key,
                results = %ours,
                gpu = %theirs,
                "GPU summary does not match the last results record; not merging"
            );
            return Ok(MergeOutcome::Mismatch {
                key: key.to_string(),
            });
        }
    }

    let mut merged = record.fields().clone();
    for field in GPU_FIELDS {
        match gpu.get(field) {
            Some(value) if !value.is_null() => {
                merged.insert(field.to_string(), value.clone());
            }
            _ => {
                merged.remove(field);
            }
        }
    }
    let merged_line = serde_json::to_string(&Value::Object(merged)).map_err(|e| {
        MergeError::Write {
            path: results.to_path_buf(),
            source: e.into(),
        }
    })?;

    let mut rewritten = String::with_capacity(contents.len() + merged_line.len());
    rewritten.push_str(&contents[..line_start]);
    rewritten.push_str(&merged_line);
    rewritten.push_str(&contents[trimmed_end..]);

    write_atomic(results, rewritten.as_bytes())
        .await
        .map_err(|source| MergeError::Write {
            path: results.to_path_buf(),
            source,
        })?;

    info!(results = %results.display(), "Merged GPU summary into results");
    Ok(MergeOutcome::Merged)
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
