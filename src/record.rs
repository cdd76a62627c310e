//! Benchmark records as written by the benchmark client.
//!
//! The client appends one JSON object per pass. Besides the latency
//! percentiles it carries whatever `--metadata key=value` pairs it was given,
//! always as strings, so the combination keys may arrive as `"32"` rather
//! than `32`.

use crate::threshold::{Metric, Statistic};
use crate::types::Combination;
use serde_json::{Map, Value};
use std::path::Path;

/// A single results-file entry. Unknown fields are preserved verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchRecord {
    fields: Map<String, Value>,
}

impl BenchRecord {
    /// Wrap a parsed JSON value. Returns `None` for anything but an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Parse a single line. Blank lines and non-objects yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(line)
            .ok()
            .and_then(Self::from_value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn concurrency(&self) -> Option<u32> {
        self.u32_field("concurrency")
            .or_else(|| self.u32_field("max_concurrency"))
    }

    pub fn input_len(&self) -> Option<u32> {
        self.u32_field("input_len")
    }

    pub fn output_len(&self) -> Option<u32> {
        self.u32_field("output_len")
    }

    /// The combination this record was produced for, if it carries all keys.
    pub fn combination(&self) -> Option<Combination> {
        Some(Combination {
            input_len: self.input_len()?,
            output_len: self.output_len()?,
            concurrency: self.concurrency()?,
        })
    }

    /// Latency in milliseconds for `metric`, e.g. `ttft_p99` or the
    /// vLLM-native `p99_ttft_ms`.
    pub fn latency_ms(&self, metric: Metric, stat: Statistic) -> Option<f64> {
        let short = format!("{}_{}", metric.as_str(), stat.as_str());
        let native = format!("{}_{}_ms", stat.as_str(), metric.as_str());
        self.f64_field(&short).or_else(|| self.f64_field(&native))
    }

    pub fn total_token_throughput(&self) -> Option<f64> {
        self.f64_field("total_token_throughput")
    }

    fn u32_field(&self, key: &str) -> Option<u32> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn f64_field(&self, key: &str) -> Option<f64> {
        let value = match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        value.filter(|v| v.is_finite())
    }
}

impl From<BenchRecord> for Value {
    fn from(record: BenchRecord) -> Self {
        record.into_value()
    }
}

/// Last non-empty line of a file, if any.
pub(crate) fn last_non_empty_line(contents: &str) -> Option<&str> {
    contents.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Read the most recent record of a results file.
///
/// A missing file or an unparsable last line is reported as `Ok(None)`.
pub async fn read_last_record(path: &Path) -> std::io::Result<Option<BenchRecord>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(last_non_empty_line(&contents).and_then(BenchRecord::parse_line))
}
