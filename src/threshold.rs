//! Latency objectives: parsing and evaluation.
//!
//! A threshold specification looks like `"ttft:400 tpot:50"`: a metric name
//! from the closed set {ttft, tpot, e2el} and an upper bound in milliseconds.
//! A record violates the specification when any configured metric is at or
//! above its bound.

use crate::record::BenchRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Latency metric reported by the benchmark client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Time to first token
    Ttft,
    /// Time per output token
    Tpot,
    /// End-to-end latency
    E2el,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Ttft, Metric::Tpot, Metric::E2el];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Ttft => "ttft",
            Metric::Tpot => "tpot",
            Metric::E2el => "e2el",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or(ThresholdError::UnknownMetric(name))
    }
}

/// Which summary statistic of a metric is compared against the bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    #[default]
    P99,
    Mean,
    Median,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::P99 => "p99",
            Statistic::Mean => "mean",
            Statistic::Median => "median",
        }
    }
}

/// Configuration errors in a threshold specification
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("unknown threshold metric '{0}' (expected ttft, tpot or e2el)")]
    UnknownMetric(String),

    #[error("malformed threshold item '{0}' (expected metric:bound)")]
    Malformed(String),

    #[error("invalid bound '{value}' for metric {metric}")]
    InvalidBound { metric: Metric, value: String },
}

/// A metric that met or exceeded its bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub metric: Metric,
    pub value_ms: f64,
    pub bound_ms: f64,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:.2}ms>={:.2}ms", self.metric, self.value_ms, self.bound_ms)
    }
}

/// Upper bounds per metric, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thresholds {
    bounds: BTreeMap<Metric, f64>,
}

impl Thresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: Metric, bound_ms: f64) -> Self {
        self.bounds.insert(metric, bound_ms);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn bound(&self, metric: Metric) -> Option<f64> {
        self.bounds.get(&metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.bounds.iter().map(|(m, b)| (*m, *b))
    }

    /// Every configured metric whose value in `record` is at or above its
    /// bound. Metrics absent from the record never breach.
    pub fn breaches(&self, record: &BenchRecord, stat: Statistic) -> Vec<Breach> {
        self.iter()
            .filter_map(|(metric, bound_ms)| {
                let value_ms = record.latency_ms(metric, stat)?;
                (value_ms >= bound_ms).then_some(Breach {
                    metric,
                    value_ms,
                    bound_ms,
                })
            })
            .collect()
    }

    pub fn is_satisfied_by(&self, record: &BenchRecord, stat: Statistic) -> bool {
        self.breaches(record, stat).is_empty()
    }
}

impl FromStr for Thresholds {
    type Err = ThresholdError;

    /// Parse `"metric:bound metric:bound"`. Items may be separated by
    /// whitespace or commas; an empty string yields no thresholds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut thresholds = Thresholds::new();
        for item in s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|item| !item.is_empty())
        {
            let (name, value) = item
                .split_once(':')
                .ok_or_else(|| ThresholdError::Malformed(item.to_string()))?;
            let metric: Metric = name.parse()?;
            let bound = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|b| b.is_finite() && *b >= 0.0)
                .ok_or_else(|| ThresholdError::InvalidBound {
                    metric,
                    value: value.to_string(),
                })?;
            thresholds.bounds.insert(metric, bound);
        }
        Ok(thresholds)
    }
}

impl fmt::Display for Thresholds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.iter().map(|(m, b)| format!("{m}:{b}")).collect();
        f.write_str(&items.join(" "))
    }
}
