//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded by the batch driver using the `metrics` crate's
//! macros. This module installs the Prometheus recorder, registers
//! human-readable descriptions for each metric, and writes the rendered
//! snapshot into the run directory at the end of a batch.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;
use tracing::{debug, warn};

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests that
/// run several batches in one process). Metric recording still works; the
/// `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    // -- Pass outcomes --
    describe_counter!(
        "llmbench_passes_total",
        "Benchmark passes by outcome (completed, violated, skipped, failed)"
    );
    describe_histogram!(
        "llmbench_pass_duration_seconds",
        "Wall-clock duration of a benchmark pass (sampler start to merge)"
    );
    describe_counter!(
        "llmbench_skipped_passes_total",
        "Grid passes skipped after an earlier violation for the same length pair"
    );

    // -- Threshold monitor --
    describe_counter!(
        "llmbench_threshold_violations_total",
        "Passes whose record breached at least one latency threshold"
    );

    // -- GPU merge --
    describe_counter!(
        "llmbench_gpu_merges_total",
        "GPU summary merges by outcome"
    );

    describe_gauge!(
        "llmbench_best_concurrency",
        "Concurrency at which each length pair first breached its thresholds"
    );
}

/// Write the current metrics snapshot to `path`.
pub async fn write_snapshot(handle: &PrometheusHandle, path: &Path) {
    let rendered = handle.render();
    match tokio::fs::write(path, rendered).await {
        Ok(()) => debug!(path = %path.display(), "Wrote metrics snapshot"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics snapshot"),
    }
}
