//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render the exposition text
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a finished export run
pub fn record_run(outcome: &str, elapsed: Duration) {
    metrics::counter!("model_export_runs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("model_export_run_duration_seconds").record(elapsed.as_secs_f64());
}

/// Record one staged data file
pub fn record_file_downloaded(bytes: u64) {
    metrics::counter!("model_export_files_downloaded_total").increment(1);
    metrics::counter!("model_export_bytes_downloaded_total").increment(bytes);
}

/// Record a failed lock call
pub fn record_lock_failure() {
    metrics::counter!("model_export_lock_failures_total").increment(1);
}

/// Record a channel replacement attempt (`replaced`, `kept_original`)
pub fn record_channel_replacement(outcome: &str) {
    metrics::counter!("model_export_channel_replacements_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
