//! Prometheus metrics export
//!
//! Counters are always recorded through the `metrics` facade; they are only
//! exposed when the exporter is enabled.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;

/// Install the Prometheus HTTP exporter if enabled. Must run inside a Tokio
/// runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", config.listen))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

/// Record a session that finished setup
pub fn record_session_created() {
    counter!("sandcell_sessions_created_total").increment(1);
    gauge!("sandcell_active_sessions").increment(1.0);
}

/// Record a session removed from the registry
pub fn record_session_closed() {
    counter!("sandcell_sessions_closed_total").increment(1);
    gauge!("sandcell_active_sessions").decrement(1.0);
}

/// Record a resolved image; `source` is `build` or `pull`
pub fn record_image_resolved(source: &'static str) {
    counter!("sandcell_images_resolved_total", "source" => source).increment(1);
}

/// Record an exec outcome
pub fn record_exec(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("sandcell_execs_total", "outcome" => outcome).increment(1);
}
