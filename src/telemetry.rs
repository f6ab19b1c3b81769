//! Metric names and recorder installation.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const GAUGE_ACTIVE_CONNECTIONS: &str = "tunnel_gateway_active_connections";
pub const COUNTER_CONNECTIONS_TOTAL: &str = "tunnel_gateway_connections_total";
pub const COUNTER_REQUESTS_TOTAL: &str = "tunnel_gateway_requests_total";
pub const COUNTER_CHANNELS_REJECTED_TOTAL: &str = "tunnel_gateway_channels_rejected_total";

pub const KEY_BACKEND: &str = "backend";
pub const KEY_REASON: &str = "reason";

/// Install the global Prometheus recorder and return the handle used to
/// render the scrape output.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    metrics::describe_gauge!(
        GAUGE_ACTIVE_CONNECTIONS,
        "Authenticated SSH connections currently open"
    );
    metrics::describe_counter!(
        COUNTER_CONNECTIONS_TOTAL,
        "Authenticated SSH connections since start"
    );
    metrics::describe_counter!(COUNTER_REQUESTS_TOTAL, "HTTP requests proxied to a backend");
    metrics::describe_counter!(
        COUNTER_CHANNELS_REJECTED_TOTAL,
        "Channel open requests that were refused"
    );

    Ok(handle)
}
