use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const STREAM_ATTEMPTS: &str = "portbridge_stream_attempts_total";
pub const STREAM_FAILURES: &str = "portbridge_stream_failures_total";
pub const SNAPSHOTS: &str = "portbridge_snapshots_total";
/// Gauge: live entries in the tunnel table.
pub const TUNNELS: &str = "portbridge_tunnels";
pub const OPEN_REQUESTS: &str = "portbridge_open_requests_total";
pub const OPEN_FAILURES: &str = "portbridge_open_failures_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(STREAM_ATTEMPTS, "Tunnel status stream attempts.");
    metrics::describe_counter!(
        STREAM_FAILURES,
        "Tunnel status streams that ended or failed."
    );
    metrics::describe_counter!(SNAPSHOTS, "Tunnel status snapshots received.");
    metrics::describe_gauge!(TUNNELS, "Tunnels currently mirrored from the agent.");
    metrics::describe_counter!(OPEN_REQUESTS, "Open-tunnel requests sent to the agent.");
    metrics::describe_counter!(
        OPEN_FAILURES,
        "Tunnel requests that failed or timed out."
    );
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
