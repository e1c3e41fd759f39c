//! Prometheus metrics
//!
//! Every series is labelled with the session id.

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and describe the switchboard series
///
/// Only one recorder can be installed per process; a second call fails.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_metrics();
    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "tunnel_mux_connections_added_total",
        "Physical connections added to a session"
    );
    metrics::describe_counter!(
        "tunnel_mux_connections_removed_total",
        "Physical connections removed from a session"
    );
    metrics::describe_gauge!(
        "tunnel_mux_connections",
        "Physical connections currently carrying a session"
    );
    metrics::describe_counter!(
        "tunnel_mux_deframe_failures_total",
        "Inbound reads whose bytes could not be deframed"
    );
    metrics::describe_counter!(
        "tunnel_mux_frames_discarded_total",
        "Inbound frames for streams the session does not know"
    );
    metrics::describe_counter!(
        "tunnel_mux_send_failures_total",
        "Writes that failed on a physical connection"
    );
}

/// Record a connection joining a session
pub fn record_connection_added(session: u32) {
    metrics::counter!("tunnel_mux_connections_added_total",
        "session" => session.to_string()
    )
    .increment(1);
}

/// Record a connection leaving a session
pub fn record_connection_removed(session: u32) {
    metrics::counter!("tunnel_mux_connections_removed_total",
        "session" => session.to_string()
    )
    .increment(1);
}

/// Update the live connection gauge for a session
pub fn update_connection_count(session: u32, count: usize) {
    metrics::gauge!("tunnel_mux_connections",
        "session" => session.to_string()
    )
    .set(count as f64);
}

/// Record bytes that could not be deframed
pub fn record_deframe_failure(session: u32) {
    metrics::counter!("tunnel_mux_deframe_failures_total",
        "session" => session.to_string()
    )
    .increment(1);
}

/// Record a frame dropped because its stream could not be resolved
pub fn record_frame_discarded(session: u32) {
    metrics::counter!("tunnel_mux_frames_discarded_total",
        "session" => session.to_string()
    )
    .increment(1);
}

/// Record a failed write on a physical connection
pub fn record_send_failure(session: u32) {
    metrics::counter!("tunnel_mux_send_failures_total",
        "session" => session.to_string()
    )
    .increment(1);
}
