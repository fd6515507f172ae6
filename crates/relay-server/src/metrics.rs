//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "relay_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "relay_sessions_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
    pub const MALFORMED_TOTAL: &str = "relay_malformed_total";
    pub const TOPICS_ACTIVE: &str = "relay_topics_active";
    pub const UPSTREAM_CONNECTS_TOTAL: &str = "relay_upstream_connects_total";
    pub const ROUTE_LATENCY_SECONDS: &str = "relay_route_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of open sessions");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Total number of envelopes handed to sessions"
    );
    metrics::describe_counter!(names::MALFORMED_TOTAL, "Total number of dropped frames");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of subscribed topics");
    metrics::describe_counter!(
        names::UPSTREAM_CONNECTS_TOTAL,
        "Total number of upstream connect attempts"
    );
    metrics::describe_histogram!(
        names::ROUTE_LATENCY_SECONDS,
        "Time spent routing one envelope, in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new session.
pub fn record_session() {
    counter!(names::SESSIONS_TOTAL).increment(1);
    gauge!(names::SESSIONS_ACTIVE).increment(1.0);
}

/// Record a closed session.
pub fn record_session_closed() {
    gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record one routing pass.
pub fn record_route(delivered: usize, seconds: f64) {
    counter!(names::DELIVERIES_TOTAL).increment(delivered as u64);
    histogram!(names::ROUTE_LATENCY_SECONDS).record(seconds);
}

/// Record a frame dropped as malformed.
pub fn record_malformed(source: &'static str) {
    counter!(names::MALFORMED_TOTAL, "source" => source).increment(1);
}

/// Update subscribed topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an upstream connect attempt.
pub fn record_upstream_connect() {
    counter!(names::UPSTREAM_CONNECTS_TOTAL).increment(1);
}

/// Metrics guard that records the session close on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        record_session();
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        record_session_closed();
    }
}
