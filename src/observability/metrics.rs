//! Metrics collection and exposition.
//!
//! # Metrics
//! - `forward_requests_total` (counter): HTTP round trips by method, status
//! - `forward_round_trip_duration_seconds` (histogram): round-trip latency
//! - `forward_transport_failures_total` (counter): failed round trips
//! - `forward_redirects_total` (counter): redirect hops followed
//! - `forward_upgrades_total` (counter): upgrade attempts by outcome
//! - `forward_websocket_sessions_active` (gauge): relays in progress

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram, Label};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_round_trip(method: &str, status: u16, start: Instant) {
    let labels = vec![
        Label::new("method", method.to_string()),
        Label::new("status", status.to_string()),
    ];
    counter!("forward_requests_total", labels.clone()).increment(1);
    histogram!("forward_round_trip_duration_seconds", labels).record(start.elapsed().as_secs_f64());
}

pub fn record_transport_failure(method: &str) {
    counter!("forward_transport_failures_total", "method" => method.to_string()).increment(1);
}

pub fn record_redirect() {
    counter!("forward_redirects_total").increment(1);
}

pub fn record_upgrade(outcome: &'static str) {
    counter!("forward_upgrades_total", "outcome" => outcome).increment(1);
}

/// Counts an active relay for as long as it is alive.
pub struct UpgradeSessionGauge(());

impl UpgradeSessionGauge {
    pub fn new() -> Self {
        gauge!("forward_websocket_sessions_active").increment(1.0);
        Self(())
    }
}

impl Default for UpgradeSessionGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UpgradeSessionGauge {
    fn drop(&mut self) {
        gauge!("forward_websocket_sessions_active").decrement(1.0);
    }
}
