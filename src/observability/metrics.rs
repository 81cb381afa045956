//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_frames_received_total` (counter): frames decoded from any connection
//! - `relay_frames_sent_total` (counter): frames handed to a connection writer
//! - `relay_connections_active` (gauge): open framed connections
//! - `relay_connections_closed_total` (counter): closures by reason
//! - `relay_cache_lookups_total` (counter): result cache lookups by result
//! - `relay_executions_total` (counter): executions by mode and outcome
//! - `relay_peer_messages_total` (counter): messages received from peer relays
//! - `relay_browser_sessions` (gauge): open browser sessions

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_frame_received() {
    counter!("relay_frames_received_total").increment(1);
}

pub fn record_frame_sent() {
    counter!("relay_frames_sent_total").increment(1);
}

pub fn record_connection_opened() {
    gauge!("relay_connections_active").increment(1.0);
}

pub fn record_connection_closed(reason: &'static str) {
    gauge!("relay_connections_active").decrement(1.0);
    counter!("relay_connections_closed_total", "reason" => reason).increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("relay_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_execution(mode: &'static str, outcome: &'static str) {
    counter!("relay_executions_total", "mode" => mode, "outcome" => outcome).increment(1);
}

pub fn record_peer_message() {
    counter!("relay_peer_messages_total").increment(1);
}

pub fn record_browser_sessions(count: usize) {
    gauge!("relay_browser_sessions").set(count as f64);
}
