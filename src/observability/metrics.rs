//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define tunnel metrics (frames, connections, reconnects, plugs, closes)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `tunnel_frames_total` (counter): decoded/written frames by direction
//! - `tunnel_connections_active` (gauge): sockets past their handshake
//! - `tunnel_reconnects_total` (counter): scheduled client reconnects
//! - `tunnel_services_plugged_total` (counter): completed plug handshakes
//! - `tunnel_close_total` (counter): WS close frames sent, by status code
//!
//! # Design Decisions
//! - The `metrics` facade is a no-op until a recorder is installed
//! - Labels are limited to small fixed sets (direction, status code)

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::protocol::CloseStatus;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_frames(direction: &'static str, count: usize) {
    counter!("tunnel_frames_total", "direction" => direction).increment(count as u64);
}

pub fn connection_opened() {
    gauge!("tunnel_connections_active").increment(1.0);
}

pub fn connection_closed() {
    gauge!("tunnel_connections_active").decrement(1.0);
}

pub fn record_reconnect() {
    counter!("tunnel_reconnects_total").increment(1);
}

pub fn record_plug() {
    counter!("tunnel_services_plugged_total").increment(1);
}

pub fn record_close(status: CloseStatus) {
    counter!("tunnel_close_total", "code" => status.code().to_string()).increment(1);
}
