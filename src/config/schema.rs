//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files, and
//! every section falls back to its `Default` so partial files are valid.

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection parameters shared by client and remote tunnels.
    pub tunnel: TunnelConfig,

    /// Relay server settings.
    pub server: ServerConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Framing used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ws,
    Http,
}

/// Tunnel connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Peer host (client role) or peer address (remote role).
    pub host: String,

    pub port: u16,

    pub transport: Transport,

    /// Payload codec; both ends must agree.
    pub codec: CodecKind,

    /// Application identifier sent as the WS `Origin`.
    pub origin: String,

    /// Seconds between client keepalive pings. 0 disables them.
    pub keepalive_secs: u64,

    /// Disconnect after this many silent seconds. 0 disables the check.
    pub idle_timeout_secs: u64,

    /// Largest accepted message, in bytes.
    pub max_message_bytes: usize,

    pub reconnect: ReconnectConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
            transport: Transport::Ws,
            codec: CodecKind::Json,
            origin: "service-tunnel".to_string(),
            keepalive_secs: 60,
            idle_timeout_secs: 0,
            max_message_bytes: 8 * 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Client reconnect policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before reconnecting in milliseconds. 0 disables reconnects.
    pub delay_ms: u64,

    /// Upper bound for the backoff on consecutive failures.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Relay server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:7400").
    pub bind_address: String,

    /// Maximum concurrent tunnels (backpressure).
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7400".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
