//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::DEFAULT_MAX_FRAME_LEN;

/// Root configuration for a relay instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Peer listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Outbound peer connection settings.
    pub peers: PeerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Frame size limits.
    pub limits: LimitsConfig,

    /// Worker endpoints, tried round-robin.
    pub workers: Vec<WorkerConfig>,

    /// Execution gateway settings.
    pub gateway: GatewayConfig,

    /// Result cache settings.
    pub cache: CacheConfig,

    /// Browser-facing HTTP server.
    pub http: HttpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl RelayConfig {
    /// Worker list with the built-in default applied when none are configured.
    pub fn worker_addresses(&self) -> Vec<String> {
        if self.workers.is_empty() {
            vec![WorkerConfig::default().address]
        } else {
            self.workers.iter().map(|w| w.address.clone()).collect()
        }
    }
}

/// Peer listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7000").
    pub bind_address: String,

    /// Optional TLS configuration. Peers normally require it.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent peer connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7000".to_string(),
            tls: None,
            max_connections: 1_024,
        }
    }
}

/// TLS material for the listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Outbound peer connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    /// CA certificate (PEM) that signs every peer's certificate.
    /// When absent, peers are dialed over plain TCP.
    pub ca_path: Option<String>,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ca_path: None,
            connect_timeout_secs: 5,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Close inbound connections silent for this many seconds.
    pub idle_secs: u64,

    /// Worker connect timeout in seconds.
    pub worker_connect_secs: u64,
}

impl TimeoutConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn worker_connect(&self) -> Duration {
        Duration::from_secs(self.worker_connect_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            worker_connect_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted payload; longer length prefixes close the connection.
    pub max_frame_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// A compute worker endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WorkerConfig {
    /// Worker address (e.g., "127.0.0.1:6000").
    pub address: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6000".to_string(),
        }
    }
}

/// How browser execute requests are served.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One short-lived worker connection per request; results are cached.
    #[default]
    Stateless,
    /// One long-lived worker connection per browser session; never cached.
    Stateful,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Stateless => "stateless",
            ExecutionMode::Stateful => "stateful",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Mode assigned to newly opened browser sessions.
    pub mode: ExecutionMode,
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached response sequences (LRU beyond that).
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Browser-facing HTTP server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Expose diagnostic routes such as the peer test message.
    pub debug_routes: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            debug_routes: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
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
