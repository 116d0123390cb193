//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client-facing listener.
    pub listener: ListenerConfig,

    /// The backend every request is relayed to.
    pub backend: BackendConfig,

    /// Request rewriting and response streaming.
    pub forwarding: ForwardingConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Byte-stream transport used to listen or dial.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// `host:port`.
    Tcp,
    /// Filesystem path of a Unix domain socket.
    Unix,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    pub transport: Transport,

    /// Bind address (e.g., "127.0.0.1:2375") or socket path.
    pub address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            address: "127.0.0.1:2375".to_string(),
            max_connections: 1024,
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub transport: Transport,

    /// Address handed to the dialer; its meaning depends on `transport`.
    pub address: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Unix,
            address: "/var/run/docker.sock".to_string(),
        }
    }
}

/// How requests are rewritten and responses streamed.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Host every outbound request is addressed to.
    pub synthetic_host: String,

    /// Scheme every outbound request is addressed with.
    pub synthetic_scheme: String,

    /// Cadence at which partially written response bytes are pushed to the client.
    pub flush_interval_ms: u64,

    /// Response bytes held back before a write is forced out.
    pub write_buffer_bytes: usize,
}

impl ForwardingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            synthetic_host: "api.moby.localhost".to_string(),
            synthetic_scheme: "http".to_string(),
            flush_interval_ms: 100,
            write_buffer_bytes: 4096,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend dial timeout in seconds.
    pub connect_secs: u64,

    /// How long shutdown waits for open connections to finish, in seconds.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            shutdown_grace_secs: 10,
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
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
