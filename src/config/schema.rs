//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forward::{ForwarderOptions, HeaderRewriter};

/// Root configuration for the forwarding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// The single upstream every request is forwarded to.
    pub target: TargetConfig,

    /// Forwarding behaviour.
    pub forward: ForwardConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Inbound request limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// Forwarder options derived from the `forward` and `timeouts` sections.
    ///
    /// Collaborators not configurable from a file keep their defaults.
    pub fn forwarder_options(&self) -> ForwarderOptions {
        let rewriter = HeaderRewriter {
            trust_forward_header: self.forward.trust_forward_header,
            hostname: self.forward.hostname.clone(),
        };
        ForwarderOptions {
            rewriter: Some(Arc::new(rewriter)),
            pass_host_header: self.forward.pass_host_header,
            flush_interval: Duration::from_millis(self.forward.flush_interval_ms),
            follow_upgrade_redirects: self.forward.follow_upgrade_redirects,
            require_same_host_redirects: self.forward.require_same_host_redirects,
            connect_timeout: Some(Duration::from_secs(self.timeouts.connect_secs)),
            ..Default::default()
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Upstream target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Base URL of the upstream (scheme and authority are used).
    pub url: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
        }
    }
}

/// Forwarding behaviour.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ForwardConfig {
    /// Send the client's Host header upstream.
    pub pass_host_header: bool,

    /// Flush cadence for streamed responses in milliseconds (0 = at end).
    pub flush_interval_ms: u64,

    /// Keep X-Forwarded-* headers sent by clients.
    pub trust_forward_header: bool,

    /// Value for X-Forwarded-Server.
    pub hostname: Option<String>,

    /// Reach upgrade targets through the redirect-following connector.
    pub follow_upgrade_redirects: bool,

    /// Refuse redirects to a different hostname.
    pub require_same_host_redirects: bool,
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Idle client connection timeout in seconds (waiting for a request head).
    pub idle_secs: u64,

    /// How long shutdown waits for open connections to finish.
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            idle_secs: 60,
            shutdown_secs: 30,
        }
    }
}

/// Inbound request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a request head in bytes.
    pub max_header_bytes: usize,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
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
