//! Server configuration.
//!
//! Values are layered, lowest priority first:
//! - built-in defaults
//! - a TOML file (`$RELAY_CONFIG`, else the first of `relay.toml`,
//!   `/etc/relay/relay.toml`, `~/.config/relay/relay.toml` that exists)
//! - environment variables (`RELAY_PORT`, `RELAY_UPSTREAM__DELAY_MS`, ...)

use anyhow::{Context, Result};
use relay_core::RouterConfig;
use relay_transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;

const CONFIG_ENV: &str = "RELAY_CONFIG";

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Session transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Routing policy.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Upstream producer connection.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Payload mutators bound at startup.
    #[serde(default)]
    pub mutators: Vec<MutatorConfig>,
}

/// Session transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Do not send a session's own messages back to it.
    #[serde(default = "default_true")]
    pub echo_suppression: bool,

    /// Maximum subscriptions per session.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,
}

/// Upstream producer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Connect to the producer at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Producer host.
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Producer port.
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Hold every producer message this long before routing it.
    #[serde(default)]
    pub delay_ms: u64,

    /// Maximum producer frame size in bytes.
    ///
    /// Separate from the session limit since legacy base64 frames are a
    /// third larger than the envelope they carry.
    #[serde(default = "default_upstream_max_message_size")]
    pub max_message_size: usize,

    /// Reconnect spacing.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A merge-fields mutator bound to one topic.
///
/// ```toml
/// [[mutators]]
/// topic = "game:update_state"
/// merge = { series = "bo3" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutatorConfig {
    /// Topic the mutator applies to.
    pub topic: String,

    /// Fields inserted into every object payload on the topic.
    #[serde(default)]
    pub merge: Map<String, Value>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    49322
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_subscriptions() -> usize {
    256
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    49122
}

fn default_upstream_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            routing: RoutingConfig::default(),
            upstream: UpstreamConfig::default(),
            metrics: MetricsConfig::default(),
            mutators: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            echo_suppression: true,
            max_subscriptions_per_session: default_max_subscriptions(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_upstream_host(),
            port: default_upstream_port(),
            delay_ms: 0,
            max_message_size: default_upstream_max_message_size(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl From<&RoutingConfig> for RouterConfig {
    fn from(routing: &RoutingConfig) -> Self {
        RouterConfig {
            echo_suppression: routing.echo_suppression,
            max_subscriptions_per_session: routing.max_subscriptions_per_session,
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = Self::find_file() {
            tracing::info!("Loading config from {}", path.display());
            builder = builder.add_source(
                ::config::File::from(path.as_path()).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(shellexpand::tilde(&explicit).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// WebSocket URL of the upstream producer.
    #[must_use]
    pub fn upstream_url(&self) -> String {
        format!("ws://{}:{}", self.upstream.host, self.upstream.port)
    }
}
