//! Server configuration.
//!
//! Configuration can be loaded from:
//! - The file named by `RELAY_CONFIG`
//! - `relay.toml`, `/etc/relay/relay.toml` or `~/.config/relay/relay.toml`
//! - Environment variables (`RELAY_HOST`, `RELAY_PORT`) for the defaults

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenvis_relay_core::{HubConfig, OverflowPolicy, WriterFormat};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Demo streams published by the server itself.
    #[serde(default = "default_streams")]
    pub streams: Vec<SourceConfig>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Port for a standalone WebSocket listener without the HTTP router.
    #[serde(default)]
    pub standalone_port: Option<u16>,

    /// Wire format for stream items.
    #[serde(default)]
    pub format: WriterFormat,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-client inbox capacity.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Per-client notice buffer.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Buffer between a source and its stream.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Maximum subscriptions per client.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_client: usize,

    /// What to do with a client that cannot keep up.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Read timeout in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Close handshake timeout in milliseconds.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Refuse connections without a `token` query parameter.
    #[serde(default)]
    pub require_token: bool,
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

/// A demo stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stream name.
    pub name: String,

    /// Emit interval in milliseconds.
    #[serde(default = "default_source_interval")]
    pub interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    512
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_event_buffer() -> usize {
    32
}

fn default_stream_buffer() -> usize {
    1024
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_ping_interval() -> u64 {
    54_000 // 90% of the read timeout
}

fn default_read_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_source_interval() -> u64 {
    1_000
}

fn default_streams() -> Vec<SourceConfig> {
    vec![SourceConfig {
        name: "ticks".to_string(),
        interval_ms: default_source_interval(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            streams: default_streams(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            standalone_port: None,
            format: WriterFormat::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            subscriber_buffer: default_subscriber_buffer(),
            event_buffer: default_event_buffer(),
            stream_buffer: default_stream_buffer(),
            max_subscriptions_per_client: default_max_subscriptions(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            close_timeout_ms: default_close_timeout(),
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RELAY_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.ping_interval_ms >= self.heartbeat.read_timeout_ms {
            bail!(
                "heartbeat.ping_interval_ms ({}) must be shorter than heartbeat.read_timeout_ms ({})",
                self.heartbeat.ping_interval_ms,
                self.heartbeat.read_timeout_ms
            );
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be positive");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Build the hub configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            subscriber_buffer: self.limits.subscriber_buffer,
            overflow_policy: self.limits.overflow_policy,
            event_buffer: self.limits.event_buffer,
            stream_buffer: self.limits.stream_buffer,
            max_subscriptions_per_client: self.limits.max_subscriptions_per_client,
            max_message_size: self.limits.max_message_size,
            require_token: self.auth.require_token,
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            read_timeout: Duration::from_millis(self.heartbeat.read_timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            close_timeout: Duration::from_millis(self.heartbeat.close_timeout_ms),
        }
    }
}
