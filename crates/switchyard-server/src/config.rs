//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`switchyard.toml` and friends, or the path in
//!   `SWITCHYARD_CONFIG`)
//! - Environment variables (`SWITCHYARD_HOST`, `SWITCHYARD_PORT`,
//!   `SWITCHYARD_ROLE`), applied on top of the file

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use switchyard_core::{dispatch, DispatchConfig, DispatchStrategy};
use switchyard_protocol::InstanceType;
use switchyard_transport::UpstreamConfig;

/// Which tier this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Broker,
    Access,
    Logic,
}

impl Role {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Broker => "broker",
            Role::Access => "access",
            Role::Logic => "logic",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "broker" => Ok(Role::Broker),
            "access" => Ok(Role::Access),
            "logic" => Ok(Role::Logic),
            other => Err(anyhow!("Unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tier to run.
    #[serde(default)]
    pub role: Role,

    /// Instance id announced to the broker.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Host to bind to (tier links on the broker, edge clients on access).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Link to the broker (access and logic).
    #[serde(default)]
    pub upstream: UpstreamSection,

    /// Dispatch pipeline.
    #[serde(default)]
    pub dispatch: DispatchSection,

    /// Holder sizing.
    #[serde(default)]
    pub holders: HoldersConfig,

    /// Static token table.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin HTTP endpoint.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Upstream link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// Broker host.
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path on the broker.
    #[serde(default = "default_upstream_path")]
    pub path: String,

    /// Dial and handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    /// Reconnect delay cap in milliseconds.
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Reconnect attempts before giving up, -1 for unlimited.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i64,

    /// Keep-alive ping interval in milliseconds.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_ms: u64,

    /// Silence tolerated before the link is torn down, in milliseconds.
    #[serde(default = "default_keep_alive_max_lifetime")]
    pub keep_alive_max_lifetime_ms: u64,

    /// Limit for writing one envelope to any link, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Handshake route name.
    #[serde(default = "default_setup_route")]
    pub setup_route: String,

    /// Stream route name.
    #[serde(default = "default_channel_route")]
    pub channel_route: String,

    /// Token presented to the broker.
    #[serde(default)]
    pub token: String,
}

/// Dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    /// `semaphore` or `worker_pool`.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Permits or workers; 0 means twice the available parallelism.
    #[serde(default)]
    pub concurrency: usize,
}

/// Holder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldersConfig {
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,

    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// How long producers wait for outbound space, in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
}

/// One accepted token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,

    /// User id, or instance id for tier tokens.
    pub subject: String,

    /// `ACCESS`/`LOGIC` (or `A`/`L`) for tier tokens, absent for users.
    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub device_id: String,

    #[serde(default)]
    pub platform: String,
}

/// Auth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
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

/// Admin HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_port")]
    pub port: u16,
}

// Default value functions
fn default_instance_id() -> String {
    "switchyard-1".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_path() -> String {
    "/".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_reconnect_interval() -> u64 {
    3_000
}

fn default_max_reconnect_interval() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_reconnect_attempts() -> i64 {
    -1
}

fn default_keep_alive_interval() -> u64 {
    30_000
}

fn default_keep_alive_max_lifetime() -> u64 {
    90_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_setup_route() -> String {
    "connect".to_string()
}

fn default_channel_route() -> String {
    "channel".to_string()
}

fn default_strategy() -> String {
    "semaphore".to_string()
}

fn default_inbound_capacity() -> usize {
    switchyard_core::holder::DEFAULT_INBOUND_CAPACITY
}

fn default_outbound_capacity() -> usize {
    switchyard_core::holder::DEFAULT_OUTBOUND_CAPACITY
}

fn default_send_timeout() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            instance_id: default_instance_id(),
            host: default_host(),
            port: default_port(),
            upstream: UpstreamSection::default(),
            dispatch: DispatchSection::default(),
            holders: HoldersConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_port(),
            path: default_upstream_path(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_interval_ms: default_max_reconnect_interval(),
            backoff_factor: default_backoff_factor(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            keep_alive_interval_ms: default_keep_alive_interval(),
            keep_alive_max_lifetime_ms: default_keep_alive_max_lifetime(),
            write_timeout_ms: default_write_timeout(),
            setup_route: default_setup_route(),
            channel_route: default_channel_route(),
            token: String::new(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            concurrency: 0,
        }
    }
}

impl Default for HoldersConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_inbound_capacity(),
            outbound_capacity: default_outbound_capacity(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl HoldersConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
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

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_admin_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override is malformed.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SWITCHYARD_CONFIG") {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::search()?,
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn search() -> Result<Self> {
        let config_paths = [
            "switchyard.toml",
            "/etc/switchyard/switchyard.toml",
            "~/.config/switchyard/switchyard.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

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

    /// Apply `SWITCHYARD_*` overrides looked up through `var`.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("SWITCHYARD_HOST") {
            self.host = host;
        }
        if let Some(port) = var("SWITCHYARD_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid SWITCHYARD_PORT: {port}"))?;
        }
        if let Some(role) = var("SWITCHYARD_ROLE") {
            self.role = role.parse()?;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Instance type announced upstream for this role.
    ///
    /// # Errors
    ///
    /// Returns an error for the broker, which has no upstream.
    pub fn instance_type(&self) -> Result<InstanceType> {
        match self.role {
            Role::Access => Ok(InstanceType::Access),
            Role::Logic => Ok(InstanceType::Logic),
            Role::Broker => Err(anyhow!("The broker has no upstream")),
        }
    }

    /// Build the upstream client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for the broker role.
    pub fn upstream_config(&self) -> Result<UpstreamConfig> {
        let up = &self.upstream;
        Ok(UpstreamConfig {
            host: up.host.clone(),
            port: up.port,
            path: up.path.clone(),
            connect_timeout: Duration::from_millis(up.connect_timeout_ms),
            reconnect_interval: Duration::from_millis(up.reconnect_interval_ms),
            max_reconnect_interval: Duration::from_millis(up.max_reconnect_interval_ms),
            backoff_factor: up.backoff_factor,
            max_reconnect_attempts: up.max_reconnect_attempts,
            keep_alive_interval: Duration::from_millis(up.keep_alive_interval_ms),
            keep_alive_max_lifetime: Duration::from_millis(up.keep_alive_max_lifetime_ms),
            write_timeout: self.write_timeout(),
            setup_route: up.setup_route.clone(),
            channel_route: up.channel_route.clone(),
            instance_type: self.instance_type()?,
            instance_id: self.instance_id.clone(),
            token: up.token.clone(),
        })
    }

    /// Build the dispatcher configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy name is unknown.
    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        let strategy: DispatchStrategy = self
            .dispatch
            .strategy
            .parse()
            .map_err(|e| anyhow!("{e}: {}", self.dispatch.strategy))?;
        let concurrency = match self.dispatch.concurrency {
            0 => dispatch::default_concurrency(),
            n => n,
        };
        Ok(DispatchConfig {
            strategy,
            concurrency,
        })
    }

    /// Handshake timeout for accepted links.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    /// Limit for writing one envelope to any link.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.write_timeout_ms)
    }

    /// Keep-alive settings for accepted links: `(interval, max lifetime)`.
    #[must_use]
    pub fn keep_alive(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.upstream.keep_alive_interval_ms),
            Duration::from_millis(self.upstream.keep_alive_max_lifetime_ms),
        )
    }
}
