//! Configuration types for the device gateway
//!
//! This module provides configuration structures for the device session,
//! the event bridge, subscriber keepalive and the process-backed driver.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Default TCP port of a networked Meshtastic device
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default connection timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Maximum allowed hops in Meshtastic protocol
pub const MAX_HOP_LIMIT: u8 = 7;

/// Textual broadcast destination understood by the driver
pub const BROADCAST_ADDR: &str = "^all";

/// Numeric broadcast destination
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;

/// Main configuration for the gateway core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Event bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Subscriber hub settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Helper process driver settings
    #[serde(default)]
    pub driver: DriverConfig,
}

impl GatewayConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        use crate::error::GatewayError;

        if self.bridge.max_in_flight == 0 {
            return Err(GatewayError::InvalidConfig(
                "bridge.max_in_flight must be greater than zero".to_string(),
            ));
        }
        if self.hub.idle_timeout.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "hub.idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.session.default_hop_limit > MAX_HOP_LIMIT {
            return Err(GatewayError::InvalidConfig(format!(
                "session.default_hop_limit {} exceeds {}",
                self.session.default_hop_limit, MAX_HOP_LIMIT
            )));
        }
        Ok(())
    }
}

/// Device session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Port used when a network address carries none
    #[serde(default = "default_tcp_port")]
    pub default_tcp_port: u16,

    /// How long opening a link may take
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Bounded wait for traceroute initiation
    #[serde(with = "humantime_serde", default = "default_traceroute_timeout")]
    pub traceroute_timeout: Duration,

    /// Hop limit used for traceroute when the caller gives none
    #[serde(default = "default_hop_limit")]
    pub default_hop_limit: u8,

    /// Capacity of the session command queue
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

fn default_traceroute_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_hop_limit() -> u8 {
    MAX_HOP_LIMIT
}

fn default_command_queue() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_tcp_port: DEFAULT_TCP_PORT,
            connect_timeout: default_connect_timeout(),
            traceroute_timeout: default_traceroute_timeout(),
            default_hop_limit: MAX_HOP_LIMIT,
            command_queue: default_command_queue(),
        }
    }
}

/// Event bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Maximum number of units of work tracked as in flight
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Subscriber hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Inactivity window after which a subscriber is pinged
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// How often idle subscribers are checked
    #[serde(with = "humantime_serde", default = "default_keepalive_tick")]
    pub keepalive_tick: Duration,
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_keepalive_tick() -> Duration {
    Duration::from_secs(1)
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            keepalive_tick: default_keepalive_tick(),
        }
    }
}

/// Helper process driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Executable that wraps the vendor radio library
    #[serde(default = "default_helper_command")]
    pub helper_command: String,

    /// Extra arguments passed before the connection arguments
    #[serde(default)]
    pub helper_args: Vec<String>,
}

fn default_helper_command() -> String {
    "meshtastic-helper".to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            helper_command: default_helper_command(),
            helper_args: Vec::new(),
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subscriber idle window
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.hub.idle_timeout = timeout;
        self
    }

    /// Set the traceroute initiation wait
    pub fn traceroute_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.traceroute_timeout = timeout;
        self
    }

    /// Set the link open timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.connect_timeout = timeout;
        self
    }

    /// Set the default traceroute hop limit
    pub fn default_hop_limit(mut self, hops: u8) -> Self {
        self.config.session.default_hop_limit = hops.min(MAX_HOP_LIMIT);
        self
    }

    /// Set the bridge registry capacity
    pub fn max_in_flight(mut self, capacity: usize) -> Self {
        self.config.bridge.max_in_flight = capacity;
        self
    }

    /// Set the helper executable
    pub fn helper_command(mut self, command: impl Into<String>) -> Self {
        self.config.driver.helper_command = command.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
