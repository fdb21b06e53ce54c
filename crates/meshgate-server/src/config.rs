//! Server configuration
//!
//! One TOML file carries both the gateway sections (`session`, `bridge`,
//! `hub`, `driver`) and the `server` section.

use meshgate_core::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// HTTP listener and database settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database() -> String {
    "meshgate.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Complete configuration of a `meshgate` process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Gateway core settings
    #[serde(flatten)]
    pub gateway: GatewayConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl NodeConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.gateway.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
