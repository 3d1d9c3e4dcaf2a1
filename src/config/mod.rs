//! Configuration for the mixproxy binary
//!
//! The library itself is configured through [`crate::mixed::ProxyBuilder`];
//! this module only covers the optional TOML file consumed by the CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Proxy section of the configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP endpoint to listen on
    pub bind: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
    /// Emit logs as JSON
    pub json_log: bool,
    /// Allow the SOCKS5 UDP ASSOCIATE command
    pub allow_udp: bool,
    /// Upstream dial timeout in seconds
    pub request_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind: crate::mixed::DEFAULT_BIND_ADDRESS.to_string(),
            log_level: None,
            json_log: false,
            allow_udp: true,
            request_timeout: 10,
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
