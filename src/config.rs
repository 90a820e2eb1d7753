//! Configuration management
//!
//! Handles loading and validating configuration from TOML files. Every field
//! has a default, so a file only needs the values it changes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tunnel::{RpcOptions, DEFAULT_WAVE_WIDTH};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub companion: CompanionConfig,
}

/// Tunnel call configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Default TURN server address (host:port) for `call` and `poke`
    #[serde(default)]
    pub server: Option<String>,
    /// Per-poke timeout in milliseconds (0 = wait for gathering to finish)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Concurrent pokes per upload/retrieval wave
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl TunnelConfig {
    /// Per-poke timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Options for the RPC orchestrator
    pub fn rpc_options(&self) -> RpcOptions {
        RpcOptions {
            timeout: self.timeout(),
            wave_width: self.concurrency,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: None,
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Companion relay server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionConfig {
    /// Directories searched for the platform binary
    #[serde(default = "default_bin_dirs")]
    pub bin_dirs: Vec<PathBuf>,
    /// HTTP(S) target the relay forwards requests to
    #[serde(default)]
    pub target: Option<String>,
    /// UDP port to listen on (0 = pick any)
    #[serde(default)]
    pub port: u16,
    /// How long to wait for the startup line
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            bin_dirs: default_bin_dirs(),
            target: None,
            port: 0,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

// Default value functions
fn default_timeout_ms() -> u64 {
    10_000
}

fn default_concurrency() -> usize {
    DEFAULT_WAVE_WIDTH
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_bin_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("bin"), PathBuf::from("dist/bin")]
}

fn default_startup_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.tunnel.concurrency == 0 {
            anyhow::bail!("tunnel.concurrency must be > 0");
        }
        if matches!(&self.tunnel.server, Some(s) if s.is_empty()) {
            anyhow::bail!("tunnel.server must not be empty");
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("logging.format must be \"json\" or \"pretty\"");
        }
        if self.companion.startup_timeout_secs == 0 {
            anyhow::bail!("companion.startup_timeout_secs must be > 0");
        }
        Ok(())
    }
}
