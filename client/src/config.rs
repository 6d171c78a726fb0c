//! Configuration file parser for the Burrow agent
//!
//! Reads `burrow.yml` from the working directory or the home directory.
//! Command-line flags override anything set here.

use burrow_shared::protocol::MAX_BODY_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay tunnel endpoint
    #[serde(default = "default_server")]
    pub server: String,

    /// Local service that receives forwarded requests
    #[serde(default = "default_target")]
    pub target: String,

    /// Seconds between keepalive pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds of silence from the relay before the tunnel is considered dead
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Deadline for one request against the local service
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest local response body sent back through the tunnel
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Upper bound for any configured interval or timeout (one week)
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Backoff between reconnection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            target: default_target(),
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_server() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_target() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_body() -> usize {
    MAX_BODY_SIZE
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.server.starts_with("ws://") || self.server.starts_with("wss://")) {
            anyhow::bail!("server must be a ws:// or wss:// URL: {}", self.server);
        }
        if !(self.target.starts_with("http://") || self.target.starts_with("https://")) {
            anyhow::bail!("target must be an http:// or https:// URL: {}", self.target);
        }
        if self.ping_interval_secs == 0 || self.idle_timeout_secs == 0 || self.request_timeout_secs == 0 {
            anyhow::bail!("Intervals and timeouts must be greater than zero");
        }
        for (name, secs) in [
            ("ping_interval_secs", self.ping_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("reconnect.max_delay_secs", self.reconnect.max_delay_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                anyhow::bail!("{} must be at most {} seconds", name, MAX_TIMEOUT_SECS);
            }
        }
        if self.max_body_bytes == 0 || self.max_body_bytes > MAX_BODY_SIZE {
            anyhow::bail!("max_body_bytes must be between 1 and {}", MAX_BODY_SIZE);
        }
        if self.ping_interval_secs >= self.idle_timeout_secs {
            anyhow::bail!(
                "ping_interval_secs ({}) must be shorter than idle_timeout_secs ({})",
                self.ping_interval_secs,
                self.idle_timeout_secs
            );
        }
        if self.reconnect.initial_delay_secs == 0 || self.reconnect.max_delay_secs < self.reconnect.initial_delay_secs {
            anyhow::bail!("reconnect delays must satisfy 0 < initial_delay_secs <= max_delay_secs");
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["burrow.yml", "burrow.yaml", ".burrow.yml", ".burrow.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// Accept either a full URL or a bare local port for the target.
pub fn normalize_target(target: &str) -> String {
    match target.parse::<u16>() {
        Ok(port) => format!("http://127.0.0.1:{}", port),
        Err(_) => target.trim_end_matches('/').to_string(),
    }
}
