//! Relay configuration
//!
//! Loaded from `burrow-relay.yml` (or a path given with `--config`); every
//! field has a default so the relay also runs without any file.
//!
//! ```yaml
//! listen: 0.0.0.0:8000
//! tunnel_path: /ws
//! idle_timeout_secs: 120
//! request_timeout_secs: 600
//! max_body_bytes: 10485760
//! handshake_policy: replace   # or: reject
//! forwarded_headers: false
//! ```

use anyhow::{Context, Result};
use burrow_shared::protocol::MAX_BODY_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when an agent connects while another is still attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// Evict the current agent; its pending requests fail immediately
    #[default]
    Replace,
    /// Refuse the newcomer with 409 Conflict
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Public listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path of the agent handshake endpoint
    #[serde(default = "default_tunnel_path")]
    pub tunnel_path: String,

    /// Seconds without any frame before the tunnel is declared dead
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body forwarded through the tunnel
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub handshake_policy: HandshakePolicy,

    /// Inject X-Forwarded-* headers into forwarded requests
    #[serde(default)]
    pub forwarded_headers: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tunnel_path: default_tunnel_path(),
            idle_timeout_secs: default_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body(),
            handshake_policy: HandshakePolicy::default(),
            forwarded_headers: false,
        }
    }
}

/// Upper bound for either timeout (one week)
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_tunnel_path() -> String {
    "/ws".to_string()
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    600
}

fn default_max_body() -> usize {
    10 * 1024 * 1024
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if !self.tunnel_path.starts_with('/') {
            anyhow::bail!("tunnel_path must start with '/': {}", self.tunnel_path);
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("idle_timeout_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.idle_timeout_secs > MAX_TIMEOUT_SECS || self.request_timeout_secs > MAX_TIMEOUT_SECS {
            anyhow::bail!("timeouts must be at most {} seconds", MAX_TIMEOUT_SECS);
        }
        if self.max_body_bytes > MAX_BODY_SIZE {
            anyhow::bail!("max_body_bytes must be at most {} to fit in one tunnel frame", MAX_BODY_SIZE);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Look for a config file in the working directory
    pub fn find_config() -> Option<PathBuf> {
        ["burrow-relay.yml", "burrow-relay.yaml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}
