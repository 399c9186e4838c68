//! Server configuration.
//!
//! Loading flow: compiled defaults, optionally overlaid by a JSON file,
//! then environment variables (highest priority).

use std::path::Path;

use serde::{Deserialize, Serialize};

use pulse_hub::HubConfig;

/// Configuration for the gateway process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Bearer secret for the privileged broadcast endpoint. Empty
    /// disables the endpoint entirely.
    pub shared_secret: String,
    /// Heartbeat sweep cadence in seconds, independent of the heartbeat
    /// period itself.
    pub sweep_interval_secs: u64,
    /// Hub tunables (caps, heartbeat windows, scheduler bounds).
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            shared_secret: String::new(),
            sweep_interval_secs: 60,
            hub: HubConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ServerConfig {
    /// Load from a JSON file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment overrides (highest priority). Invalid values are
    /// silently ignored, falling back to file or default.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PULSE_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Some(port) = read_env_parsed::<u16>("PULSE_PORT") {
            self.port = port;
        }
        if let Ok(secret) = std::env::var("PULSE_SHARED_SECRET") {
            if !secret.is_empty() {
                self.shared_secret = secret;
            }
        }
        if let Some(v) = read_env_parsed::<usize>("PULSE_MAX_CONNECTIONS_PER_USER") {
            self.hub.max_connections_per_user = v;
        }
        if let Some(v) = read_env_parsed::<usize>("PULSE_MAX_TOTAL_CONNECTIONS") {
            self.hub.max_total_connections = v;
        }
        if let Some(v) = read_env_parsed::<u64>("PULSE_HEARTBEAT_TIMEOUT_MS") {
            self.hub.heartbeat_timeout_ms = v;
        }
    }
}

fn read_env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
