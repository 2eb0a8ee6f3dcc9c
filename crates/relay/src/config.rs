//! Configuration system for the relay
//!
//! Reads config from ~/.config/gridsync/relay.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Environment variable overriding [`RelayConfig::bind`]
pub const BIND_ENV: &str = "GRIDSYNC_BIND";

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address
    pub bind: String,
    /// Accepted `Origin` headers; empty accepts every origin
    pub allowed_origins: Vec<String>,
    /// Largest accepted WebSocket message
    pub max_message_bytes: usize,
    pub heartbeat_secs: u64,
    /// Connections silent for this long are dropped
    pub idle_timeout_secs: u64,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9031".to_string(),
            allowed_origins: Vec::new(),
            max_message_bytes: 8 * 1024 * 1024,
            heartbeat_secs: 30,
            idle_timeout_secs: 300,
            rate_limit_per_sec: 200,
            rate_limit_burst: 400,
        }
    }
}

impl RelayConfig {
    /// Load configuration from default path, then apply `GRIDSYNC_BIND`
    pub fn load() -> Self {
        let path = Self::default_config_path();
        let config = if path.exists() {
            match Self::load_from_path(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable relay config");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.with_bind_override(std::env::var(BIND_ENV).ok())
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridsync")
            .join("relay.toml")
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    #[must_use]
    pub fn with_bind_override(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind.filter(|b| !b.trim().is_empty()) {
            self.bind = bind.trim().to_string();
        }
        self
    }

    /// Create default config file if it doesn't exist
    pub fn create_default_if_missing() -> anyhow::Result<PathBuf> {
        let path = Self::default_config_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = toml::to_string_pretty(&Self::default())?;
            std::fs::write(&path, format!("# gridsync relay configuration\n\n{body}"))?;
        }
        Ok(path)
    }

    /// Ping interval, at least one second
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.bind, "127.0.0.1:9031");
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.max_message_bytes, 8 * 1024 * 1024);
        assert_eq!(config.heartbeat(), Duration::from_secs(30));
    }

    #[test]
    fn reads_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "bind = \"0.0.0.0:7000\"\nallowed_origins = [\"https://sheets.example.com\"]\n",
        )
        .unwrap();
        let config = RelayConfig::load_from_path(&path).unwrap();
        assert_eq!(config.bind, "0.0.0.0:7000");
        assert_eq!(config.allowed_origins, vec!["https://sheets.example.com"]);
        assert_eq!(config.rate_limit_burst, 400);
    }

    #[test]
    fn bad_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "heartbeat_secs = \"often\"").unwrap();
        let err = RelayConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("relay.toml"));
    }

    #[test]
    fn bind_override() {
        let config = RelayConfig::default().with_bind_override(Some("127.0.0.1:1".into()));
        assert_eq!(config.bind, "127.0.0.1:1");
        let config = RelayConfig::default().with_bind_override(None);
        assert_eq!(config.bind, "127.0.0.1:9031");
    }
}
