//! Engine configuration
//!
//! Reads `~/.config/gridsync/engine.toml`; every key is optional.
//! `GRIDSYNC_ENDPOINT` overrides the endpoint from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::ReconnectPolicy;
use crate::error::{Result, SyncError};

/// Environment variable overriding [`EngineConfig::endpoint`]
pub const ENDPOINT_ENV: &str = "GRIDSYNC_ENDPOINT";

/// Configuration of one client engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base WebSocket URL of the sync relay; the room is appended as a path
    pub endpoint: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long a starting session waits for the first sync before seeding
    pub bootstrap_timeout_ms: u64,
    pub save_debounce_ms: u64,
    /// Skip the sync channel entirely
    pub offline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9031".to_string(),
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            bootstrap_timeout_ms: 3_000,
            save_debounce_ms: 500,
            offline: false,
        }
    }
}

impl EngineConfig {
    /// Load from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::default_config_path();
        let config = if path.exists() {
            Self::load_from_path(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable engine config");
                Self::default()
            })
        } else {
            Self::default()
        };
        config.with_env_overrides()
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gridsync")
            .join("engine.toml")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Apply `GRIDSYNC_ENDPOINT` if set
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_endpoint_override(std::env::var(ENDPOINT_ENV).ok())
    }

    fn with_endpoint_override(mut self, endpoint: Option<String>) -> Self {
        if let Some(endpoint) = endpoint.filter(|e| !e.trim().is_empty()) {
            self.endpoint = endpoint.trim().to_string();
        }
        self
    }

    /// Write a default config file if none exists, returning its path
    pub fn create_default_if_missing() -> Result<PathBuf> {
        let path = Self::default_config_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = toml::to_string_pretty(&Self::default())
                .map_err(|e| SyncError::Config(e.to_string()))?;
            std::fs::write(&path, format!("# gridsync engine configuration\n\n{body}"))?;
        }
        Ok(path)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub const fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub const fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.endpoint, "ws://127.0.0.1:9031");
        assert_eq!(config.initial_backoff_ms, 250);
        assert_eq!(config.max_backoff_ms, 10_000);
        assert_eq!(config.bootstrap_timeout(), Duration::from_secs(3));
        assert_eq!(config.save_debounce(), Duration::from_millis(500));
        assert!(!config.offline);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
endpoint = "wss://sync.example.com"
save_debounce_ms = 50
"#,
        )
        .unwrap();
        assert_eq!(config.endpoint, "wss://sync.example.com");
        assert_eq!(config.save_debounce_ms, 50);
        assert_eq!(config.bootstrap_timeout_ms, 3_000);
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let err = EngineConfig::from_toml("save_debounce_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "offline = true\n").unwrap();
        assert!(EngineConfig::load_from_path(&path).unwrap().offline);
    }

    #[test]
    fn endpoint_override() {
        let config = EngineConfig::default().with_endpoint_override(Some("ws://relay:1".into()));
        assert_eq!(config.endpoint, "ws://relay:1");
        let config = EngineConfig::default().with_endpoint_override(Some("  ".into()));
        assert_eq!(config.endpoint, EngineConfig::default().endpoint);
    }
}
