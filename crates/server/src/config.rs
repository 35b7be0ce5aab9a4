use std::path::{Path, PathBuf};
use std::time::Duration;

use orchestrator::RunSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay configuration, as read from an optional TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Timing knobs, in the units named by each key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub file_timeout_secs: u64,
    pub sentinel_grace_ms: u64,
    pub linger_secs: u64,
    pub terminate_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let settings = RunSettings::default();
        Self {
            poll_interval_ms: settings.poll_interval.as_millis() as u64,
            file_timeout_secs: settings.file_timeout.as_secs(),
            sentinel_grace_ms: settings.sentinel_grace.as_millis() as u64,
            linger_secs: settings.linger.as_secs(),
            terminate_grace_secs: settings.terminate_grace.as_secs(),
        }
    }
}

impl RelayConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timing.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn run_settings(&self) -> RunSettings {
        let timing = &self.timing;
        RunSettings {
            poll_interval: Duration::from_millis(timing.poll_interval_ms),
            file_timeout: Duration::from_secs(timing.file_timeout_secs),
            sentinel_grace: Duration::from_millis(timing.sentinel_grace_ms),
            linger: Duration::from_secs(timing.linger_secs),
            terminate_grace: Duration::from_secs(timing.terminate_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8765");

        let settings = config.run_settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.file_timeout, Duration::from_secs(30));
        assert_eq!(settings.sentinel_grace, Duration::from_millis(500));
        assert_eq!(settings.linger, Duration::from_secs(2));
        assert_eq!(settings.terminate_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = RelayConfig::parse(
            r#"
            [server]
            port = 9000

            [timing]
            file_timeout_secs = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.timing.file_timeout_secs, 300);
        assert_eq!(config.timing.poll_interval_ms, 100);
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let err = RelayConfig::parse("[timing]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let err = RelayConfig::parse("[server\nport = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nhost = \"127.0.0.1\"\n").unwrap();

        let config = RelayConfig::load_or_default(Some(&path)).await.unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8765");

        let missing = RelayConfig::load(&dir.path().join("missing.toml")).await;
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
