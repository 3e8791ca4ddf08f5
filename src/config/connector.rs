//! Connector configuration
//!
//! Loads the connector settings from `session-connector.toml`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
pub const CONFIG_FILE: &str = "session-connector.toml";

/// Backend origin used in development
pub const DEV_ORIGIN: &str = "http://localhost:3000";

/// Default path of the Socket.IO endpoint
pub const DEFAULT_SOCKET_PATH: &str = "/socket.io/";

/// Default path of the socket registration endpoint
pub const DEFAULT_REGISTRATION_PATH: &str = "/api/me/socketIds";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Deployment environment, decides where the backend lives
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local backend at [`DEV_ORIGIN`] unless overridden
    #[default]
    Development,
    /// Same-origin deployment, `origin` must be set
    Production,
}

/// Transport retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Whether the transport retries at all
    pub enabled: bool,
    /// Maximum number of retries, 0 means unlimited
    pub attempts: u32,
    /// Initial delay between attempts
    pub delay_ms: u64,
    /// Upper bound for the doubling delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 0,
            delay_ms: 1000,
            max_delay_ms: 5000,
        }
    }
}

impl ReconnectionPolicy {
    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether retry number `attempt` (1-based) is allowed
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.attempts == 0 || attempt <= self.attempts)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms.max(self.delay_ms)))
    }
}

/// Connector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Deployment environment
    pub environment: Environment,
    /// Backend origin, e.g. `https://chat.example.com`
    pub origin: Option<String>,
    /// Path of the real-time endpoint
    pub socket_path: String,
    /// Path of the registration endpoint
    pub registration_path: String,
    /// Credential handed to the transport at connect time
    pub token: Option<String>,
    /// Cookie identifying the logged-in user to the REST backend
    pub session_cookie: Option<String>,
    /// Transport retry policy
    pub reconnection: ReconnectionPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            origin: None,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            registration_path: DEFAULT_REGISTRATION_PATH.to_string(),
            token: None,
            session_cookie: None,
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from a TOML file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ConnectorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check that the configuration can produce usable endpoints
    pub fn validate(&self) -> ConfigResult<()> {
        let base = self.base_url()?;
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "origin must be an http(s) URL, got {}",
                base
            )));
        }
        for (name, path) in [
            ("socket_path", &self.socket_path),
            ("registration_path", &self.registration_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with '/', got {}",
                    name, path
                )));
            }
        }
        Ok(())
    }

    /// Backend origin without a trailing slash
    pub fn base_url(&self) -> ConfigResult<String> {
        let origin = match (self.environment, self.origin.as_deref()) {
            (_, Some(origin)) => origin,
            (Environment::Development, None) => DEV_ORIGIN,
            (Environment::Production, None) => {
                return Err(ConfigError::Invalid(
                    "origin is required in production".to_string(),
                ))
            }
        };
        Ok(origin.trim_end_matches('/').to_string())
    }

    /// WebSocket URL of the Socket.IO endpoint
    pub fn socket_url(&self) -> ConfigResult<String> {
        let base = self.base_url()?;
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(ConfigError::Invalid(format!(
                "origin must be an http(s) URL, got {}",
                base
            )));
        };
        Ok(format!("{}{}", ws_base, self.socket_path))
    }

    /// URL of the registration endpoint
    pub fn registration_url(&self) -> ConfigResult<String> {
        Ok(format!("{}{}", self.base_url()?, self.registration_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ConnectorConfig::default();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.socket_path, "/socket.io/");
        assert_eq!(config.registration_path, "/api/me/socketIds");
        assert!(config.token.is_none());
        assert!(config.reconnection.enabled);
    }

    #[test]
    fn test_development_urls() {
        let config = ConnectorConfig::default();
        assert_eq!(config.base_url().unwrap(), "http://localhost:3000");
        assert_eq!(
            config.socket_url().unwrap(),
            "ws://localhost:3000/socket.io/"
        );
        assert_eq!(
            config.registration_url().unwrap(),
            "http://localhost:3000/api/me/socketIds"
        );
    }

    #[test]
    fn test_production_requires_origin() {
        let config = ConnectorConfig {
            environment: Environment::Production,
            ..Default::default()
        };
        assert!(matches!(config.base_url(), Err(ConfigError::Invalid(_))));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_https_origin() {
        let config = ConnectorConfig {
            environment: Environment::Production,
            origin: Some("https://chat.example.com/".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.socket_url().unwrap(),
            "wss://chat.example.com/socket.io/"
        );
        assert_eq!(
            config.registration_url().unwrap(),
            "https://chat.example.com/api/me/socketIds"
        );
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let config = ConnectorConfig {
            registration_path: "api/me/socketIds".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_origin() {
        let config = ConnectorConfig {
            origin: Some("ftp://example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = ConnectorConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ConnectorConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
environment = "production"
origin = "https://chat.example.com"

[reconnection]
attempts = 3
"#,
        )
        .unwrap();

        let config = ConnectorConfig::load(&path).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.reconnection.attempts, 3);
        assert_eq!(config.reconnection.delay_ms, 1000);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "environment = [").unwrap();
        assert!(matches!(
            ConnectorConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = ConnectorConfig {
            token: Some("secret".to_string()),
            session_cookie: Some("sid=abc".to_string()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ConnectorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_reconnection_delay_doubles_and_caps() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_reconnection_attempt_limits() {
        let unlimited = ReconnectionPolicy::default();
        assert!(unlimited.allows(1_000));

        let limited = ReconnectionPolicy {
            attempts: 2,
            ..Default::default()
        };
        assert!(limited.allows(2));
        assert!(!limited.allows(3));

        assert!(!ReconnectionPolicy::disabled().allows(1));
    }
}
