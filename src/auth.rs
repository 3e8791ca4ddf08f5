//! Connect-time credentials
//!
//! The transport hands a token to the backend when it opens the real-time
//! channel. Real credentials come from outside this crate; the placeholder
//! exists only so a development backend that ignores the token can be reached.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::config::ConnectorConfig;

/// Prefix of the placeholder token
pub const PLACEHOLDER_PREFIX: &str = "my-token";

/// Supplies the token sent with every connection attempt
pub trait TokenSource: Send + Sync {
    /// Token for the next connection attempt
    fn token(&self) -> String;
}

/// A credential supplied by configuration or the command line
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> String {
        self.0.clone()
    }
}

/// Not a credential: `my-token` followed by the current unix time in millis.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderToken;

impl TokenSource for PlaceholderToken {
    fn token(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{}{}", PLACEHOLDER_PREFIX, millis)
    }
}

/// Pick the token source for a configuration
pub fn token_source(config: &ConnectorConfig) -> Arc<dyn TokenSource> {
    match &config.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => {
            warn!("No token configured, using placeholder token (not a real credential)");
            Arc::new(PlaceholderToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        let source = StaticToken::new("secret");
        assert_eq!(source.token(), "secret");
    }

    #[test]
    fn test_placeholder_token_has_timestamp_suffix() {
        let token = PlaceholderToken.token();
        let suffix = token.strip_prefix(PLACEHOLDER_PREFIX).unwrap();
        assert!(!suffix.is_empty());
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_token_source_prefers_configured_token() {
        let config = ConnectorConfig {
            token: Some("abc".to_string()),
            ..Default::default()
        };
        assert_eq!(token_source(&config).token(), "abc");
    }

    #[test]
    fn test_token_source_falls_back_to_placeholder() {
        let config = ConnectorConfig::default();
        assert!(token_source(&config).token().starts_with(PLACEHOLDER_PREFIX));
    }
}
