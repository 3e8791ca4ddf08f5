//! Socket registration client
//!
//! Binds a transport-assigned socket id to the logged-in user with a single
//! `POST /api/me/socketIds` call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ConnectorConfig};

/// Errors that can occur while registering a socket id
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registration rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for registration operations
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Request body of the registration call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest<'a> {
    pub socket_id: &'a str,
}

/// Backend-side association between a socket id and a user
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    pub socket_id: String,
    pub user_id: serde_json::Value,
}

/// Registers socket ids with the backend
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, socket_id: &str) -> RegistrationResult<SessionBinding>;
}

/// Registrar backed by the REST endpoint
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
    session_cookie: Option<String>,
}

impl HttpRegistrar {
    /// Create a registrar posting to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            session_cookie: None,
        }
    }

    /// Create a registrar from the connector configuration
    pub fn from_config(config: &ConnectorConfig) -> RegistrationResult<Self> {
        let registrar = Self::new(config.registration_url()?)
            .with_session_cookie(config.session_cookie.clone());
        Ok(registrar)
    }

    /// Send `cookie` with every registration call
    pub fn with_session_cookie(mut self, cookie: Option<String>) -> Self {
        self.session_cookie = cookie;
        self
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, socket_id: &str) -> RegistrationResult<SessionBinding> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&RegistrationRequest { socket_id });

        if let Some(cookie) = &self.session_cookie {
            let value = reqwest::header::HeaderValue::from_str(cookie)
                .map_err(|e| RegistrationError::InvalidHeader(e.to_string()))?;
            request = request.header(reqwest::header::COOKIE, value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let binding: SessionBinding = resp.json().await?;
        debug!(
            "Registration of {} answered with binding for {}",
            socket_id, binding.socket_id
        );
        Ok(binding)
    }
}
