//! Real-time session bootstrap for the messaging client.
//!
//! Opens the real-time channel, binds the socket id to the logged-in user over
//! REST, runs the `authenticate`/`authenticated` handshake, and publishes the
//! authenticated [`Connection`] through a [`SessionReader`].

pub mod auth;
pub mod config;
pub mod registration;
pub mod session;
pub mod transport;

pub use config::{ConnectorConfig, Environment};
pub use session::{Connection, ConnectorError, SessionConnector, SessionReader};
