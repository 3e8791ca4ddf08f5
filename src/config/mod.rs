//! Configuration module
//!
//! Handles loading and saving the connector configuration.

mod connector;

pub use connector::*;
