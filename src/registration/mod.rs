//! Registration module
//!
//! Binds a socket id to the caller's session over REST.

mod client;

pub use client::*;
