//! Session lifecycle module
//!
//! The state machine, the connector that drives it, and the read-only slot
//! through which consumers observe the authenticated connection.

mod connection;
mod connector;
mod slot;
pub mod state;

pub use connection::*;
pub use connector::*;
pub use slot::*;
pub use state::{Halt, SessionState};
