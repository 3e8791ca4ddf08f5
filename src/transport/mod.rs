//! Real-time transport module
//!
//! Frame definitions and the WebSocket transport that carries them.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
