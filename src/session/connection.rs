//! Authenticated connection handle
//!
//! What consumers receive once the handshake has completed. It carries the
//! bound socket id and user, and lets consumers exchange application events
//! on the live channel.

use serde_json::Value;
use tokio::sync::broadcast;

use super::ConnectorError;
use crate::transport::{
    ClientEvent, EventFrame, OutboundSender, EVENT_AUTHENTICATE, EVENT_HELLO,
    RESERVED_SOCKET_EVENTS,
};

/// Handshake events consumers may not emit themselves
const HANDSHAKE_EVENTS: [&str; 2] = [EVENT_AUTHENTICATE, EVENT_HELLO];

fn is_reserved(event: &str) -> bool {
    event.is_empty() || HANDSHAKE_EVENTS.contains(&event) || RESERVED_SOCKET_EVENTS.contains(&event)
}

/// Handle to an authenticated real-time channel
#[derive(Debug, Clone)]
pub struct Connection {
    socket_id: String,
    user: Value,
    outbound: OutboundSender,
    inbound: broadcast::Sender<EventFrame>,
}

impl Connection {
    pub(crate) fn new(
        socket_id: String,
        user: Value,
        outbound: OutboundSender,
        inbound: broadcast::Sender<EventFrame>,
    ) -> Self {
        Self {
            socket_id,
            user,
            outbound,
            inbound,
        }
    }

    /// Socket id the backend bound to the user
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// User identity from the handshake, opaque to this crate
    pub fn user(&self) -> &Value {
        &self.user
    }

    /// Whether the socket this handle was authenticated on is still up.
    /// Turns false for good once that socket drops, even if the transport reconnects.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Emit an application event on the channel. Fails with a closed transport
    /// error once the handle has been withdrawn.
    pub fn emit(&self, event: impl Into<String>, data: Option<Value>) -> Result<(), ConnectorError> {
        let event = event.into();
        if is_reserved(&event) {
            return Err(ConnectorError::ReservedEvent(event));
        }
        self.outbound.emit(ClientEvent::Custom { event, data })?;
        Ok(())
    }

    /// Receive application events arriving on the channel
    pub fn subscribe(&self) -> broadcast::Receiver<EventFrame> {
        self.inbound.subscribe()
    }
}
