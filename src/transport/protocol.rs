//! Real-time channel packets
//!
//! The backend speaks Socket.IO v5 over Engine.IO v4 on a WebSocket. Each
//! WebSocket text frame carries one Engine.IO packet: a type digit followed by
//! its payload. Engine.IO `message` packets carry Socket.IO packets, which are
//! again a type digit, an optional namespace and ack id, then a JSON payload:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   engine open
//! 2 / 3                                                     engine ping / pong
//! 40{"token":".."}                                          socket connect (client)
//! 40{"sid":".."}                                            socket connect ack (server)
//! 44{"message":".."}                                        socket connect error
//! 42["authenticate"]                                        socket event
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Inbound: the authentication handshake completed
pub const EVENT_AUTHENTICATED: &str = "authenticated";
/// Outbound: ask the backend to authenticate this socket
pub const EVENT_AUTHENTICATE: &str = "authenticate";
/// Outbound: diagnostic greeting sent after a connection error
pub const EVENT_HELLO: &str = "hello";
/// Names Socket.IO reserves for its own lifecycle; never valid as event names
pub const RESERVED_SOCKET_EVENTS: [&str; 4] =
    ["connect", "connect_error", "disconnect", "disconnecting"];

/// Payload of the diagnostic greeting
pub const HELLO_PAYLOAD: &str = "world";

/// Query string selecting Engine.IO v4 over a bare WebSocket
pub const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet for namespace {0} is not handled")]
    ForeignNamespace(String),

    #[error("Malformed authenticated payload: {0}")]
    MalformedPayload(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Engine.IO
// ============================================================================

/// Parameters the server announces in its `open` packet
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine-level session id, distinct from the Socket.IO socket id
    pub sid: String,
    /// Interval between server pings, in milliseconds
    pub ping_interval: u64,
    /// Grace period after a missed ping, in milliseconds
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// How long the channel may stay silent before it counts as dead
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// One Engine.IO packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    /// Payload is an encoded Socket.IO packet
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    /// Decode one WebSocket text frame
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ProtocolError::InvalidPacket("empty engine packet".to_string()))?;
        let payload = chars.as_str();

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(payload)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(payload.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(ProtocolError::InvalidPacket(format!(
                "unknown engine packet type '{}'",
                other
            ))),
        }
    }

    /// Encode a packet the client sends. `Open` is server-only.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(match self {
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(payload) => format!("4{}", payload),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
            EnginePacket::Open(_) => {
                return Err(ProtocolError::InvalidPacket(
                    "open packets are only sent by the server".to_string(),
                ))
            }
        })
    }
}

// ============================================================================
// Socket.IO
// ============================================================================

/// One application event: a name and its optional payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name
    pub event: String,
    /// Optional payload; several arguments arrive as an array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventFrame {
    /// Create a frame without payload
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    /// Create a frame with a payload
    pub fn with_data(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data: Some(data),
        }
    }

    fn from_args(args: Vec<Value>) -> ProtocolResult<Self> {
        let mut args = args.into_iter();
        let event = match args.next() {
            Some(Value::String(event)) if !event.is_empty() => event,
            _ => {
                return Err(ProtocolError::InvalidPacket(
                    "event packet must start with a non-empty name".to_string(),
                ))
            }
        };
        let mut rest: Vec<Value> = args.collect();
        let data = match rest.len() {
            0 => None,
            1 => rest.pop(),
            _ => Some(Value::Array(rest)),
        };
        Ok(Self { event, data })
    }

    fn to_args(&self) -> Value {
        let mut args = vec![Value::String(self.event.clone())];
        if let Some(data) = &self.data {
            args.push(data.clone());
        }
        Value::Array(args)
    }
}

/// One Socket.IO packet on the default namespace
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Client: auth payload. Server: `{"sid": ..}` acknowledgement.
    Connect(Option<Value>),
    Disconnect,
    Event(EventFrame),
    ConnectError(Value),
    /// Acks and binary packets, which this client never requests
    Unsupported(char),
}

impl SocketPacket {
    /// Decode the payload of an Engine.IO `message` packet
    pub fn decode(payload: &str) -> ProtocolResult<Self> {
        let mut chars = payload.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ProtocolError::InvalidPacket("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        // Attachment count of binary packets
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 && rest[digits..].starts_with('-') {
            rest = &rest[digits + 1..];
        }

        if rest.starts_with('/') {
            let (namespace, tail) = match rest.find(',') {
                Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                None => (rest, ""),
            };
            if namespace != "/" {
                return Err(ProtocolError::ForeignNamespace(namespace.to_string()));
            }
            rest = tail;
        }

        // Ack id, if any
        let body = rest.trim_start_matches(|c: char| c.is_ascii_digit());
        let data: Option<Value> = if body.is_empty() {
            None
        } else {
            Some(serde_json::from_str(body)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect(data)),
            '1' => Ok(SocketPacket::Disconnect),
            '2' => match data {
                Some(Value::Array(args)) => Ok(SocketPacket::Event(EventFrame::from_args(args)?)),
                _ => Err(ProtocolError::InvalidPacket(
                    "event packet must carry an array".to_string(),
                )),
            },
            '4' => Ok(SocketPacket::ConnectError(data.unwrap_or(Value::Null))),
            '3' | '5' | '6' => Ok(SocketPacket::Unsupported(kind)),
            other => Err(ProtocolError::InvalidPacket(format!(
                "unknown socket packet type '{}'",
                other
            ))),
        }
    }

    /// Encode as the payload of an Engine.IO `message` packet
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event(frame) => format!("2{}", serde_json::to_string(&frame.to_args())?),
            SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
            SocketPacket::Unsupported(kind) => {
                return Err(ProtocolError::InvalidPacket(format!(
                    "socket packet type '{}' is not sent by this client",
                    kind
                )))
            }
        })
    }

    /// Encode as a complete WebSocket text frame
    pub fn to_text(&self) -> ProtocolResult<String> {
        EnginePacket::Message(self.encode()?).encode()
    }
}

// ============================================================================
// Outbound Events
// ============================================================================

/// Events the client sends over the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Start the authentication handshake
    Authenticate,
    /// Diagnostic greeting, carries no protocol meaning
    Hello(String),
    /// Application event emitted through a published connection
    Custom { event: String, data: Option<Value> },
}

impl ClientEvent {
    /// The diagnostic greeting sent after a connection error
    pub fn hello() -> Self {
        ClientEvent::Hello(HELLO_PAYLOAD.to_string())
    }

    /// Convert to an event frame
    pub fn to_frame(&self) -> EventFrame {
        match self {
            ClientEvent::Authenticate => EventFrame::new(EVENT_AUTHENTICATE),
            ClientEvent::Hello(payload) => {
                EventFrame::with_data(EVENT_HELLO, Value::String(payload.clone()))
            }
            ClientEvent::Custom { event, data } => EventFrame {
                event: event.clone(),
                data: data.clone(),
            },
        }
    }

    /// Encode as a WebSocket text frame
    pub fn to_text(&self) -> ProtocolResult<String> {
        SocketPacket::Event(self.to_frame()).to_text()
    }

    /// Event name on the wire
    pub fn name(&self) -> &str {
        match self {
            ClientEvent::Authenticate => EVENT_AUTHENTICATE,
            ClientEvent::Hello(_) => EVENT_HELLO,
            ClientEvent::Custom { event, .. } => event,
        }
    }
}

// ============================================================================
// Inbound Events
// ============================================================================

/// What a Socket.IO packet means to the session
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Namespace connected; the socket id is absent if the backend assigned none
    Connect { socket_id: Option<String> },
    /// The backend refused the namespace connection
    ConnectError { message: String },
    /// The backend closed the socket
    Disconnect,
    /// Handshake result, validated by the session state machine
    Authenticated(Value),
    /// Anything else, forwarded to consumers of the published connection
    Other(EventFrame),
    /// Nothing the session acts on
    Ignored,
}

impl ServerEvent {
    /// Classify an inbound packet
    pub fn from_packet(packet: SocketPacket) -> Self {
        match packet {
            SocketPacket::Connect(data) => {
                let socket_id = data
                    .as_ref()
                    .and_then(|d| d.get("sid"))
                    .and_then(Value::as_str)
                    .filter(|sid| !sid.is_empty())
                    .map(String::from);
                ServerEvent::Connect { socket_id }
            }
            SocketPacket::ConnectError(data) => {
                let message = match &data {
                    Value::String(s) => s.clone(),
                    Value::Null => "connection error".to_string(),
                    data => data
                        .get("message")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| data.to_string()),
                };
                ServerEvent::ConnectError { message }
            }
            SocketPacket::Disconnect => ServerEvent::Disconnect,
            SocketPacket::Event(frame) if frame.event == EVENT_AUTHENTICATED => {
                ServerEvent::Authenticated(frame.data.unwrap_or(Value::Null))
            }
            SocketPacket::Event(frame) => ServerEvent::Other(frame),
            SocketPacket::Unsupported(_) => ServerEvent::Ignored,
        }
    }
}

/// Validated `authenticated` payload
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedPayload {
    /// Socket the backend authenticated
    pub socket_id: String,
    /// Opaque user identity
    pub user: Value,
}

impl AuthenticatedPayload {
    /// Validate the raw payload: an object with a non-empty string `socketId` and a `user`
    pub fn parse(payload: &Value) -> ProtocolResult<Self> {
        let object = payload.as_object().ok_or_else(|| {
            ProtocolError::MalformedPayload(format!("expected an object, got {}", payload))
        })?;

        let socket_id = object
            .get("socketId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProtocolError::MalformedPayload("socketId must be a non-empty string".to_string())
            })?;

        let user = object
            .get("user")
            .ok_or_else(|| ProtocolError::MalformedPayload("user is missing".to_string()))?;

        Ok(Self {
            socket_id: socket_id.to_string(),
            user: user.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
