//! WebSocket transport
//!
//! Owns the real-time connection on a background task. The task runs the
//! Engine.IO/Socket.IO handshake, reports lifecycle callbacks (`connect`,
//! `connect_error`, drops, `authenticated`) to the session connector and
//! applies the configured retry policy on its own; the connector never
//! reconnects.
//!
//! Every connected socket gets its own outbound queue, handed to the connector
//! with the `Connected` callback. When the socket goes away the queue goes with
//! it, so senders bound to an old socket fail instead of leaking frames onto
//! the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{
    ClientEvent, EnginePacket, EventFrame, OpenHandshake, ProtocolError, ServerEvent,
    SocketPacket, ENGINE_IO_QUERY,
};
use crate::auth::TokenSource;
use crate::config::{ConfigError, ConnectorConfig, ReconnectionPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the inbound event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long the whole handshake may take, matching the Socket.IO client default
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("{0}")]
    Refused(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Callbacks delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A socket is up; `socket_id` is whatever the backend assigned and
    /// `outbound` reaches this socket only
    Connected {
        socket_id: Option<String>,
        outbound: OutboundSender,
    },
    /// A connection attempt failed or the backend refused the connection
    ConnectError { reason: String },
    /// An established socket went away
    Dropped { reason: String },
    /// Raw `authenticated` payload
    Authenticated(serde_json::Value),
    /// Application event for consumers of the published connection
    Message(EventFrame),
}

/// Connector-side end of a live transport
pub struct TransportLink {
    events: mpsc::Receiver<TransportEvent>,
    buffered: mpsc::UnboundedSender<ClientEvent>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

/// Transport-side end of a [`TransportLink`]
pub struct TransportPeer {
    /// Callbacks towards the connector
    pub events: mpsc::Sender<TransportEvent>,
    /// Frames held until a socket is connected
    pub buffered: mpsc::UnboundedReceiver<ClientEvent>,
    /// Fires when the connector closes the link
    pub shutdown: broadcast::Receiver<()>,
}

impl TransportLink {
    /// Create a connected link/peer pair
    pub fn pair() -> (TransportLink, TransportPeer) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (buffered_tx, buffered_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let link = TransportLink {
            events: events_rx,
            buffered: buffered_tx,
            shutdown_tx,
            closed: AtomicBool::new(false),
        };
        let peer = TransportPeer {
            events: events_tx,
            buffered: buffered_rx,
            shutdown: shutdown_rx,
        };
        (link, peer)
    }

    /// Receive the next callback; `None` once the transport has given up
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Queue an event for the socket that is connected now, or the next one to connect
    pub fn emit_buffered(&self, event: ClientEvent) -> TransportResult<()> {
        self.buffered.send(event).map_err(|_| TransportError::Closed)
    }

    /// Close the transport. Safe to call any number of times, in any state.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable handle that queues outbound events on one connected socket
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl OutboundSender {
    /// Create a sender and the queue it feeds
    pub fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundSender { tx }, rx)
    }

    /// Queue an outbound event; fails once the socket is gone
    pub fn emit(&self, event: ClientEvent) -> TransportResult<()> {
        self.tx.send(event).map_err(|_| TransportError::Closed)
    }

    /// Whether the socket has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for OutboundSender {
    fn eq(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Opens a transport for one activation
pub trait Transport: Send + Sync {
    fn open(&self) -> TransportLink;
}

/// Socket.IO-over-WebSocket transport with token handshake and retry policy
#[derive(Clone)]
pub struct WsTransport {
    url: String,
    tokens: Arc<dyn TokenSource>,
    policy: ReconnectionPolicy,
}

impl WsTransport {
    /// Create a transport for an explicit endpoint URL, e.g. `ws://host/socket.io/`
    pub fn new(
        url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        policy: ReconnectionPolicy,
    ) -> Self {
        Self {
            url: url.into(),
            tokens,
            policy,
        }
    }

    /// Create a transport from the connector configuration
    pub fn from_config(
        config: &ConnectorConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> TransportResult<Self> {
        Ok(Self::new(
            config.socket_url()?,
            tokens,
            config.reconnection.clone(),
        ))
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// URL of the WebSocket upgrade, with the Engine.IO query
    fn handshake_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, ENGINE_IO_QUERY)
    }
}

impl Transport for WsTransport {
    fn open(&self) -> TransportLink {
        let (link, peer) = TransportLink::pair();
        let transport = self.clone();
        tokio::spawn(async move {
            transport.run(peer).await;
        });
        link
    }
}

/// A socket that completed the Socket.IO handshake
struct Session {
    ws: WsStream,
    socket_id: Option<String>,
    liveness: Duration,
}

/// How a served socket ended
enum Served {
    Shutdown,
    Dropped(String),
}

impl WsTransport {
    /// Connect, serve, and retry until closed or the policy gives up
    async fn run(self, mut peer: TransportPeer) {
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = peer.shutdown.recv() => break,
                result = self.connect() => result,
            };

            match result {
                Ok(session) => {
                    info!("Connected to {}", self.url);
                    attempt = 0;

                    let (outbound, socket_rx) = OutboundSender::channel();
                    let connected = TransportEvent::Connected {
                        socket_id: session.socket_id.clone(),
                        outbound,
                    };
                    if peer.events.send(connected).await.is_err() {
                        break;
                    }

                    // socket_rx is dropped with the socket, discarding whatever is still queued
                    match serve(session, socket_rx, &mut peer).await {
                        Served::Shutdown => break,
                        Served::Dropped(reason) => {
                            info!("Connection to {} dropped: {}", self.url, reason);
                            if peer
                                .events
                                .send(TransportEvent::Dropped { reason })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", self.url, e);
                    if peer
                        .events
                        .send(TransportEvent::ConnectError {
                            reason: e.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            attempt += 1;
            if !self.policy.allows(attempt) {
                debug!("Retry policy exhausted after {} attempts", attempt);
                break;
            }
            let delay = self.policy.delay_for(attempt);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = peer.shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Transport task for {} finished", self.url);
    }

    async fn connect(&self) -> TransportResult<Session> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake())
            .await
            .map_err(|_| TransportError::Handshake("timed out".to_string()))?
    }

    /// Open the WebSocket, await the engine `open`, then connect the default
    /// namespace presenting the token
    async fn handshake(&self) -> TransportResult<Session> {
        let (mut ws, _) = connect_async(self.handshake_url()).await?;

        let open: OpenHandshake = match read_packet(&mut ws).await? {
            EnginePacket::Open(open) => open,
            other => {
                return Err(TransportError::Handshake(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
        };
        debug!("Engine session {} opened", open.sid);

        let auth = SocketPacket::Connect(Some(json!({ "token": self.tokens.token() })));
        ws.send(Message::Text(auth.to_text()?)).await?;

        loop {
            match read_packet(&mut ws).await? {
                EnginePacket::Ping => ws.send(Message::Text(EnginePacket::Pong.encode()?)).await?,
                EnginePacket::Message(payload) => {
                    match ServerEvent::from_packet(SocketPacket::decode(&payload)?) {
                        ServerEvent::Connect { socket_id } => {
                            return Ok(Session {
                                ws,
                                socket_id,
                                liveness: open.liveness_window(),
                            })
                        }
                        ServerEvent::ConnectError { message } => {
                            return Err(TransportError::Refused(message))
                        }
                        other => debug!("Ignoring {:?} before connect", other),
                    }
                }
                EnginePacket::Close => {
                    return Err(TransportError::Handshake(
                        "closed during handshake".to_string(),
                    ))
                }
                other => debug!("Ignoring {:?} during handshake", other),
            }
        }
    }
}

/// Read the next Engine.IO packet during the handshake
async fn read_packet(ws: &mut WsStream) -> TransportResult<EnginePacket> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(EnginePacket::decode(&text)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "closed during handshake".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Pump frames between the socket and the peer until one side goes away
async fn serve(
    session: Session,
    mut socket_rx: mpsc::UnboundedReceiver<ClientEvent>,
    peer: &mut TransportPeer,
) -> Served {
    let (mut sink, mut stream) = session.ws.split();
    let liveness = tokio::time::sleep(session.liveness);
    tokio::pin!(liveness);

    loop {
        let outbound = tokio::select! {
            _ = peer.shutdown.recv() => {
                if let Ok(text) = SocketPacket::Disconnect.to_text() {
                    let _ = sink.send(Message::Text(text)).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                return Served::Shutdown;
            }
            _ = &mut liveness => {
                return Served::Dropped("ping timeout".to_string());
            }
            Some(event) = socket_rx.recv() => event,
            Some(event) = peer.buffered.recv() => event,
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary frame ({} bytes), ignoring", data.len());
                        continue;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return Served::Dropped(e.to_string());
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        return Served::Dropped("closed by server".to_string());
                    }
                    Some(Err(e)) => return Served::Dropped(e.to_string()),
                    None => return Served::Dropped("stream ended".to_string()),
                };

                debug!("Received packet: {}", text);
                liveness
                    .as_mut()
                    .reset(tokio::time::Instant::now() + session.liveness);

                let payload = match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping) => {
                        let pong = EnginePacket::Pong.encode().unwrap_or_default();
                        if let Err(e) = sink.send(Message::Text(pong)).await {
                            return Served::Dropped(e.to_string());
                        }
                        continue;
                    }
                    Ok(EnginePacket::Close) => {
                        return Served::Dropped("transport close".to_string());
                    }
                    Ok(EnginePacket::Message(payload)) => payload,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Ignoring invalid packet: {}", e);
                        continue;
                    }
                };

                let event = match SocketPacket::decode(&payload) {
                    Ok(packet) => ServerEvent::from_packet(packet),
                    Err(ProtocolError::ForeignNamespace(ns)) => {
                        debug!("Ignoring packet for namespace {}", ns);
                        continue;
                    }
                    Err(e) => {
                        warn!("Ignoring invalid packet: {}", e);
                        continue;
                    }
                };

                let event = match event {
                    ServerEvent::Authenticated(payload) => TransportEvent::Authenticated(payload),
                    ServerEvent::Other(frame) => TransportEvent::Message(frame),
                    ServerEvent::Disconnect => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Served::Dropped("io server disconnect".to_string());
                    }
                    ServerEvent::ConnectError { message } => {
                        let _ = sink.send(Message::Close(None)).await;
                        return Served::Dropped(message);
                    }
                    ServerEvent::Connect { .. } | ServerEvent::Ignored => continue,
                };
                if peer.events.send(event).await.is_err() {
                    let _ = sink.send(Message::Close(None)).await;
                    return Served::Shutdown;
                }
                continue
            }
        };

        let text = match outbound.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unserializable '{}' event: {}", outbound.name(), e);
                continue;
            }
        };
        debug!("Sending packet: {}", text);
        if let Err(e) = sink.send(Message::Text(text)).await {
            return Served::Dropped(e.to_string());
        }
    }
}
