//! Session connector
//!
//! Drives one activation of the session lifecycle: opens the transport,
//! registers the socket id, runs the authentication handshake, and publishes
//! the authenticated connection. Teardown closes the transport unconditionally.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{Effect, Input, SessionMachine};
use super::{Connection, SessionReader, SessionSlot};
use crate::auth::token_source;
use crate::config::{ConfigError, ConnectorConfig};
use crate::registration::{HttpRegistrar, Registrar, RegistrationError};
use crate::transport::{
    ClientEvent, EventFrame, OutboundSender, Transport, TransportError, TransportEvent,
    TransportLink, WsTransport,
};

/// Capacity of the channel fanning inbound application frames out to consumers
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by the connector and connection handles
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Event '{0}' is reserved for the session handshake")]
    ReservedEvent(String),

    #[error("Connector task failed: {0}")]
    TaskFailed(String),
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// One live activation of the session lifecycle
pub struct SessionConnector {
    id: Uuid,
    reader: SessionReader,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SessionConnector {
    /// Activate with the WebSocket transport and REST registrar described by `config`
    pub fn from_config(config: &ConnectorConfig) -> ConnectorResult<Self> {
        config.validate()?;
        let transport = WsTransport::from_config(config, token_source(config))?;
        let registrar = HttpRegistrar::from_config(config)?;
        Ok(Self::activate(Arc::new(transport), Arc::new(registrar)))
    }

    /// Activate with explicit collaborators. Must be called inside a tokio runtime.
    pub fn activate(transport: Arc<dyn Transport>, registrar: Arc<dyn Registrar>) -> Self {
        let id = Uuid::new_v4();
        let slot = SessionSlot::new();
        let reader = slot.reader();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let driver = Driver::new(id, transport, registrar, slot);
        let task = tokio::spawn(driver.run(shutdown_rx));

        Self {
            id,
            reader,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Activation id, for correlating logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Read-only view of the published connection
    pub fn reader(&self) -> SessionReader {
        self.reader.clone()
    }

    /// Tear down: close the transport, clear the slot, and wait for the driver to stop
    pub async fn deactivate(mut self) -> ConnectorResult<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ConnectorError::TaskFailed(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for SessionConnector {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// State owned by the driver task
struct Driver {
    id: Uuid,
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    registrar: Arc<dyn Registrar>,
    slot: SessionSlot,
    link: Option<TransportLink>,
    /// Outbound queue of the socket currently connected, if any
    socket: Option<OutboundSender>,
    inbound_tx: broadcast::Sender<EventFrame>,
    settled_tx: mpsc::UnboundedSender<Input>,
    settled_rx: Option<mpsc::UnboundedReceiver<Input>>,
}

impl Driver {
    fn new(
        id: Uuid,
        transport: Arc<dyn Transport>,
        registrar: Arc<dyn Registrar>,
        slot: SessionSlot,
    ) -> Self {
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        Self {
            id,
            machine: SessionMachine::new(),
            transport,
            registrar,
            slot,
            link: None,
            socket: None,
            inbound_tx,
            settled_tx,
            settled_rx: Some(settled_rx),
        }
    }

    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let Some(mut settled_rx) = self.settled_rx.take() else {
            return;
        };
        let mut transport_open = true;

        self.apply(Input::Activate);

        loop {
            tokio::select! {
                // Teardown wins over anything else that is ready
                biased;

                _ = shutdown_rx.recv() => {
                    self.apply(Input::Deactivate);
                    break;
                }
                event = next_event(&mut self.link), if transport_open => {
                    match event {
                        Some(event) => self.on_transport_event(event),
                        None => {
                            info!("Transport for activation {} gave up", self.id);
                            transport_open = false;
                        }
                    }
                }
                Some(input) = settled_rx.recv() => {
                    self.apply(input);
                }
            }
        }

        self.slot.clear();
        debug!("Activation {} torn down", self.id);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let input = match event {
            TransportEvent::Connected {
                socket_id,
                outbound,
            } => {
                info!(
                    "Connected to server with socket id: {}",
                    socket_id.as_deref().unwrap_or("<none>")
                );
                self.socket = Some(outbound);
                Input::Connected { socket_id }
            }
            TransportEvent::ConnectError { reason } => {
                self.socket = None;
                Input::ConnectError { reason }
            }
            TransportEvent::Dropped { reason } => {
                self.socket = None;
                Input::Dropped { reason }
            }
            TransportEvent::Authenticated(payload) => Input::AuthenticatedReceived(payload),
            TransportEvent::Message(frame) => {
                // No subscribers is fine
                let _ = self.inbound_tx.send(frame);
                return;
            }
        };
        self.apply(input);
    }

    fn apply(&mut self, input: Input) {
        let before = self.machine.state().name();
        let effects = self.machine.apply(input);
        let after = self.machine.state().name();
        if before != after {
            debug!("Activation {}: {} -> {}", self.id, before, after);
        }
        for effect in effects {
            self.perform(effect);
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport => {
                debug!("Opening transport for activation {}", self.id);
                self.link = Some(self.transport.open());
            }
            Effect::Register { socket_id } => self.spawn_registration(socket_id),
            // `hello` may wait for the next socket; everything else is bound to this one
            Effect::Emit(event @ ClientEvent::Hello(_)) => {
                let Some(link) = &self.link else {
                    debug!("No transport to emit '{}' on", event.name());
                    return;
                };
                debug!("Emitting '{}'", event.name());
                if let Err(e) = link.emit_buffered(event) {
                    debug!("Failed to queue hello: {}", e);
                }
            }
            Effect::Emit(event) => {
                let Some(socket) = &self.socket else {
                    debug!("No socket to emit '{}' on", event.name());
                    return;
                };
                debug!("Emitting '{}'", event.name());
                if let Err(e) = socket.emit(event) {
                    debug!("Socket went away before emit: {}", e);
                }
            }
            Effect::Publish { socket_id, user } => {
                let Some(socket) = &self.socket else {
                    return;
                };
                info!(
                    "Socket authenticates this socketId: {} with user: {}",
                    socket_id, user
                );
                let connection =
                    Connection::new(socket_id, user, socket.clone(), self.inbound_tx.clone());
                self.slot.publish(connection);
            }
            Effect::Unpublish => {
                info!("Withdrawing published connection");
                self.slot.clear();
            }
            Effect::CloseTransport => {
                self.socket = None;
                if let Some(link) = self.link.take() {
                    link.close();
                }
                debug!("Transport for activation {} closed", self.id);
            }
            Effect::Halt(halt) => {
                warn!("{}", halt);
            }
        }
    }

    /// Run the registration call off the driver task; its completion comes back as an input
    fn spawn_registration(&self, socket_id: String) {
        let registrar = Arc::clone(&self.registrar);
        let settled_tx = self.settled_tx.clone();

        tokio::spawn(async move {
            let outcome = match registrar.register(&socket_id).await {
                Ok(binding) => {
                    info!(
                        "SocketId {} is bound to userId {} on the backend",
                        binding.socket_id, binding.user_id
                    );
                    Ok(binding)
                }
                Err(e) => Err(e.to_string()),
            };
            // The activation may be gone by now; then there is nobody to tell
            let _ = settled_tx.send(Input::RegistrationSettled { socket_id, outcome });
        });
    }
}

async fn next_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}
