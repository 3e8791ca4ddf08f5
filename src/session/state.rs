//! Session lifecycle state machine
//!
//! `Disconnected → Connecting → Registering → Authenticating → Authenticated`,
//! with `Errored` entered on any transport-level connection error.
//!
//! The machine is pure: [`transition`] maps a state and an input to the next
//! state plus the effects the connector must carry out. Nothing here touches
//! the network.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::registration::SessionBinding;
use crate::transport::{AuthenticatedPayload, ClientEvent};

/// Lifecycle state of one activation
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Registering { socket_id: String },
    Authenticating { socket_id: String },
    Authenticated { socket_id: String, user: Value },
    Errored { reason: String },
}

impl SessionState {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Registering { .. } => "registering",
            SessionState::Authenticating { .. } => "authenticating",
            SessionState::Authenticated { .. } => "authenticated",
            SessionState::Errored { .. } => "errored",
        }
    }

    /// Socket id the state is bound to, if any
    pub fn socket_id(&self) -> Option<&str> {
        match self {
            SessionState::Registering { socket_id }
            | SessionState::Authenticating { socket_id }
            | SessionState::Authenticated { socket_id, .. } => Some(socket_id),
            _ => None,
        }
    }

    /// Whether a connection handle is currently published
    pub fn is_published(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

/// Callbacks that drive the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// The owning scope became active
    Activate,
    /// Transport `connect`
    Connected { socket_id: Option<String> },
    /// Transport `connect_error`
    ConnectError { reason: String },
    /// An established transport went away
    Dropped { reason: String },
    /// The registration call for `socket_id` completed
    RegistrationSettled {
        socket_id: String,
        outcome: Result<SessionBinding, String>,
    },
    /// Transport `authenticated` with its raw payload
    AuthenticatedReceived(Value),
    /// The owning scope went away
    Deactivate,
}

/// Why the sequence stopped short of publishing a connection
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Halt {
    #[error("Socket is not connected: transport assigned no socket id")]
    MissingSocketId,

    #[error("Registration of socket {socket_id} failed: {reason}")]
    RegistrationFailed { socket_id: String, reason: String },

    #[error("Malformed authenticated payload for socket {socket_id}: {reason}")]
    MalformedAuthentication { socket_id: String, reason: String },

    #[error("Transport connection error: {reason}")]
    TransportError { reason: String },
}

/// Work the connector performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the transport for this activation
    OpenTransport,
    /// Start the registration call for `socket_id`
    Register { socket_id: String },
    /// Send an event over the transport
    Emit(ClientEvent),
    /// Publish the authenticated connection
    Publish { socket_id: String, user: Value },
    /// Withdraw the published connection
    Unpublish,
    /// Close the transport
    CloseTransport,
    /// Log why the sequence halted
    Halt(Halt),
}

/// Compute the next state and the effects of applying `input` to `state`
pub fn transition(state: SessionState, input: Input) -> (SessionState, Vec<Effect>) {
    use SessionState::*;

    match (state, input) {
        (state, Input::Deactivate) => {
            let mut effects = Vec::with_capacity(2);
            if state.is_published() {
                effects.push(Effect::Unpublish);
            }
            effects.push(Effect::CloseTransport);
            (Disconnected, effects)
        }

        (Disconnected, Input::Activate) => (Connecting, vec![Effect::OpenTransport]),

        (Connecting | Errored { .. }, Input::Connected { socket_id }) => match socket_id {
            Some(socket_id) => (
                Registering {
                    socket_id: socket_id.clone(),
                },
                vec![Effect::Register { socket_id }],
            ),
            None => (Connecting, vec![Effect::Halt(Halt::MissingSocketId)]),
        },

        (Registering { socket_id }, Input::RegistrationSettled { socket_id: settled, outcome })
            if socket_id == settled =>
        {
            match outcome {
                Ok(_) => (
                    Authenticating { socket_id },
                    vec![Effect::Emit(ClientEvent::Authenticate)],
                ),
                Err(reason) => {
                    let halt = Halt::RegistrationFailed {
                        socket_id: socket_id.clone(),
                        reason,
                    };
                    (Registering { socket_id }, vec![Effect::Halt(halt)])
                }
            }
        }

        (Authenticating { socket_id }, Input::AuthenticatedReceived(payload)) => {
            let reason = match AuthenticatedPayload::parse(&payload) {
                Ok(auth) if auth.socket_id == socket_id => {
                    return (
                        Authenticated {
                            socket_id: socket_id.clone(),
                            user: auth.user.clone(),
                        },
                        vec![Effect::Publish {
                            socket_id,
                            user: auth.user,
                        }],
                    );
                }
                Ok(auth) => format!("payload authenticates socket {}", auth.socket_id),
                Err(e) => e.to_string(),
            };
            let halt = Halt::MalformedAuthentication {
                socket_id: socket_id.clone(),
                reason,
            };
            (Authenticating { socket_id }, vec![Effect::Halt(halt)])
        }

        (Disconnected, input) => {
            debug!("Ignoring {:?} while disconnected", input);
            (Disconnected, Vec::new())
        }

        (state, Input::ConnectError { reason }) => {
            let mut effects = Vec::with_capacity(3);
            if state.is_published() {
                effects.push(Effect::Unpublish);
            }
            effects.push(Effect::Halt(Halt::TransportError {
                reason: reason.clone(),
            }));
            effects.push(Effect::Emit(ClientEvent::hello()));
            (Errored { reason }, effects)
        }

        (
            state @ (Registering { .. } | Authenticating { .. } | Authenticated { .. }),
            Input::Dropped { reason },
        ) => {
            debug!("Transport dropped while {}: {}", state.name(), reason);
            let effects = if state.is_published() {
                vec![Effect::Unpublish]
            } else {
                Vec::new()
            };
            (Connecting, effects)
        }

        (state, input) => {
            debug!("Ignoring {:?} while {}", input, state.name());
            (state, Vec::new())
        }
    }
}

/// Owns the current state and applies inputs to it
#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Apply an input and return the effects to perform
    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        let state = std::mem::take(&mut self.state);
        let (next, effects) = transition(state, input);
        self.state = next;
        effects
    }
}
