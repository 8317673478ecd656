//! Connection lifecycle state machine.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Accepted,
    Rejected,
    Ready,
    TransportingData,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Accepted)
                | (Authenticating, Rejected)
                | (Accepted, Ready)
                | (Ready, TransportingData)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::TransportingData)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared, observable connection state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Refused transitions are logged and leave the state unchanged.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut accepted = true;
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                warn!(from = %state, to = %next, "Refusing invalid connection state transition");
                accepted = false;
                return false;
            }
            trace!(from = %state, to = %next, "Connection state transition");
            *state = next;
            true
        });
        accepted
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
