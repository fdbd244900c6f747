//! Pure connection state management for the session bridge
//!
//! The dispatcher is the only caller. Every state change goes through
//! [`StateMachine::determine_next_state`], which keeps the transition table in one place.

use serde::Serialize;
use tracing::{debug, info, warn};

/// Connection state of the single broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session, or the session lost its connection
    #[default]
    Disconnected,
    /// Connect issued, waiting for the engine
    Connecting,
    /// Session established and ready for operations
    Connected,
    /// Disconnect issued, waiting for the engine
    Disconnecting,
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    DisconnectRequested,
    DisconnectSucceeded,
    DisconnectFailed,
    /// Engine reported an unsolicited loss
    ConnectionLost,
    /// Engine re-established a lost connection on its own
    Reconnected,
}

/// Pure transition and precondition logic
pub struct StateMachine;

impl StateMachine {
    /// Determine next state after a connection event (pure function)
    pub fn determine_next_state(
        current: ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;

        match (current, event) {
            (Disconnected, ConnectionEvent::ConnectRequested) => Connecting,
            (Connecting, ConnectionEvent::ConnectSucceeded) => Connected,
            (_, ConnectionEvent::ConnectFailed) => Disconnected,
            (Connected, ConnectionEvent::DisconnectRequested) => Disconnecting,
            (_, ConnectionEvent::DisconnectSucceeded) => Disconnected,
            (Disconnecting, ConnectionEvent::DisconnectFailed) => Connected,
            (_, ConnectionEvent::ConnectionLost) => Disconnected,
            (Disconnected, ConnectionEvent::Reconnected) => Connected,
            (state, _) => state,
        }
    }

    /// Connect is only allowed with no live or pending session
    pub fn can_connect(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Disconnected)
    }

    /// Disconnect, subscribe, unsubscribe and publish need an established session
    pub fn can_operate(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established successfully");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("MQTT connection lost");
            }
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (from, to) if from == to => {}
            (from, to) => {
                debug!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}
