//! Connection state machine
//!
//! Pure transition logic. The connection manager owns the current state in
//! a `watch` channel and runs every change through [`StateMachine`], so the
//! rules live in one place and are testable without a broker.

use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Settings are known but the network is down
    WaitingForNetwork,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::WaitingForNetwork => "waiting for network",
        };
        f.write_str(label)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested { network_available: bool },
    ConnectSucceeded,
    ConnectFailed(String),
    DisconnectRequested,
    ConnectionLost(String),
    NetworkLost,
}

pub struct StateMachine;

impl StateMachine {
    pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectRequested { network_available } => {
                if current == ConnectionState::Connecting || *network_available {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::WaitingForNetwork
                }
            }
            ConnectionEvent::ConnectSucceeded => ConnectionState::Connected,
            ConnectionEvent::ConnectFailed(_)
            | ConnectionEvent::DisconnectRequested
            | ConnectionEvent::ConnectionLost(_) => ConnectionState::Disconnected,
            ConnectionEvent::NetworkLost => match current {
                ConnectionState::Connected => ConnectionState::WaitingForNetwork,
                other => other,
            },
        }
    }

    /// A connect request is a no-op while another attempt is in flight
    pub fn accepts_connect(state: ConnectionState) -> bool {
        state != ConnectionState::Connecting
    }

    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
        match (from, to, event) {
            (ConnectionState::Connecting, ConnectionState::Connected, _) => {
                info!("Broker connection established");
            }
            (_, ConnectionState::Disconnected, ConnectionEvent::ConnectFailed(reason)) => {
                warn!(reason = %reason, "Unable to connect to broker");
            }
            (ConnectionState::Connected, _, ConnectionEvent::ConnectionLost(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (_, ConnectionState::WaitingForNetwork, _) => {
                info!("Waiting for network before connecting");
            }
            _ => {
                info!(from = %from, to = %to, "Connection state changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_depends_on_network() {
        assert_eq!(
            StateMachine::next_state(
                ConnectionState::Disconnected,
                &ConnectionEvent::ConnectRequested {
                    network_available: true
                }
            ),
            ConnectionState::Connecting
        );
        assert_eq!(
            StateMachine::next_state(
                ConnectionState::Connected,
                &ConnectionEvent::ConnectRequested {
                    network_available: false
                }
            ),
            ConnectionState::WaitingForNetwork
        );
    }

    #[test]
    fn test_connect_outcomes() {
        assert_eq!(
            StateMachine::next_state(ConnectionState::Connecting, &ConnectionEvent::ConnectSucceeded),
            ConnectionState::Connected
        );
        assert_eq!(
            StateMachine::next_state(
                ConnectionState::Connecting,
                &ConnectionEvent::ConnectFailed("refused".to_string())
            ),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_network_loss_only_affects_connected() {
        assert_eq!(
            StateMachine::next_state(ConnectionState::Connected, &ConnectionEvent::NetworkLost),
            ConnectionState::WaitingForNetwork
        );
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::WaitingForNetwork,
        ] {
            assert_eq!(
                StateMachine::next_state(state, &ConnectionEvent::NetworkLost),
                state
            );
        }
    }

    #[test]
    fn test_disconnect_and_loss_end_disconnected() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::WaitingForNetwork,
        ] {
            assert_eq!(
                StateMachine::next_state(state, &ConnectionEvent::DisconnectRequested),
                ConnectionState::Disconnected
            );
        }
        assert_eq!(
            StateMachine::next_state(
                ConnectionState::Connected,
                &ConnectionEvent::ConnectionLost("eof".to_string())
            ),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_connect_not_accepted_while_connecting() {
        assert!(!StateMachine::accepts_connect(ConnectionState::Connecting));
        assert!(StateMachine::accepts_connect(ConnectionState::Connected));
        assert!(StateMachine::accepts_connect(ConnectionState::WaitingForNetwork));
    }

    #[test]
    fn test_only_connected_can_publish() {
        assert!(StateMachine::can_publish(ConnectionState::Connected));
        assert!(!StateMachine::can_publish(ConnectionState::Connecting));
        assert!(!StateMachine::can_subscribe(ConnectionState::Disconnected));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::WaitingForNetwork.to_string(),
            "waiting for network"
        );
    }
}
