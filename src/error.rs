//! Error types surfaced to bridge callers
//!
//! Codec, transport and configuration errors live next to the code that
//! raises them; this module holds the errors crossing the public messaging
//! API.

use crate::bridge::state::ConnectionState;
use crate::protocol::wire::CodecError;
use crate::transport::TransportError;
use thiserror::Error;

/// Failure of a send or subscribe request
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Problem encoding {label} message")]
    Encoding {
        label: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl MessagingError {
    pub fn encoding(label: &'static str, source: CodecError) -> Self {
        Self::Encoding { label, source }
    }

    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }
}

/// Returned by a listener endpoint that can no longer receive callbacks.
/// The registry drops such listeners.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Listener unreachable: {reason}")]
pub struct ListenerUnreachable {
    reason: String,
}

impl ListenerUnreachable {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_encoding_error_keeps_source() {
        let error = MessagingError::encoding("measurement", CodecError::MissingField("deviceToken"));

        assert_eq!(error.to_string(), "Problem encoding measurement message");
        assert_eq!(
            error.source().map(|source| source.to_string()),
            Some("Missing required field: deviceToken".to_string())
        );
    }

    #[test]
    fn test_not_connected_names_state() {
        let error = MessagingError::not_connected(ConnectionState::WaitingForNetwork);
        assert_eq!(
            error.to_string(),
            "Not connected - current state: waiting for network"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: MessagingError =
            TransportError::PublishFailed(Box::new(std::io::Error::other("broken pipe"))).into();
        assert!(matches!(error, MessagingError::Transport(_)));
    }

    #[test]
    fn test_listener_unreachable_reason() {
        let error = ListenerUnreachable::new("receiver dropped");
        assert_eq!(error.reason(), "receiver dropped");
        assert_eq!(error.to_string(), "Listener unreachable: receiver dropped");
    }
}
