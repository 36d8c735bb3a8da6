//! Broker transport abstraction
//!
//! The connection manager only talks to the broker through these traits, so
//! the lifecycle logic can run against the in-memory transport in
//! [`crate::testing::mocks`] as well as the MQTT implementation.

use crate::config::ConnectionSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod probe;

pub use mqtt::MqttTransport;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of received messages. The sender side is dropped when the
/// underlying connection is gone.
pub type Inbound = mpsc::Receiver<InboundMessage>;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectRejected(String),
    #[error("No connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unsubscribe failed")]
    UnsubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid transport options: {0}")]
    InvalidOptions(String),
    #[error("Broker {host}:{port} unreachable")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Opens broker connections
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Make a single connection attempt
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(Self::Connection, Inbound), TransportError>;
}

/// One open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
