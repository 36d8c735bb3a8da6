//! In-memory broker and listener doubles
//!
//! [`MockTransport`] hands out [`MockConnection`]s that record every
//! subscribe, unsubscribe and publish. Tests inject inbound messages and
//! simulate connection loss through the transport handle.

use crate::bridge::registry::{BridgeListener, ListenerEvent};
use crate::config::ConnectionSettings;
use crate::error::ListenerUnreachable;
use crate::transport::{BrokerConnection, BrokerTransport, Inbound, InboundMessage, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Semaphore};

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ConnectionLog {
    subscriptions: Vec<String>,
    unsubscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    closed: bool,
}

/// One simulated broker connection
#[derive(Debug, Clone)]
pub struct MockConnection {
    settings: ConnectionSettings,
    log: Arc<Mutex<ConnectionLog>>,
    connected: Arc<AtomicBool>,
    inbound_tx: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    fail_publishes: Arc<AtomicBool>,
}

impl MockConnection {
    fn new(
        settings: ConnectionSettings,
        inbound_tx: mpsc::Sender<InboundMessage>,
        fail_publishes: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            log: Arc::new(Mutex::new(ConnectionLog::default())),
            connected: Arc::new(AtomicBool::new(true)),
            inbound_tx: Arc::new(Mutex::new(Some(inbound_tx))),
            fail_publishes,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.log).subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.log).unsubscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.log).published.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.log).closed
    }

    /// Deliver a message as if the broker had sent it
    pub async fn inject<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P) -> bool {
        let inbound_tx = lock(&self.inbound_tx).clone();
        match inbound_tx {
            Some(tx) => tx.send(InboundMessage::new(topic, payload)).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the connection
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.inbound_tx).take();
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::SubscribeFailed("connection closed".into()));
        }
        lock(&self.log).subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::UnsubscribeFailed("connection closed".into()));
        }
        lock(&self.log).unsubscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::PublishFailed("connection closed".into()));
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("publish rejected".into()));
        }
        lock(&self.log).published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sever();
        lock(&self.log).closed = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct MockTransportState {
    opens: AtomicUsize,
    fail_connections: AtomicBool,
    fail_publishes: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
    connections: Mutex<Vec<MockConnection>>,
}

/// Transport double; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockTransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` blocks until [`release_open`](Self::release_open) is
    /// called once for it
    pub fn gated() -> Self {
        Self {
            state: Arc::new(MockTransportState {
                gate: Some(Arc::new(Semaphore::new(0))),
                ..MockTransportState::default()
            }),
        }
    }

    pub fn release_open(&self) {
        if let Some(gate) = &self.state.gate {
            gate.add_permits(1);
        }
    }

    pub fn set_fail_connections(&self, fail: bool) {
        self.state.fail_connections.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Number of connection attempts made so far
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Connections handed out so far, oldest first
    pub fn connections(&self) -> Vec<MockConnection> {
        lock(&self.state.connections).clone()
    }

    pub fn latest_connection(&self) -> Option<MockConnection> {
        lock(&self.state.connections).last().cloned()
    }

    /// Inject into the most recent connection
    pub async fn inject<T: Into<String>, P: Into<Bytes>>(&self, topic: T, payload: P) -> bool {
        match self.latest_connection() {
            Some(connection) => connection.inject(topic, payload).await,
            None => false,
        }
    }

    /// Sever the most recent connection
    pub fn drop_connection(&self) {
        if let Some(connection) = self.latest_connection() {
            connection.sever();
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    type Connection = MockConnection;

    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(Self::Connection, Inbound), TransportError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.state.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::ConnectFailed(Box::new(e)))?;
            permit.forget();
        }

        if self.state.fail_connections.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectRejected(
                "connection refused".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let connection =
            MockConnection::new(settings.clone(), inbound_tx, self.state.fail_publishes.clone());
        lock(&self.state.connections).push(connection.clone());
        Ok((connection, inbound_rx))
    }
}

/// Listener that records every notification; can be switched to fail
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
    fail: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let listener = Self::new();
        listener.set_failing(true);
        listener
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        lock(&self.events).clone()
    }

    fn record(&self, event: ListenerEvent) -> Result<(), ListenerUnreachable> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ListenerUnreachable::new("recording listener is failing"));
        }
        lock(&self.events).push(event);
        Ok(())
    }
}

impl BridgeListener for RecordingListener {
    fn connected(&self) -> Result<(), ListenerUnreachable> {
        self.record(ListenerEvent::Connected)
    }

    fn disconnected(&self) -> Result<(), ListenerUnreachable> {
        self.record(ListenerEvent::Disconnected)
    }

    fn received_system_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.record(ListenerEvent::SystemCommand {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn received_custom_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.record(ListenerEvent::CustomCommand {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn received_event_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.record(ListenerEvent::EventMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }
}
