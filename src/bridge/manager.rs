//! Broker connection lifecycle
//!
//! [`ConnectionManager`] owns the single active broker connection. Connect,
//! disconnect, network suspension and connection-loss handling are all
//! queued to one control worker task, which performs them one at a time.
//! Each connection gets its own receive-loop task that classifies inbound
//! messages and hands them to the [`ListenerRegistry`].
//!
//! Connect attempts are never cancelled. Every accepted request advances an
//! epoch counter and an attempt that finishes after a newer request was made
//! discards its connection instead of installing it.

use super::network::{NetworkAction, NetworkAware, NetworkPolicy, NetworkStatus};
use super::registry::{BridgeListener, ListenerId, ListenerRegistry};
use super::state::{ConnectionEvent, ConnectionState, StateMachine};
use crate::config::ConnectionSettings;
use crate::error::MessagingError;
use crate::protocol::codec::FrameCodec;
use crate::protocol::messages::Direction;
use crate::protocol::topics::{InboundKind, TopicScheme, TopicSet};
use crate::protocol::wire::{validate_delimited_records, CodecError};
use crate::transport::{BrokerConnection, BrokerTransport, Inbound, InboundMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long a stopping receive loop gets before it is aborted
const RECEIVE_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A connection attempt was queued
    Started,
    /// Another attempt is already in flight; the request was dropped
    AlreadyConnecting,
    /// The network is down; the settings are kept for when it returns
    WaitingForNetwork,
    /// The settings match the live connection
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    Requested,
    NetworkLost,
}

enum ControlRequest {
    Connect {
        settings: ConnectionSettings,
        epoch: u64,
    },
    Disconnect {
        reason: DisconnectReason,
    },
    ConnectionLost {
        epoch: u64,
    },
    Shutdown,
}

struct ActiveConnection<C> {
    epoch: u64,
    connection: Arc<C>,
    topics: TopicSet,
    shutdown_tx: watch::Sender<bool>,
    receive_loop: JoinHandle<()>,
}

struct Shared<T: BrokerTransport> {
    transport: T,
    scheme: TopicScheme,
    registry: Arc<ListenerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    settings_tx: watch::Sender<Option<ConnectionSettings>>,
    network_available: AtomicBool,
    epoch: AtomicU64,
    active: RwLock<Option<ActiveConnection<T::Connection>>>,
    /// Application topics, re-subscribed on every connection
    event_topics: Mutex<Vec<String>>,
    /// Held while a connection is installed and announced, and while
    /// listeners or event topics are added against the current state
    lifecycle: Mutex<()>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
}

pub struct ConnectionManager<T: BrokerTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: BrokerTransport> ConnectionManager<T> {
    /// Create a manager and start its control worker. Must be called inside
    /// a Tokio runtime.
    pub fn new(transport: T, scheme: TopicScheme) -> Self {
        Self::with_registry(transport, scheme, Arc::new(ListenerRegistry::new()))
    }

    pub fn with_registry(
        transport: T,
        scheme: TopicScheme,
        registry: Arc<ListenerRegistry>,
    ) -> Self {
        let (shared, control_rx) = Shared::new(transport, scheme, registry);
        tokio::spawn(run_control_worker(shared.clone(), control_rx));
        Self { shared }
    }

    /// Request a connection with `settings`
    ///
    /// Returns immediately; the attempt itself runs on the control worker
    /// and its result is visible through [`state`](Self::state) and the
    /// listener callbacks.
    pub fn connect(&self, settings: ConnectionSettings) -> ConnectOutcome {
        self.shared.request_connect(settings)
    }

    /// Store new settings, reconnecting only when the endpoint changed or
    /// there is no live connection
    pub fn apply_settings(&self, settings: ConnectionSettings) -> ConnectOutcome {
        let unchanged = self
            .shared
            .settings_tx
            .borrow()
            .as_ref()
            .is_some_and(|current| current.same_endpoint(&settings));

        if unchanged && self.state() == ConnectionState::Connected {
            debug!(device_id = %settings.device_id, "Settings unchanged, keeping connection");
            self.shared.settings_tx.send_replace(Some(settings));
            return ConnectOutcome::Unchanged;
        }

        self.connect(settings)
    }

    /// Tear down the active connection. Safe to call in any state.
    pub fn disconnect(&self) {
        self.shared.advance_epoch();
        self.shared.enqueue(ControlRequest::Disconnect {
            reason: DisconnectReason::Requested,
        });
    }

    /// Publish an encoded frame to the outbound topic
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), MessagingError> {
        let (connection, topics) = self.active_connection().await?;
        let bytes = payload.len();
        connection.publish(&topics.outbound, payload).await?;
        debug!(topic = %topics.outbound, bytes, "Published frame");
        Ok(())
    }

    /// Subscribe to an application topic; its messages are delivered as
    /// event messages. The subscription is renewed on every reconnect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), MessagingError> {
        let (connection, _) = self.active_connection().await?;
        connection.subscribe(topic).await?;

        let mut topics = self.shared.event_topics.lock().await;
        if !topics.iter().any(|existing| existing == topic) {
            topics.push(topic.to_string());
        }
        info!(topic, "Subscribed to event topic");
        Ok(())
    }

    /// Record an application topic for every future connection. Unlike
    /// [`subscribe`](Self::subscribe) this works in any state; the topic is
    /// subscribed right away only when a connection is up.
    pub async fn add_event_topic(&self, topic: &str) -> Result<(), MessagingError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        {
            let mut topics = self.shared.event_topics.lock().await;
            if topics.iter().any(|existing| existing == topic) {
                return Ok(());
            }
            topics.push(topic.to_string());
        }

        match self.active_connection().await {
            Ok((connection, _)) => {
                connection.subscribe(topic).await?;
                info!(topic, "Subscribed to event topic");
            }
            Err(_) => debug!(topic, "Event topic stored for the next connection"),
        }
        Ok(())
    }

    /// Register a listener, delivering `connected()` straight away when a
    /// connection is already up
    pub async fn register_listener(&self, listener: Arc<dyn BridgeListener>) -> ListenerId {
        // A connection being announced either includes this listener in its
        // broadcast or is already visible as Connected, never both
        let _lifecycle = self.shared.lifecycle.lock().await;
        let id = self.shared.registry.register(listener.clone()).await;
        if self.state() == ConnectionState::Connected {
            if let Err(e) = listener.connected() {
                warn!(listener_id = %id, error = %e, "Removing unreachable listener");
                self.shared.registry.unregister(id).await;
            }
        }
        id
    }

    pub async fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.registry.unregister(id).await
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the state equals `target`; false on timeout
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut state_rx = self.shared.state_tx.subscribe();
        let reached = tokio::time::timeout(timeout, state_rx.wait_for(|state| *state == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub fn settings(&self) -> Option<ConnectionSettings> {
        self.shared.settings_tx.borrow().clone()
    }

    /// Topics of the live connection
    pub async fn topics(&self) -> Option<TopicSet> {
        self.shared
            .active
            .read()
            .await
            .as_ref()
            .map(|active| active.topics.clone())
    }

    pub fn topic_scheme(&self) -> &TopicScheme {
        &self.shared.scheme
    }

    pub fn is_network_available(&self) -> bool {
        self.shared.network_available.load(Ordering::SeqCst)
    }

    async fn active_connection(&self) -> Result<(Arc<T::Connection>, TopicSet), MessagingError> {
        let active = self.shared.active.read().await;
        match active.as_ref() {
            Some(active) if StateMachine::can_publish(self.state()) => {
                Ok((active.connection.clone(), active.topics.clone()))
            }
            _ => Err(MessagingError::not_connected(self.state())),
        }
    }
}

impl<T: BrokerTransport> NetworkAware for ConnectionManager<T> {
    fn network_changed(&self, status: NetworkStatus) -> NetworkAction {
        let was_available = self
            .shared
            .network_available
            .swap(status.is_available(), Ordering::SeqCst);
        let configured = self.shared.settings_tx.borrow().is_some();
        let action = NetworkPolicy::decide(self.state(), status, configured);

        match action {
            NetworkAction::Suspend => {
                info!("Network lost, suspending broker connection");
                self.shared.advance_epoch();
                self.shared.enqueue(ControlRequest::Disconnect {
                    reason: DisconnectReason::NetworkLost,
                });
            }
            NetworkAction::Reconnect => {
                if let Some(settings) = self.settings() {
                    info!("Network available, reconnecting");
                    self.shared.request_connect(settings);
                }
            }
            NetworkAction::Ignore => {
                if was_available != status.is_available() {
                    debug!(status = ?status, state = %self.state(), "Network change needs no action");
                }
            }
        }
        action
    }
}

impl<T: BrokerTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.shared.enqueue(ControlRequest::Shutdown);
    }
}

impl<T: BrokerTransport> Shared<T> {
    fn new(
        transport: T,
        scheme: TopicScheme,
        registry: Arc<ListenerRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlRequest>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transport,
            scheme,
            registry,
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            settings_tx: watch::Sender::new(None),
            network_available: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            active: RwLock::new(None),
            event_topics: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            control_tx,
        });
        (shared, control_rx)
    }

    fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn enqueue(&self, request: ControlRequest) {
        if self.control_tx.send(request).is_err() {
            error!("Connection worker is not running");
        }
    }

    /// Apply `event` to the current state; returns the resulting state
    fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        let mut next = ConnectionState::Disconnected;
        self.state_tx.send_if_modified(|state| {
            next = StateMachine::next_state(*state, &event);
            if *state == next {
                return false;
            }
            StateMachine::log_state_transition(*state, next, &event);
            *state = next;
            true
        });
        next
    }

    fn request_connect(&self, settings: ConnectionSettings) -> ConnectOutcome {
        let network_available = self.network_available.load(Ordering::SeqCst);
        let event = ConnectionEvent::ConnectRequested { network_available };

        // Compare-and-set: only one caller moves the state out of anything
        // but Connecting
        let mut accepted = false;
        self.state_tx.send_if_modified(|state| {
            if !StateMachine::accepts_connect(*state) {
                return false;
            }
            accepted = true;
            let next = StateMachine::next_state(*state, &event);
            if *state == next {
                return false;
            }
            StateMachine::log_state_transition(*state, next, &event);
            *state = next;
            true
        });

        if !accepted {
            debug!(device_id = %settings.device_id, "Connect already in progress, ignoring request");
            return ConnectOutcome::AlreadyConnecting;
        }

        self.settings_tx.send_replace(Some(settings.clone()));
        let epoch = self.advance_epoch();

        if !network_available {
            self.enqueue(ControlRequest::Disconnect {
                reason: DisconnectReason::NetworkLost,
            });
            return ConnectOutcome::WaitingForNetwork;
        }

        self.enqueue(ControlRequest::Connect { settings, epoch });
        ConnectOutcome::Started
    }

    async fn run_connect(&self, settings: ConnectionSettings, epoch: u64) {
        if self.is_superseded(epoch) {
            debug!(epoch, "Skipping superseded connect request");
            return;
        }

        if self.teardown_active().await {
            self.registry.notify_disconnected().await;
        }

        let topics = self.scheme.topics_for(&settings);
        info!(
            host = %settings.hostname,
            port = settings.port,
            device_id = %settings.device_id,
            "Connecting to broker"
        );

        let (connection, inbound) = match self.transport.open(&settings).await {
            Ok(opened) => opened,
            Err(e) => {
                if !self.is_superseded(epoch) {
                    self.transition(ConnectionEvent::ConnectFailed(e.to_string()));
                }
                return;
            }
        };

        if self.is_superseded(epoch) {
            info!(epoch, "Connect attempt superseded, discarding new connection");
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing superseded connection");
            }
            return;
        }

        let _lifecycle = self.lifecycle.lock().await;
        if let Err(e) = self.subscribe_topics(&connection, &topics).await {
            error!(error = %e, "Unable to subscribe to device topics");
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing connection after failed subscribe");
            }
            self.transition(ConnectionEvent::ConnectFailed(e.to_string()));
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receive_loop = ReceiveLoop {
            epoch,
            inbound,
            shutdown_rx,
            scheme: self.scheme.clone(),
            registry: self.registry.clone(),
            control_tx: self.control_tx.clone(),
        };

        *self.active.write().await = Some(ActiveConnection {
            epoch,
            connection: Arc::new(connection),
            topics,
            shutdown_tx,
            receive_loop: tokio::spawn(receive_loop.run()),
        });

        self.transition(ConnectionEvent::ConnectSucceeded);
        let notified = self.registry.notify_connected().await;
        debug!(listeners = notified, "Notified listeners of connection");
    }

    async fn subscribe_topics(
        &self,
        connection: &T::Connection,
        topics: &TopicSet,
    ) -> Result<(), crate::transport::TransportError> {
        for topic in topics.inbound() {
            connection.subscribe(topic).await?;
            info!(topic, "Subscribed to device topic");
        }

        let event_topics = self.event_topics.lock().await.clone();
        for topic in &event_topics {
            if let Err(e) = connection.subscribe(topic).await {
                warn!(topic = %topic, error = %e, "Unable to renew event subscription");
            }
        }
        Ok(())
    }

    /// Stop and close the active connection, if any
    async fn teardown_active(&self) -> bool {
        let Some(active) = self.active.write().await.take() else {
            return false;
        };
        let ActiveConnection {
            connection,
            topics,
            shutdown_tx,
            receive_loop,
            ..
        } = active;

        if connection.is_connected() {
            let event_topics = self.event_topics.lock().await.clone();
            let all_topics = topics
                .inbound()
                .into_iter()
                .map(str::to_string)
                .chain(event_topics);
            for topic in all_topics {
                if let Err(e) = connection.unsubscribe(&topic).await {
                    warn!(topic = %topic, error = %e, "Unable to unsubscribe");
                }
            }
        }

        let _ = shutdown_tx.send(true);
        stop_receive_loop(receive_loop).await;

        if let Err(e) = connection.close().await {
            warn!(error = %e, "Error closing broker connection");
        }
        true
    }

    async fn run_disconnect(&self, reason: DisconnectReason) {
        let had_connection = self.teardown_active().await;

        match reason {
            DisconnectReason::Requested => {
                self.transition(ConnectionEvent::DisconnectRequested);
            }
            DisconnectReason::NetworkLost => {
                self.transition(ConnectionEvent::NetworkLost);
            }
        }

        if had_connection {
            self.registry.notify_disconnected().await;
        }

        // The network may have come back while the teardown was queued
        if reason == DisconnectReason::NetworkLost
            && self.network_available.load(Ordering::SeqCst)
            && *self.state_tx.borrow() == ConnectionState::WaitingForNetwork
        {
            let settings = self.settings_tx.borrow().clone();
            if let Some(settings) = settings {
                self.request_connect(settings);
            }
        }
    }

    async fn handle_connection_lost(&self, epoch: u64) {
        // A newer request is queued behind this one and tears the dead
        // connection down itself
        if self.is_superseded(epoch) {
            debug!(epoch, "Ignoring loss of a superseded connection");
            return;
        }

        let current = self
            .active
            .read()
            .await
            .as_ref()
            .is_some_and(|active| active.epoch == epoch);
        if !current {
            debug!(epoch, "Ignoring loss of a connection that is no longer active");
            return;
        }

        self.teardown_active().await;
        self.transition(ConnectionEvent::ConnectionLost(
            "inbound stream closed".to_string(),
        ));
        self.registry.notify_disconnected().await;
    }
}

async fn run_control_worker<T: BrokerTransport>(
    shared: Arc<Shared<T>>,
    mut control_rx: mpsc::UnboundedReceiver<ControlRequest>,
) {
    debug!("Connection worker started");
    while let Some(request) = control_rx.recv().await {
        match request {
            ControlRequest::Connect { settings, epoch } => {
                let span = crate::connection_span!(device_id = %settings.device_id, epoch);
                shared.run_connect(settings, epoch).instrument(span).await
            }
            ControlRequest::Disconnect { reason } => shared.run_disconnect(reason).await,
            ControlRequest::ConnectionLost { epoch } => shared.handle_connection_lost(epoch).await,
            ControlRequest::Shutdown => {
                shared.run_disconnect(DisconnectReason::Requested).await;
                break;
            }
        }
    }
    debug!("Connection worker stopped");
}

async fn stop_receive_loop(mut handle: JoinHandle<()>) {
    match tokio::time::timeout(RECEIVE_LOOP_STOP_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => debug!("Receive loop stopped"),
        Ok(Err(e)) if !e.is_cancelled() => warn!("Receive loop ended with error: {}", e),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("Receive loop didn't stop gracefully, forcing abort");
            handle.abort();
        }
    }
}

/// Check an inbound payload before it is handed to listeners
pub fn validate_inbound(kind: InboundKind, payload: &[u8]) -> Result<(), CodecError> {
    match kind {
        InboundKind::SystemCommand => {
            FrameCodec::decode_frame(payload, Direction::Inbound).map(|_| ())
        }
        InboundKind::CustomCommand => validate_delimited_records(payload),
        InboundKind::EventMessage => Ok(()),
    }
}

struct ReceiveLoop {
    epoch: u64,
    inbound: Inbound,
    shutdown_rx: watch::Receiver<bool>,
    scheme: TopicScheme,
    registry: Arc<ListenerRegistry>,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        debug!(epoch = self.epoch, "Started inbound message processing");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!(epoch = self.epoch, "Receive loop interrupted");
                        break;
                    }
                }

                message = self.inbound.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => {
                        warn!(epoch = self.epoch, "Ending message processing due to failed connection");
                        let _ = self.control_tx.send(ControlRequest::ConnectionLost { epoch: self.epoch });
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, message: InboundMessage) {
        let kind = self.scheme.classify(&message.topic);
        if let Err(e) = validate_inbound(kind, &message.payload) {
            warn!(
                topic = %message.topic,
                bytes = message.payload.len(),
                error = %e,
                "Dropping malformed inbound message"
            );
            return;
        }

        let delivered = self
            .registry
            .dispatch(kind, &message.topic, &message.payload)
            .await;
        debug!(
            topic = %message.topic,
            kind = ?kind,
            bytes = message.payload.len(),
            delivered,
            "Dispatched inbound message"
        );
    }
}
