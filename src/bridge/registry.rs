//! Listener registry and fan-out
//!
//! Listeners are delivered to in registration order over a snapshot of the
//! set, so a listener registering or failing during a broadcast never
//! disturbs the delivery in progress. Listeners whose delivery fails are
//! removed once the broadcast is over.

use crate::error::ListenerUnreachable;
use crate::protocol::topics::InboundKind;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receiving end of bridge notifications
///
/// Callbacks must not block; an `Err` marks the listener as gone and it is
/// dropped from the registry.
pub trait BridgeListener: Send + Sync {
    fn connected(&self) -> Result<(), ListenerUnreachable>;

    fn disconnected(&self) -> Result<(), ListenerUnreachable>;

    fn received_system_command(&self, topic: &str, payload: &[u8])
        -> Result<(), ListenerUnreachable>;

    fn received_custom_command(&self, topic: &str, payload: &[u8])
        -> Result<(), ListenerUnreachable>;

    fn received_event_message(&self, topic: &str, payload: &[u8])
        -> Result<(), ListenerUnreachable>;
}

/// Notification as carried by a [`ChannelListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Connected,
    Disconnected,
    SystemCommand { topic: String, payload: Vec<u8> },
    CustomCommand { topic: String, payload: Vec<u8> },
    EventMessage { topic: String, payload: Vec<u8> },
}

impl ListenerEvent {
    pub fn label(&self) -> &'static str {
        match self {
            ListenerEvent::Connected => "connected",
            ListenerEvent::Disconnected => "disconnected",
            ListenerEvent::SystemCommand { .. } => "system command",
            ListenerEvent::CustomCommand { .. } => "custom command",
            ListenerEvent::EventMessage { .. } => "event message",
        }
    }
}

/// Listener that forwards every notification into an mpsc channel
///
/// Stands in for an endpoint in another process: once the receiving side is
/// dropped every delivery fails and the registry forgets the listener.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn deliver(&self, event: ListenerEvent) -> Result<(), ListenerUnreachable> {
        self.tx
            .send(event)
            .map_err(|_| ListenerUnreachable::new("listener channel closed"))
    }
}

impl BridgeListener for ChannelListener {
    fn connected(&self) -> Result<(), ListenerUnreachable> {
        self.deliver(ListenerEvent::Connected)
    }

    fn disconnected(&self) -> Result<(), ListenerUnreachable> {
        self.deliver(ListenerEvent::Disconnected)
    }

    fn received_system_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.deliver(ListenerEvent::SystemCommand {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn received_custom_command(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.deliver(ListenerEvent::CustomCommand {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn received_event_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), ListenerUnreachable> {
        self.deliver(ListenerEvent::EventMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        })
    }
}

struct Registration {
    id: ListenerId,
    endpoint: Arc<dyn BridgeListener>,
}

fn same_endpoint(a: &Arc<dyn BridgeListener>, b: &Arc<dyn BridgeListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Registering the same endpoint again returns the id it
    /// already has.
    pub async fn register(&self, listener: Arc<dyn BridgeListener>) -> ListenerId {
        let mut listeners = self.listeners.write().await;
        if let Some(existing) = listeners
            .iter()
            .find(|registration| same_endpoint(&registration.endpoint, &listener))
        {
            debug!(listener_id = %existing.id, "Listener already registered");
            return existing.id;
        }

        let id = ListenerId::new();
        listeners.push(Registration {
            id,
            endpoint: listener,
        });
        info!(listener_id = %id, listeners = listeners.len(), "Registered listener");
        id
    }

    pub async fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        let removed = listeners.len() != before;
        if removed {
            info!(listener_id = %id, listeners = listeners.len(), "Unregistered listener");
        }
        removed
    }

    pub async fn contains(&self, id: ListenerId) -> bool {
        self.listeners
            .read()
            .await
            .iter()
            .any(|registration| registration.id == id)
    }

    pub async fn len(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.read().await.is_empty()
    }

    pub async fn notify_connected(&self) -> usize {
        self.broadcast("connected", |listener| listener.connected())
            .await
    }

    pub async fn notify_disconnected(&self) -> usize {
        self.broadcast("disconnected", |listener| listener.disconnected())
            .await
    }

    pub async fn dispatch_system_command(&self, topic: &str, payload: &[u8]) -> usize {
        self.broadcast("system command", |listener| {
            listener.received_system_command(topic, payload)
        })
        .await
    }

    pub async fn dispatch_custom_command(&self, topic: &str, payload: &[u8]) -> usize {
        self.broadcast("custom command", |listener| {
            listener.received_custom_command(topic, payload)
        })
        .await
    }

    pub async fn dispatch_event_message(&self, topic: &str, payload: &[u8]) -> usize {
        self.broadcast("event message", |listener| {
            listener.received_event_message(topic, payload)
        })
        .await
    }

    /// Route by inbound kind
    pub async fn dispatch(&self, kind: InboundKind, topic: &str, payload: &[u8]) -> usize {
        match kind {
            InboundKind::SystemCommand => self.dispatch_system_command(topic, payload).await,
            InboundKind::CustomCommand => self.dispatch_custom_command(topic, payload).await,
            InboundKind::EventMessage => self.dispatch_event_message(topic, payload).await,
        }
    }

    /// Deliver to every listener, returning how many deliveries succeeded
    async fn broadcast<F>(&self, label: &'static str, deliver: F) -> usize
    where
        F: Fn(&dyn BridgeListener) -> Result<(), ListenerUnreachable>,
    {
        let snapshot: Vec<(ListenerId, Arc<dyn BridgeListener>)> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|registration| (registration.id, registration.endpoint.clone()))
            .collect();

        let mut delivered = 0;
        let mut unreachable = Vec::new();
        for (id, endpoint) in &snapshot {
            match deliver(endpoint.as_ref()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(listener_id = %id, callback = label, error = %e, "Removing unreachable listener");
                    unreachable.push(*id);
                }
            }
        }

        if !unreachable.is_empty() {
            self.listeners
                .write()
                .await
                .retain(|registration| !unreachable.contains(&registration.id));
        }

        debug!(callback = label, delivered, failed = unreachable.len(), "Broadcast complete");
        delivered
    }
}
