//! Message client facade
//!
//! [`MessageClient`] is what an application holds: typed send operations
//! over a [`ConnectionManager`], plus a single replaceable
//! [`MessageClientCallback`] fed from a [`ChannelListener`] registered with
//! the manager's listener registry.

use crate::bridge::manager::{ConnectOutcome, ConnectionManager};
use crate::bridge::registry::{ChannelListener, ListenerEvent, ListenerId};
use crate::bridge::state::ConnectionState;
use crate::config::ConnectionSettings;
use crate::error::MessagingError;
use crate::protocol::codec::FrameCodec;
use crate::protocol::messages::{
    Acknowledgement, Alert, Header, Location, Measurement, Metadata, Payload, RegistrationRequest,
};
use crate::protocol::wire::hex_dump;
use crate::transport::BrokerTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Application-side notifications. Every method defaults to a no-op.
#[async_trait]
pub trait MessageClientCallback: Send + Sync {
    async fn on_connected_to_sitewhere(&self) {}

    async fn on_disconnected_from_sitewhere(&self) {}

    async fn on_received_system_command(&self, _topic: &str, _payload: &[u8]) {}

    async fn on_received_custom_command(&self, _topic: &str, _payload: &[u8]) {}

    async fn on_received_event_message(&self, _topic: &str, _payload: &[u8]) {}
}

type CallbackSlot = Arc<RwLock<Option<Arc<dyn MessageClientCallback>>>>;

/// Encodes device frames and publishes them through the manager
pub struct MessageSender<T: BrokerTransport> {
    manager: Arc<ConnectionManager<T>>,
}

impl<T: BrokerTransport> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<T: BrokerTransport> MessageSender<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        Self { manager }
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub async fn send_device_registration(
        &self,
        device_token: &str,
        originator: Option<&str>,
        area_token: Option<&str>,
        customer_token: Option<&str>,
        device_type_token: Option<&str>,
        metadata: Metadata,
    ) -> Result<(), MessagingError> {
        let request = RegistrationRequest {
            device_type_token: device_type_token.map(str::to_string),
            customer_token: customer_token.map(str::to_string),
            area_token: area_token.map(str::to_string),
            metadata,
        };
        self.send_payload(device_token, originator, Payload::Registration(request))
            .await
    }

    pub async fn send_ack(
        &self,
        device_token: &str,
        originator: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), MessagingError> {
        let ack = Acknowledgement {
            message: message.map(str::to_string),
        };
        self.send_payload(device_token, originator, Payload::Acknowledgement(ack))
            .await
    }

    pub async fn send_device_measurement(
        &self,
        device_token: &str,
        originator: Option<&str>,
        name: &str,
        value: f64,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        let measurement = Measurement {
            name: name.to_string(),
            value,
            event_date,
            metadata: Metadata::new(),
        };
        self.send_payload(device_token, originator, Payload::Measurement(measurement))
            .await
    }

    /// Send one measurement frame per entry, all stamped with the same date.
    /// Stops at the first failure.
    pub async fn send_device_measurements(
        &self,
        device_token: &str,
        originator: Option<&str>,
        measurements: &BTreeMap<String, f64>,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        let event_date = event_date.unwrap_or_else(Utc::now);
        for (name, value) in measurements {
            self.send_device_measurement(device_token, originator, name, *value, Some(event_date))
                .await?;
        }
        Ok(())
    }

    pub async fn send_device_location(
        &self,
        device_token: &str,
        originator: Option<&str>,
        latitude: f64,
        longitude: f64,
        elevation: f64,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        let location = Location {
            latitude,
            longitude,
            elevation,
            event_date,
            metadata: Metadata::new(),
        };
        self.send_payload(device_token, originator, Payload::Location(location))
            .await
    }

    pub async fn send_device_alert(
        &self,
        device_token: &str,
        originator: Option<&str>,
        alert_type: &str,
        message: &str,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        let alert = Alert {
            alert_type: alert_type.to_string(),
            message: message.to_string(),
            event_date,
            metadata: Metadata::new(),
        };
        self.send_payload(device_token, originator, Payload::Alert(alert))
            .await
    }

    async fn send_payload(
        &self,
        device_token: &str,
        originator: Option<&str>,
        payload: Payload,
    ) -> Result<(), MessagingError> {
        let label = payload.kind();
        let header = Header::outbound(payload.command(), device_token).with_originator(originator);
        let frame =
            FrameCodec::encode(&header, &payload).map_err(|e| MessagingError::encoding(label, e))?;

        debug!(
            device_id = device_token,
            command = %header.command,
            bytes = frame.len(),
            frame = %hex_dump(&frame),
            "Sending {} frame",
            label
        );
        self.manager.send(frame).await
    }
}

/// Application entry point to the bridge
pub struct MessageClient<T: BrokerTransport> {
    manager: Arc<ConnectionManager<T>>,
    sender: MessageSender<T>,
    listener_id: ListenerId,
    callback: CallbackSlot,
    pump: Option<JoinHandle<()>>,
}

impl<T: BrokerTransport> MessageClient<T> {
    /// Attach to `manager`. Notifications are dropped until a callback is
    /// set.
    pub async fn new(manager: Arc<ConnectionManager<T>>) -> Self {
        Self::attach(manager, None).await
    }

    pub async fn with_callback(
        manager: Arc<ConnectionManager<T>>,
        callback: Arc<dyn MessageClientCallback>,
    ) -> Self {
        Self::attach(manager, Some(callback)).await
    }

    async fn attach(
        manager: Arc<ConnectionManager<T>>,
        callback: Option<Arc<dyn MessageClientCallback>>,
    ) -> Self {
        let (listener, events) = ChannelListener::channel();
        let callback: CallbackSlot = Arc::new(RwLock::new(callback));
        let pump = tokio::spawn(pump_events(events, callback.clone()));
        let listener_id = manager.register_listener(listener).await;

        Self {
            sender: MessageSender::new(manager.clone()),
            manager,
            listener_id,
            callback,
            pump: Some(pump),
        }
    }

    /// Replace the callback; the most recent one receives all later events
    pub async fn set_callback(&self, callback: Arc<dyn MessageClientCallback>) {
        *self.callback.write().await = Some(callback);
        debug!("Message client callback replaced");
    }

    pub async fn clear_callback(&self) {
        *self.callback.write().await = None;
    }

    pub fn sender(&self) -> MessageSender<T> {
        self.sender.clone()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.manager
    }

    pub fn connect(&self, settings: ConnectionSettings) -> ConnectOutcome {
        self.manager.connect(settings)
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Receive messages published on `topic` as event messages
    pub async fn register_for_events(&self, topic: &str) -> Result<(), MessagingError> {
        self.manager.subscribe(topic).await
    }

    /// Detach from the manager and stop delivering callbacks
    pub async fn close(mut self) {
        self.manager.unregister_listener(self.listener_id).await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        info!(listener_id = %self.listener_id, "Message client closed");
    }

    pub async fn send_device_registration(
        &self,
        device_token: &str,
        originator: Option<&str>,
        area_token: Option<&str>,
        customer_token: Option<&str>,
        device_type_token: Option<&str>,
        metadata: Metadata,
    ) -> Result<(), MessagingError> {
        self.sender
            .send_device_registration(
                device_token,
                originator,
                area_token,
                customer_token,
                device_type_token,
                metadata,
            )
            .await
    }

    pub async fn send_ack(
        &self,
        device_token: &str,
        originator: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), MessagingError> {
        self.sender.send_ack(device_token, originator, message).await
    }

    pub async fn send_device_measurement(
        &self,
        device_token: &str,
        originator: Option<&str>,
        name: &str,
        value: f64,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        self.sender
            .send_device_measurement(device_token, originator, name, value, event_date)
            .await
    }

    pub async fn send_device_measurements(
        &self,
        device_token: &str,
        originator: Option<&str>,
        measurements: &BTreeMap<String, f64>,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        self.sender
            .send_device_measurements(device_token, originator, measurements, event_date)
            .await
    }

    pub async fn send_device_location(
        &self,
        device_token: &str,
        originator: Option<&str>,
        latitude: f64,
        longitude: f64,
        elevation: f64,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        self.sender
            .send_device_location(
                device_token,
                originator,
                latitude,
                longitude,
                elevation,
                event_date,
            )
            .await
    }

    pub async fn send_device_alert(
        &self,
        device_token: &str,
        originator: Option<&str>,
        alert_type: &str,
        message: &str,
        event_date: Option<DateTime<Utc>>,
    ) -> Result<(), MessagingError> {
        self.sender
            .send_device_alert(device_token, originator, alert_type, message, event_date)
            .await
    }
}

impl<T: BrokerTransport> Drop for MessageClient<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_events(mut events: mpsc::UnboundedReceiver<ListenerEvent>, callback: CallbackSlot) {
    while let Some(event) = events.recv().await {
        let Some(target) = callback.read().await.clone() else {
            debug!(event = event.label(), "No callback set, dropping notification");
            continue;
        };

        match event {
            ListenerEvent::Connected => target.on_connected_to_sitewhere().await,
            ListenerEvent::Disconnected => target.on_disconnected_from_sitewhere().await,
            ListenerEvent::SystemCommand { topic, payload } => {
                target.on_received_system_command(&topic, &payload).await
            }
            ListenerEvent::CustomCommand { topic, payload } => {
                target.on_received_custom_command(&topic, &payload).await
            }
            ListenerEvent::EventMessage { topic, payload } => {
                target.on_received_event_message(&topic, &payload).await
            }
        }
    }
    warn!("Listener channel closed, callback pump stopping");
}
