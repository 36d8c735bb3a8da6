//! `rumqttc` implementation of the broker transport
//!
//! Every [`MqttTransport::open`] call builds a fresh client and event loop
//! and makes exactly one connection attempt. A driver task polls the event
//! loop, forwards publishes to the inbound channel and stops on the first
//! error. Reconnecting is the connection manager's decision, not the
//! transport's.

use super::connection::{configure_mqtt_options, MqttTransportOptions};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::ConnectionSettings;
use crate::transport::{BrokerConnection, BrokerTransport, Inbound, InboundMessage, TransportError};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Time allowed for the DISCONNECT packet to go out before the driver is
/// told to stop
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    options: MqttTransportOptions,
}

impl MqttTransport {
    pub fn new(options: MqttTransportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MqttTransportOptions {
        &self.options
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    type Connection = MqttConnection;

    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(MqttConnection, Inbound), TransportError> {
        let mqtt_options = configure_mqtt_options(settings, &self.options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, self.options.channel_capacity);

        let (inbound_tx, inbound_rx) = mpsc::channel(self.options.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let driver = EventLoopDriver {
            device_id: settings.device_id.clone(),
            event_loop,
            inbound_tx,
            ready_tx: Some(ready_tx),
            shutdown_rx,
            connected: connected.clone(),
        };
        let span = crate::mqtt_span!(device_id = %settings.device_id, host = %settings.hostname);
        let handle = tokio::spawn(driver.run().instrument(span));

        let connection = MqttConnection {
            client,
            qos: self.options.qos,
            connected,
            shutdown_tx,
            driver: Mutex::new(Some(handle)),
        };

        // Dropping `connection` on any failure below aborts the driver
        match tokio::time::timeout(self.options.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok((connection, inbound_rx)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::ConnectRejected(
                "event loop stopped before the connection was acknowledged".to_string(),
            )),
            Err(_) => Err(TransportError::ConnectTimeout(self.options.connect_timeout)),
        }
    }
}

struct EventLoopDriver {
    device_id: String,
    event_loop: EventLoop,
    inbound_tx: mpsc::Sender<InboundMessage>,
    ready_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
    shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
}

impl EventLoopDriver {
    async fn run(mut self) {
        debug!(device_id = %self.device_id, "Starting MQTT event loop");

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(event) => {
                        if !self.handle_route(MessageHandler::route_mqtt_event(&event)).await {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(device_id = %self.device_id, error = %e, "MQTT event loop error");
                        if let Some(ready_tx) = self.ready_tx.take() {
                            let _ = ready_tx.send(Err(TransportError::ConnectRejected(e.to_string())));
                        }
                        break;
                    }
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        info!(device_id = %self.device_id, "MQTT event loop stopped");
    }

    /// Returns false when the loop should stop
    async fn handle_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                self.connected.store(true, Ordering::SeqCst);
                info!(
                    device_id = %self.device_id,
                    session_present,
                    "MQTT connection acknowledged"
                );
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(Ok(()));
                }
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                trace!(topic = %topic, bytes = payload.len(), "Received MQTT message");
                if self
                    .inbound_tx
                    .send(InboundMessage { topic, payload })
                    .await
                    .is_err()
                {
                    debug!("Inbound receiver closed, dropping message");
                }
                true
            }
            EventRoute::Disconnected => {
                warn!(device_id = %self.device_id, "Broker closed the MQTT session");
                false
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(packet_id, filters, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }
}

/// One connection opened by [`MqttTransport`]
pub struct MqttConnection {
    client: AsyncClient,
    qos: QoS,
    connected: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| TransportError::SubscribeFailed(Box::new(e)))?;
        debug!(topic, "Subscription requested");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::UnsubscribeFailed(Box::new(e)))?;
        debug!(topic, "Unsubscribe requested");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = if self.connected.swap(false, Ordering::SeqCst) {
            self.client
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectFailed(Box::new(e)))
        } else {
            Ok(())
        };

        let Some(mut driver) = self.driver.lock().await.take() else {
            return result;
        };

        if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
            .await
            .is_err()
        {
            let _ = self.shutdown_tx.send(true);
            if tokio::time::timeout(DRIVER_STOP_TIMEOUT, &mut driver)
                .await
                .is_err()
            {
                warn!("MQTT event loop didn't stop gracefully, forcing abort");
                driver.abort();
            }
        }

        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_rejects_invalid_settings() {
        // Arrange
        let transport = MqttTransport::new(MqttTransportOptions::default());
        let settings = ConnectionSettings::new("", "dev-1");

        // Act
        let result = transport.open(&settings).await;

        // Assert
        assert!(matches!(result, Err(TransportError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn test_open_fails_when_broker_unreachable() {
        // Arrange: bind then release a port so nothing is listening on it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = MqttTransport::new(MqttTransportOptions {
            connect_timeout: Duration::from_secs(5),
            ..MqttTransportOptions::default()
        });
        let settings = ConnectionSettings::new("127.0.0.1", "dev-1").with_port(port);

        // Act
        let result = transport.open(&settings).await;

        // Assert
        assert!(matches!(
            result,
            Err(TransportError::ConnectRejected(_)) | Err(TransportError::ConnectTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_open_times_out_without_connack() {
        // Arrange: a listener that accepts but never answers CONNECT
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = MqttTransport::new(MqttTransportOptions {
            connect_timeout: Duration::from_millis(200),
            ..MqttTransportOptions::default()
        });
        let settings = ConnectionSettings::new("127.0.0.1", "dev-1").with_port(port);

        // Act
        let result = transport.open(&settings).await;

        // Assert
        assert!(matches!(result, Err(TransportError::ConnectTimeout(_))));
    }
}
