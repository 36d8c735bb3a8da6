//! Behaviour of the real MQTT transport when no broker is listening
//!
//! A failed attempt leaves the manager Disconnected with its settings kept,
//! so a later connect (or a network regain) can retry.

use sitewhere_bridge::bridge::{ConnectionManager, ConnectionState};
use sitewhere_bridge::config::ConnectionSettings;
use sitewhere_bridge::error::MessagingError;
use sitewhere_bridge::protocol::TopicScheme;
use sitewhere_bridge::transport::mqtt::{MqttTransport, MqttTransportOptions};
use sitewhere_bridge::transport::probe::check_broker_reachable;
use std::time::Duration;

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fast_options() -> MqttTransportOptions {
    MqttTransportOptions {
        connect_timeout: Duration::from_secs(1),
        ..MqttTransportOptions::default()
    }
}

#[tokio::test]
async fn test_connect_to_missing_broker_ends_disconnected() {
    // Arrange
    let port = closed_port();
    let manager = ConnectionManager::new(MqttTransport::new(fast_options()), TopicScheme::default());

    // Act
    manager.connect(ConnectionSettings::new("127.0.0.1", "d1").with_port(port));

    // Assert
    assert!(
        manager
            .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(3))
            .await
    );
    assert!(manager.settings().is_some());
    assert!(matches!(
        manager.send(vec![0]).await,
        Err(MessagingError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_probe_reports_missing_broker() {
    let port = closed_port();

    let result = check_broker_reachable("127.0.0.1", port, Duration::from_secs(1)).await;

    assert!(result.is_err());
}
