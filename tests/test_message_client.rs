//! Message client facade tests
//!
//! Sends go through the real codec and the mock transport; published bytes
//! are decoded again to check what actually went on the wire.


use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sitewhere_bridge::client::{MessageClient, MessageClientCallback};
use sitewhere_bridge::protocol::{
    Command, CustomCommand, Direction, FrameCodec, Metadata, Payload, RegistrationAckState,
};
use std::sync::Arc;
use sitewhere_bridge::error::MessagingError;
use test_helpers::{connected_manager, mock_manager, registration_ack_frame};
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingCallback {
    calls: Mutex<Vec<String>>,
}

impl RecordingCallback {
    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MessageClientCallback for RecordingCallback {
    async fn on_connected_to_sitewhere(&self) {
        self.calls.lock().await.push("connected".to_string());
    }

    async fn on_received_system_command(&self, topic: &str, _payload: &[u8]) {
        self.calls.lock().await.push(format!("system:{topic}"));
    }

    async fn on_received_custom_command(&self, topic: &str, _payload: &[u8]) {
        self.calls.lock().await.push(format!("custom:{topic}"));
    }

    async fn on_received_event_message(&self, topic: &str, payload: &[u8]) {
        let body = String::from_utf8_lossy(payload);
        self.calls.lock().await.push(format!("event:{topic}:{body}"));
    }
}

async fn wait_for_calls(callback: &RecordingCallback, count: usize) -> bool {
    let deadline = tokio::time::Instant::now() + test_helpers::WAIT;
    while tokio::time::Instant::now() < deadline {
        if callback.calls().await.len() >= count {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_measurement_reaches_the_wire() {
    // Arrange
    let (transport, manager) = connected_manager("a1b2").await;
    let client = MessageClient::new(manager).await;
    let date = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

    // Act
    client
        .send_device_measurement("a1b2", Some("cmd-1"), "fuel.level", 0.25, Some(date))
        .await
        .unwrap();

    // Assert
    let published = transport.latest_connection().unwrap().published();
    assert_eq!(published.len(), 1);
    let (topic, bytes) = &published[0];
    assert_eq!(topic, "SiteWhere/default/input/protobuf");

    let frame = FrameCodec::decode_frame(bytes, Direction::Outbound).unwrap();
    assert_eq!(frame.header.command, Command::SendMeasurement);
    assert_eq!(frame.header.device_token.as_deref(), Some("a1b2"));
    assert_eq!(frame.header.originator.as_deref(), Some("cmd-1"));
    match frame.payload {
        Payload::Measurement(measurement) => {
            assert_eq!(measurement.name, "fuel.level");
            assert_eq!(measurement.value, 0.25);
            assert_eq!(measurement.event_date, Some(date));
        }
        other => panic!("expected measurement, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registration_carries_tokens_and_metadata() {
    let (transport, manager) = connected_manager("a1b2").await;
    let client = MessageClient::new(manager).await;
    let mut metadata = Metadata::new();
    metadata.insert("manufacturer".to_string(), "acme".to_string());

    client
        .send_device_registration(
            "a1b2",
            None,
            Some("southeast"),
            None,
            Some("android"),
            metadata.clone(),
        )
        .await
        .unwrap();

    let published = transport.latest_connection().unwrap().published();
    let frame = FrameCodec::decode_frame(&published[0].1, Direction::Outbound).unwrap();
    match frame.payload {
        Payload::Registration(request) => {
            assert_eq!(request.area_token.as_deref(), Some("southeast"));
            assert_eq!(request.customer_token, None);
            assert_eq!(request.device_type_token.as_deref(), Some("android"));
            assert_eq!(request.metadata, metadata);
        }
        other => panic!("expected registration, got {other:?}"),
    }
}

#[tokio::test]
async fn test_callback_receives_routed_commands() {
    let (transport, manager) = connected_manager("d1").await;
    let callback = Arc::new(RecordingCallback::default());
    let _client = MessageClient::with_callback(manager, callback.clone()).await;

    transport
        .inject(
            "SiteWhere/system/d1",
            registration_ack_frame(RegistrationAckState::NewRegistration),
        )
        .await;
    transport
        .inject("SiteWhere/commands/d1", CustomCommand::Ping.encode(None))
        .await;

    assert!(wait_for_calls(&callback, 3).await);
    assert_eq!(
        callback.calls().await,
        vec![
            "connected",
            "system:SiteWhere/system/d1",
            "custom:SiteWhere/commands/d1"
        ]
    );
}

#[tokio::test]
async fn test_latest_callback_wins() {
    // Arrange
    let (transport, manager) = connected_manager("d1").await;
    let first = Arc::new(RecordingCallback::default());
    let second = Arc::new(RecordingCallback::default());
    let client = MessageClient::with_callback(manager, first.clone()).await;
    assert!(wait_for_calls(&first, 1).await);

    // Act
    client.set_callback(second.clone()).await;
    transport
        .inject("SiteWhere/commands/d1", CustomCommand::TestEvents.encode(None))
        .await;

    // Assert
    assert!(wait_for_calls(&second, 1).await);
    assert_eq!(second.calls().await, vec!["custom:SiteWhere/commands/d1"]);
    assert_eq!(first.calls().await, vec!["connected"]);
}

#[tokio::test]
async fn test_close_unregisters_listener() {
    let (_transport, manager) = connected_manager("d1").await;
    let client = MessageClient::new(manager.clone()).await;
    assert_eq!(manager.registry().len().await, 1);

    client.close().await;

    assert!(manager.registry().is_empty().await);
}

#[tokio::test]
async fn test_sender_is_usable_after_client_is_cloned_out() {
    let (transport, manager) = connected_manager("d1").await;
    let client = MessageClient::new(manager).await;
    let sender = client.sender();

    let handle = tokio::spawn(async move {
        sender
            .send_device_alert("d1", None, "engine.overheat", "Engine is overheating!", None)
            .await
    });

    handle.await.unwrap().unwrap();
    let published = transport.latest_connection().unwrap().published();
    let frame = FrameCodec::decode_frame(&published[0].1, Direction::Outbound).unwrap();
    assert_eq!(frame.header.command, Command::SendAlert);
}

#[tokio::test]
async fn test_register_for_events_needs_a_connection() {
    let (_transport, manager) = mock_manager();
    let client = MessageClient::new(manager).await;

    let result = client.register_for_events("fleet/events").await;

    assert!(matches!(result, Err(MessagingError::NotConnected { .. })));
}

#[tokio::test]
async fn test_registered_event_topic_reaches_callback() {
    // Arrange
    let (transport, manager) = connected_manager("d1").await;
    let callback = Arc::new(RecordingCallback::default());
    let client = MessageClient::with_callback(manager, callback.clone()).await;

    // Act
    client.register_for_events("fleet/events").await.unwrap();
    transport.inject("fleet/events", b"{\"eventType\":\"Measurements\"}".to_vec()).await;

    // Assert
    assert!(wait_for_calls(&callback, 2).await);
    assert_eq!(
        callback.calls().await,
        vec![
            "connected".to_string(),
            "event:fleet/events:{\"eventType\":\"Measurements\"}".to_string()
        ]
    );
}
