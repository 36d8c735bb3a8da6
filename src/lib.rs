//! SiteWhere device bridge
//!
//! Connects a device to SiteWhere over MQTT: encodes device events as
//! delimited protocol-buffer frames, manages the broker connection through
//! network changes, and routes inbound commands to registered listeners.
//!
//! # Overview
//!
//! - [`protocol`]: wire codec, message types, topic scheme and custom commands
//! - [`transport`]: broker transport traits and the `rumqttc` implementation
//! - [`bridge`]: connection manager, listener registry and network handling
//! - [`client`]: the application-facing message client
//! - [`reporter`]: periodic telemetry
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sitewhere_bridge::bridge::{ConnectionManager, ConnectionState};
//! use sitewhere_bridge::client::MessageClient;
//! use sitewhere_bridge::config::ConnectionSettings;
//! use sitewhere_bridge::protocol::TopicScheme;
//! use sitewhere_bridge::transport::mqtt::{MqttTransport, MqttTransportOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let transport = MqttTransport::new(MqttTransportOptions::default());
//! let manager = Arc::new(ConnectionManager::new(transport, TopicScheme::default()));
//! let client = MessageClient::new(manager.clone()).await;
//!
//! client.connect(ConnectionSettings::new("localhost", "device-1"));
//! if manager.wait_for_state(ConnectionState::Connected, Duration::from_secs(10)).await {
//!     client
//!         .send_device_measurement("device-1", None, "engine.temp", 92.5, None)
//!         .await?;
//! }
//! client.disconnect();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod reporter;
pub mod testing;
pub mod transport;

pub use bridge::{ConnectOutcome, ConnectionManager, ConnectionState};
pub use client::{MessageClient, MessageClientCallback, MessageSender};
pub use config::{BridgeConfig, ConfigError, ConnectionSettings};
pub use error::{ListenerUnreachable, MessagingError, MessagingResult};
pub use protocol::{CodecError, FrameCodec, TopicScheme};
