//! MQTT transport built on `rumqttc`
//!
//! - [`connection`] - Pure option building from configuration
//! - [`message_handler`] - Pure routing of raw MQTT events
//! - [`client`] - The transport, its connections and the event-loop driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use sitewhere_bridge::config::ConnectionSettings;
//! use sitewhere_bridge::transport::mqtt::{MqttTransport, MqttTransportOptions};
//! use sitewhere_bridge::transport::{BrokerConnection, BrokerTransport};
//!
//! # tokio_test::block_on(async {
//! let transport = MqttTransport::new(MqttTransportOptions::default());
//! let settings = ConnectionSettings::new("localhost", "device-1");
//!
//! let (connection, mut inbound) = transport.open(&settings).await?;
//! connection.subscribe("SiteWhere/system/device-1").await?;
//! if let Some(message) = inbound.recv().await {
//!     println!("{} bytes on {}", message.payload.len(), message.topic);
//! }
//! connection.close().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnection, MqttTransport};
pub use connection::{configure_mqtt_options, MqttTransportOptions};
pub use message_handler::{EventRoute, MessageHandler};
