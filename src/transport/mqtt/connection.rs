//! MQTT connection options
//!
//! Pure functions that turn bridge configuration into `rumqttc` options.

use crate::config::{BridgeConfig, ConnectionSettings};
use crate::transport::TransportError;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// Options shared by every connection a transport opens
#[derive(Debug, Clone, PartialEq)]
pub struct MqttTransportOptions {
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub qos: QoS,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Capacity of the request and inbound channels
    pub channel_capacity: usize,
}

impl Default for MqttTransportOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            qos: QoS::ExactlyOnce,
            tls: false,
            username: None,
            password: None,
            channel_capacity: 64,
        }
    }
}

impl MqttTransportOptions {
    /// Build options from configuration, resolving credentials from the
    /// environment
    pub fn from_config(config: &BridgeConfig) -> Result<Self, TransportError> {
        Ok(Self {
            keep_alive: Duration::from_secs(config.broker.keep_alive_secs),
            connect_timeout: config.connect_timeout(),
            qos: qos_from_level(config.broker.qos)?,
            tls: config.broker.tls,
            username: config.get_mqtt_username(),
            password: config.get_mqtt_password(),
            ..Self::default()
        })
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, TransportError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransportError::InvalidOptions(format!(
            "unsupported QoS level {other}"
        ))),
    }
}

/// Client id used for a device connection
///
/// Brokers drop an older session when a second client connects with the
/// same id, so the id stays stable per device.
pub fn client_id_for(device_id: &str) -> String {
    format!("sitewhere-{device_id}")
}

pub fn configure_mqtt_options(
    settings: &ConnectionSettings,
    options: &MqttTransportOptions,
) -> Result<MqttOptions, TransportError> {
    if settings.hostname.trim().is_empty() {
        return Err(TransportError::InvalidOptions(
            "broker hostname is empty".to_string(),
        ));
    }
    if options.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(
            "keep-alive must be at least one second".to_string(),
        ));
    }

    let mut mqtt_options = MqttOptions::new(
        client_id_for(&settings.device_id),
        settings.hostname.clone(),
        settings.port,
    );

    if options.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}
