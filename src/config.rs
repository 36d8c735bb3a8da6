//! Configuration for the device bridge
//!
//! Loaded from TOML. Broker credentials never live in the file itself; the
//! file names the environment variables that hold them.

use crate::protocol::topics::{validate_identifier, OutboundLayout, TopicScheme, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TENANT: &str = "default";

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub broker: BrokerSection,
    pub device: DeviceSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub reporter: ReporterSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on waiting for the broker's CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// MQTT QoS level (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Stable device identifier, also used as the device token
    pub id: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub device_type_token: Option<String>,
    pub area_token: Option<String>,
    pub customer_token: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSection {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub outbound_layout: OutboundLayout,
    /// Extra topics subscribed as event messages once connected
    #[serde(default)]
    pub event_topics: Vec<String>,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            outbound_layout: OutboundLayout::default(),
            event_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_true")]
    pub probe_enabled: bool,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            probe_enabled: true,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReporterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
}

impl Default for ReporterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_report_interval(),
            latitude: None,
            longitude: None,
            elevation: 0.0,
            measurements: BTreeMap::new(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_keep_alive() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_qos() -> u8 {
    2
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

fn default_topic_prefix() -> String {
    crate::protocol::topics::DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_report_interval() -> u64 {
    5
}

/// Broker endpoint and device identity for one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub device_id: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
}

impl ConnectionSettings {
    pub fn new<H: Into<String>, D: Into<String>>(hostname: H, device_id: D) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_MQTT_PORT,
            device_id: device_id.into(),
            tenant: DEFAULT_TENANT.to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tenant<S: Into<String>>(mut self, tenant: S) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Whether `other` points at the same broker as the same device.
    /// The tenant is not compared.
    pub fn same_endpoint(&self, other: &ConnectionSettings) -> bool {
        self.hostname == other.hostname
            && self.port == other.port
            && self.device_id == other.device_id
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker hostname cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker port cannot be 0".to_string(),
            ));
        }
        validate_identifier("device id", &self.device_id)?;
        validate_identifier("tenant", &self.tenant)?;
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection_settings().validate()?;

        if self.broker.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {}",
                self.broker.qos
            )));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let prefix = self.protocol.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return Err(ConfigError::InvalidConfig(format!(
                "topic_prefix '{}' is not a usable topic prefix",
                self.protocol.topic_prefix
            )));
        }
        if let Some(topic) = self.protocol.event_topics.iter().find(|t| t.is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "event topic '{topic}' cannot be empty"
            )));
        }

        if self.network.probe_enabled
            && (self.network.probe_interval_secs == 0 || self.network.probe_timeout_secs == 0)
        {
            return Err(ConfigError::InvalidConfig(
                "probe interval and timeout must be greater than 0".to_string(),
            ));
        }
        if self.reporter.enabled && self.reporter.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reporter interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.reporter.latitude.is_some() != self.reporter.longitude.is_some() {
            return Err(ConfigError::InvalidConfig(
                "reporter latitude and longitude must be set together".to_string(),
            ));
        }

        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            hostname: self.broker.hostname.clone(),
            port: self.broker.port,
            device_id: self.device.id.clone(),
            tenant: self.device.tenant.clone(),
        }
    }

    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(
            self.protocol.topic_prefix.clone(),
            self.protocol.outbound_layout,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.network.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.network.probe_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.reporter.interval_secs)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
hostname = "localhost"

[device]
id = "test-device"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
hostname = "mqtt.example.com"
port = 8883
username_env = "SW_MQTT_USER"
password_env = "SW_MQTT_PASS"
keep_alive_secs = 60
qos = 1
tls = true

[device]
id = "a1b2c3"
tenant = "acme"
device_type_token = "android"
area_token = "southeast"

[device.metadata]
manufacturer = "acme"

[protocol]
topic_prefix = "Lab"
outbound_layout = "shared"
event_topics = ["alerts/fleet"]

[network]
probe_interval_secs = 30

[reporter]
enabled = true
latitude = 33.75
longitude = -84.39
"#;

        let config = BridgeConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.tls);
        assert_eq!(config.broker.qos, 1);
        assert_eq!(config.device.tenant, "acme");
        assert_eq!(config.device.metadata["manufacturer"], "acme");
        assert_eq!(config.protocol.outbound_layout, OutboundLayout::Shared);
        assert_eq!(config.network.probe_timeout_secs, 3);
        assert_eq!(config.reporter.interval_secs, 5);
        assert_eq!(
            config.topic_scheme().outbound_topic("acme"),
            "Lab/input/protobuf"
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::test_config();

        assert_eq!(config.broker.port, DEFAULT_MQTT_PORT);
        assert_eq!(config.broker.keep_alive_secs, 300);
        assert_eq!(config.broker.qos, 2);
        assert_eq!(config.device.tenant, DEFAULT_TENANT);
        assert_eq!(config.protocol.topic_prefix, "SiteWhere");
        assert!(config.network.probe_enabled);
        assert!(!config.reporter.enabled);
        assert_eq!(config.report_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_device_id() {
        let toml_content = r#"
[broker]
hostname = "localhost"

[device]
id = "dev/1"
"#;

        let err = BridgeConfig::from_toml_str(toml_content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_invalid_qos() {
        let mut config = BridgeConfig::test_config();
        config.broker.qos = 3;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_wildcard_prefix_rejected() {
        let mut config = BridgeConfig::test_config();
        config.protocol.topic_prefix = "SiteWhere/#".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_endpoint_ignores_tenant() {
        let base = ConnectionSettings::new("broker", "dev-1");

        assert!(base.same_endpoint(&base.clone().with_tenant("other")));
        assert!(!base.same_endpoint(&base.clone().with_port(8883)));
        assert!(!base.same_endpoint(&ConnectionSettings::new("broker", "dev-2")));
    }

    #[test]
    fn test_settings_validation() {
        assert!(ConnectionSettings::new("broker", "dev-1").validate().is_ok());
        assert!(ConnectionSettings::new("", "dev-1").validate().is_err());
        assert!(ConnectionSettings::new("broker", "dev-1")
            .with_port(0)
            .validate()
            .is_err());
        assert!(ConnectionSettings::new("broker", "dev-1")
            .with_tenant("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_credentials_from_env() {
        let mut config = BridgeConfig::test_config();
        config.broker.username_env = Some("SW_TEST_CONFIG_USER".to_string());
        config.broker.password_env = Some("SW_TEST_CONFIG_MISSING".to_string());
        std::env::set_var("SW_TEST_CONFIG_USER", "device-user");

        assert_eq!(config.get_mqtt_username().as_deref(), Some("device-user"));
        assert_eq!(config.get_mqtt_password(), None);

        std::env::remove_var("SW_TEST_CONFIG_USER");
    }
}
