//! Configuration loading and validation tests
//!
//! Tests cover loading from disk, defaults, and the errors a bad file
//! produces.

use sitewhere_bridge::config::{BridgeConfig, ConfigError};
use sitewhere_bridge::protocol::OutboundLayout;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_from_file() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "mqtt.fleet.example"
port = 1884

[device]
id = "truck-17"
tenant = "logistics"
device_type_token = "android-tablet"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.hostname, "mqtt.fleet.example");
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.device.id, "truck-17");
    assert_eq!(
        config.device.device_type_token.as_deref(),
        Some("android-tablet")
    );

    let settings = config.connection_settings();
    assert_eq!(settings.tenant, "logistics");
    let topics = config.topic_scheme().topics_for(&settings);
    assert_eq!(topics.outbound, "SiteWhere/logistics/input/protobuf");
    assert_eq!(topics.command, "SiteWhere/commands/truck-17");
    assert_eq!(topics.system, "SiteWhere/system/truck-17");
}

#[test]
fn test_defaults_applied_for_missing_sections() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "localhost"

[device]
id = "d1"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.port, 1883);
    assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.protocol.outbound_layout, OutboundLayout::Tenant);
    assert!(config.protocol.event_topics.is_empty());
    assert_eq!(config.probe_interval(), Duration::from_secs(15));
    assert_eq!(config.probe_timeout(), Duration::from_secs(3));
    assert!(!config.reporter.enabled);
}

#[test]
fn test_reporter_section() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "localhost"

[device]
id = "d1"

[reporter]
enabled = true
interval_secs = 30
latitude = 33.755
longitude = -84.39

[reporter.measurements]
"engine.temp" = 92.5
"fuel.level" = 0.4
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert!(config.reporter.enabled);
    assert_eq!(config.report_interval(), Duration::from_secs(30));
    assert_eq!(config.reporter.measurements.len(), 2);
    assert_eq!(config.reporter.measurements["engine.temp"], 92.5);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BridgeConfig::load_from_file(std::path::Path::new("/nonexistent/sitewhere.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[broker\nhostname = ");

    let result = BridgeConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_device_section_is_parse_error() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "localhost"
"#,
    );

    assert!(matches!(
        BridgeConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_wildcards_in_identifiers_rejected() {
    for device_id in ["dev+1", "dev#", "dev/1", "dev 1"] {
        let temp_file = write_config(&format!(
            r#"
[broker]
hostname = "localhost"

[device]
id = "{device_id}"
"#
        ));

        let result = BridgeConfig::load_from_file(temp_file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidIdentifier(_))),
            "device id '{device_id}' should be rejected"
        );
    }
}

#[test]
fn test_half_configured_location_rejected() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "localhost"

[device]
id = "d1"

[reporter]
latitude = 33.755
"#,
    );

    assert!(matches!(
        BridgeConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let temp_file = write_config(
        r#"
[broker]
hostname = "localhost"

[device]
id = "d1"

[device.metadata]
manufacturer = "acme"
"#,
    );
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = BridgeConfig::from_toml_str(&rendered).unwrap();

    assert_eq!(reparsed, config);
}

#[test]
fn test_bundled_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/sitewhere.toml");

    let config = BridgeConfig::load_from_file(&path).unwrap();

    assert_eq!(config.device.id, "rust-device-1");
    assert_eq!(config.protocol.outbound_layout, OutboundLayout::Tenant);
    assert!(config.reporter.enabled);
    assert_eq!(config.reporter.measurements.len(), 2);
}
