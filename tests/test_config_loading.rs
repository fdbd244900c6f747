//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading a file from disk: defaults, validation
//! failures and credential resolution.

use mqtt_bridge::config::{BridgeConfig, ConfigError};
use mqtt_bridge::engine::ReconnectConfig;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost:1883"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"

[subscriptions]
topics = ["sensors/#", "alerts/+"]
qos = 0
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.url, "mqtt://localhost:1883");
    assert_eq!(config.broker.username_env.as_deref(), Some("MQTT_USER"));
    assert_eq!(config.broker.password_env.as_deref(), Some("MQTT_PASS"));
    assert_eq!(config.subscriptions.topics, vec!["sensors/#", "alerts/+"]);
    assert_eq!(config.subscriptions.qos, 0);
}

#[test]
fn test_config_defaults_for_optional_sections() {
    let temp_file = write_config(
        r#"
[broker]
url = "tcp://localhost:1883"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.username_env, None);
    assert!(config.subscriptions.topics.is_empty());
    assert_eq!(config.subscriptions.qos, 1);
    assert_eq!(config.engine.request_capacity, 10);
    assert_eq!(config.engine.reconnect_config(), ReconnectConfig::default());
}

#[test]
fn test_config_accepts_tls_schemes() {
    for url in [
        "ssl://broker:8883",
        "tls://broker:8883",
        "mqtts://broker",
    ] {
        let temp_file = write_config(&format!("[broker]\nurl = \"{url}\"\n"));
        assert!(
            BridgeConfig::load_from_file(temp_file.path()).is_ok(),
            "{url} should be accepted"
        );
    }
}

#[test]
fn test_config_missing_file_is_read_error() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/mqtt-bridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_malformed_toml_is_parse_error() {
    let temp_file = write_config("[broker\nurl = ");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_unsupported_scheme() {
    let temp_file = write_config("[broker]\nurl = \"ws://localhost:9001\"\n");

    let err = BridgeConfig::load_from_file(temp_file.path()).unwrap_err();

    assert!(matches!(err, ConfigError::InvalidBrokerUrl(_)));
    assert!(err.to_string().contains("ws"));
}

#[test]
fn test_config_rejects_invalid_engine_settings() {
    let temp_file = write_config(
        r#"
[broker]
url = "tcp://localhost:1883"

[engine]
request_capacity = 0
"#,
    );

    let err = BridgeConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(err.to_string().contains("request_capacity"));
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("MQTT_BRIDGE_IT_USER", "bob");
    std::env::set_var("MQTT_BRIDGE_IT_PASS", "hunter2");
    let temp_file = write_config(
        r#"
[broker]
url = "tcp://localhost:1883"
username_env = "MQTT_BRIDGE_IT_USER"
password_env = "MQTT_BRIDGE_IT_PASS"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.get_username(), "bob");
    assert_eq!(config.get_password(), "hunter2");
    assert_eq!(
        config.require_credentials().unwrap(),
        ("bob".to_string(), "hunter2".to_string())
    );
    // Secrets never end up in the serialized configuration
    let shown = toml::to_string_pretty(&config).unwrap();
    assert!(!shown.contains("hunter2"));

    std::env::remove_var("MQTT_BRIDGE_IT_USER");
    std::env::remove_var("MQTT_BRIDGE_IT_PASS");
}
