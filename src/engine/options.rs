//! Fixed connect parameters, broker URL handling and reconnect pacing
//!
//! Callers only choose the endpoint and credentials. Everything else about the session
//! is fixed here.

use super::{ConnectOptions, Credentials};
use crate::error::EngineError;
use rumqttc::{MqttOptions, NetworkOptions, Transport};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const CLIENT_ID_PREFIX: &str = "MqttBridge_";
pub const CLEAN_START: bool = true;
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
pub const KEEP_ALIVE_SECS: u64 = 60;
pub const AUTOMATIC_RECONNECT: bool = true;
pub const RETAIN_PUBLISHED: bool = false;

const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

/// Generate a fresh session identifier: prefix plus eight random hex characters
pub fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &suffix[..8])
}

impl ConnectOptions {
    /// Build connect options with the fixed session parameters.
    /// Credentials are attached only when at least one of them is non-empty.
    pub fn new(endpoint: &str, client_id: &str, username: &str, password: &str) -> Self {
        let credentials = if username.is_empty() && password.is_empty() {
            None
        } else {
            Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        };

        Self {
            endpoint: endpoint.to_string(),
            client_id: client_id.to_string(),
            credentials,
            clean_start: CLEAN_START,
            keep_alive: Duration::from_secs(KEEP_ALIVE_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            automatic_reconnect: AUTOMATIC_RECONNECT,
        }
    }
}

/// Broker location extracted from an endpoint URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://`, `tls://` or `mqtts://` endpoints
pub fn parse_broker_url(endpoint: &str) -> Result<BrokerAddress, EngineError> {
    let url = Url::parse(endpoint).map_err(|_| EngineError::InvalidBrokerUrl(endpoint.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => return Err(EngineError::UnsupportedScheme(other.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| EngineError::InvalidBrokerUrl(endpoint.to_string()))?;
    let port = url.port().unwrap_or(if tls { TLS_PORT } else { PLAIN_PORT });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Translate connect options into rumqttc options
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, EngineError> {
    let address = parse_broker_url(&options.endpoint)?;

    let mut mqtt_options = MqttOptions::new(&options.client_id, address.host, address.port);
    mqtt_options
        .set_clean_session(options.clean_start)
        .set_keep_alive(options.keep_alive);

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    if address.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    Ok(mqtt_options)
}

/// Network options for the event loop
///
/// rumqttc bounds the TCP connect and the ConnAck wait with its own connection timeout,
/// so the session's connect timeout has to be applied here.
pub fn configure_network_options(options: &ConnectOptions) -> NetworkOptions {
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(options.connect_timeout.as_secs());
    network_options
}

/// Pacing for the engine's automatic reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        assert!(id.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(id.len(), CLIENT_ID_PREFIX.len() + 8);
        assert!(id[CLIENT_ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_ids_are_fresh() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn test_connect_options_fixed_parameters() {
        let options = ConnectOptions::new("tcp://broker:1883", "MqttBridge_00000000", "", "");
        assert!(options.clean_start);
        assert!(options.automatic_reconnect);
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.credentials, None);
    }

    #[test]
    fn test_connect_options_attach_credentials() {
        let options = ConnectOptions::new("tcp://broker:1883", "id", "user", "pass");
        let credentials = options.credentials.expect("credentials should be attached");
        assert_eq!(credentials.username, "user");
        assert_eq!(credentials.password, "pass");

        let password_only = ConnectOptions::new("tcp://broker:1883", "id", "", "pass");
        assert!(password_only.credentials.is_some());
    }

    #[test]
    fn test_parse_plain_urls() {
        let address = parse_broker_url("tcp://broker:1883").unwrap();
        assert_eq!(
            address,
            BrokerAddress {
                host: "broker".to_string(),
                port: 1883,
                tls: false,
            }
        );

        let address = parse_broker_url("mqtt://localhost").unwrap();
        assert_eq!(address.port, 1883);
        assert!(!address.tls);
    }

    #[test]
    fn test_parse_tls_urls() {
        for endpoint in ["ssl://broker", "tls://broker", "mqtts://broker"] {
            let address = parse_broker_url(endpoint).unwrap();
            assert!(address.tls, "{endpoint} should use TLS");
            assert_eq!(address.port, 8883);
        }

        assert_eq!(parse_broker_url("ssl://broker:9999").unwrap().port, 9999);
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(matches!(
            parse_broker_url("not a url"),
            Err(EngineError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_url("http://broker:80"),
            Err(EngineError::UnsupportedScheme(s)) if s == "http"
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = ConnectOptions::new("tcp://broker:1884", "MqttBridge_12345678", "u", "p");
        let mqtt_options = configure_mqtt_options(&options).unwrap();

        assert_eq!(mqtt_options.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(mqtt_options.client_id(), "MqttBridge_12345678");
        assert!(mqtt_options.clean_session());
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_network_options_carry_connect_timeout() {
        let options = ConnectOptions::new("tcp://broker:1883", "id", "", "");
        let network_options = configure_network_options(&options);

        assert_eq!(network_options.connection_timeout(), CONNECT_TIMEOUT_SECS);
        assert_eq!(CONNECT_TIMEOUT_SECS, 30);
    }

    #[test]
    fn test_configure_mqtt_options_invalid_url() {
        let options = ConnectOptions::new("invalid-url", "id", "", "");
        assert!(configure_mqtt_options(&options).is_err());
    }

    #[test]
    fn test_backoff_delay_pattern() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(2), 500);
        assert_eq!(config.calculate_backoff_delay(4), 2000);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);
    }

    #[test]
    fn test_backoff_empty_pattern_uses_sustained() {
        let config = ReconnectConfig {
            backoff_pattern: Vec::new(),
            sustained_delay: 100,
        };
        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert!(config.validate().is_ok());

        let invalid = ReconnectConfig {
            backoff_pattern: vec![10],
            sustained_delay: 0,
        };
        assert!(invalid.validate().is_err());
    }
}
