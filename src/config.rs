//! Configuration for the bridge host
//!
//! Only the broker location, credential env var names, startup subscriptions and
//! engine pacing are configurable. Connect parameters (clean start, keep-alive,
//! timeouts) are fixed by the engine.

use crate::engine::options::parse_broker_url;
use crate::engine::{QoS, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub subscriptions: SubscriptionSection,
    #[serde(default)]
    pub engine: EngineSection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

/// Topics subscribed after the host connects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            qos: default_qos(),
        }
    }
}

/// Engine pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Capacity of the engine's outgoing request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Delays between reconnect attempts after a connection loss
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: Vec<u64>,
    /// Delay once the backoff pattern is exhausted
    #[serde(default = "default_reconnect_sustained_ms")]
    pub reconnect_sustained_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_sustained_ms: default_reconnect_sustained_ms(),
        }
    }
}

impl EngineSection {
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            backoff_pattern: self.reconnect_backoff_ms.clone(),
            sustained_delay: self.reconnect_sustained_ms,
        }
    }
}

fn default_qos() -> u8 {
    1
}

fn default_request_capacity() -> usize {
    10
}

fn default_reconnect_backoff_ms() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_reconnect_sustained_ms() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
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
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::InvalidBrokerUrl(
                "broker url must not be empty".to_string(),
            ));
        }
        parse_broker_url(&self.broker.url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(e.to_string()))?;

        QoS::try_from(self.subscriptions.qos).map_err(|qos| {
            ConfigError::InvalidConfig(format!("subscriptions.qos must be 0, 1 or 2, got {qos}"))
        })?;

        if self.engine.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "engine.request_capacity must be greater than 0".to_string(),
            ));
        }
        self.engine
            .reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Username from the configured env var; empty when unset
    pub fn get_username(&self) -> String {
        Self::get_env_var_optional(self.broker.username_env.as_ref()).unwrap_or_default()
    }

    /// Password from the configured env var; empty when unset
    pub fn get_password(&self) -> String {
        Self::get_env_var_optional(self.broker.password_env.as_ref()).unwrap_or_default()
    }

    /// Username and password, failing when a named env var is unset
    pub fn require_credentials(&self) -> Result<(String, String), ConfigError> {
        let read = |name: Option<&String>| -> Result<String, ConfigError> {
            match name {
                Some(name) => {
                    std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
                }
                None => Ok(String::new()),
            }
        };
        Ok((
            read(self.broker.username_env.as_ref())?,
            read(self.broker.password_env.as_ref())?,
        ))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"

[subscriptions]
topics = ["sensors/#"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
