//! MQTT session bridge
//!
//! Exposes one MQTT client session to an application through asynchronous requests and
//! a named event stream.
//!
//! # Overview
//!
//! - [`bridge`] - The [`MqttBridge`] handle, connection state machine and event fan-out
//! - [`engine`] - The protocol engine seam and its `rumqttc` implementation
//! - [`error`] - Operation-scoped error codes
//! - [`config`] - TOML configuration for the command-line host
//! - [`observability`] - Structured logging
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_bridge::bridge::{EventName, MqttBridge};
//! use mqtt_bridge::engine::ReconnectConfig;
//!
//! # async fn demo() -> Result<(), mqtt_bridge::error::BridgeError> {
//! let bridge = MqttBridge::with_rumqtt(10, ReconnectConfig::default());
//! let mut messages = bridge.add_listener(Some(EventName::MessageReceived)).await;
//!
//! bridge.connect("tcp://localhost:1883", "", "").await?;
//! bridge.subscribe("sensors/#", 1).await?;
//!
//! if let Some(event) = messages.recv().await {
//!     println!("{}", event.to_payload());
//! }
//! bridge.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod testing;

pub use bridge::{BridgeEvent, ConnectionState, EventName, Listener, MqttBridge};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, EngineError, ErrorCode};
