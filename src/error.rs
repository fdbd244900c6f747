//! Operation-scoped error taxonomy for the session bridge
//!
//! Every failure a caller can observe is reported under the code of the operation that
//! produced it. Local precondition failures (wrong connection state, bad QoS) and
//! engine-reported failures share the same codes; only the message text tells them apart.

use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Operation-scoped error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Publish,
}

impl ErrorCode {
    /// Wire code used when the error crosses into the application facade
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Connect => "MQTT_CONNECT_ERROR",
            ErrorCode::Disconnect => "MQTT_DISCONNECT_ERROR",
            ErrorCode::Subscribe => "MQTT_SUBSCRIBE_ERROR",
            ErrorCode::Unsubscribe => "MQTT_UNSUBSCRIBE_ERROR",
            ErrorCode::Publish => "MQTT_PUBLISH_ERROR",
        }
    }

    /// Message used when the underlying cause carries no text of its own
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Connect => "Connection failed",
            ErrorCode::Disconnect => "Disconnect failed",
            ErrorCode::Subscribe => "Subscribe failed",
            ErrorCode::Unsubscribe => "Unsubscribe failed",
            ErrorCode::Publish => "Publish failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const NOT_CONNECTED: &str = "Client is not connected";
pub const ALREADY_CONNECTED: &str = "Client is already connected or connecting";
pub const BRIDGE_CLOSED: &str = "Bridge is shut down";

/// Error returned by every bridge operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct BridgeError {
    code: ErrorCode,
    message: String,
}

impl BridgeError {
    pub fn new<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Operation attempted while no session is connected
    pub fn not_connected(code: ErrorCode) -> Self {
        Self::new(code, NOT_CONNECTED)
    }

    /// Connect attempted while a session is connected or being established
    pub fn already_connected() -> Self {
        Self::new(ErrorCode::Connect, ALREADY_CONNECTED)
    }

    /// QoS level outside 0..=2
    pub fn invalid_qos(code: ErrorCode, value: u8) -> Self {
        Self::new(code, format!("Invalid QoS level: {value}"))
    }

    /// Request issued after the dispatcher stopped
    pub fn bridge_closed(code: ErrorCode) -> Self {
        Self::new(code, BRIDGE_CLOSED)
    }

    /// Map an engine failure to the operation's code, falling back to the default
    /// message when the cause has nothing to say
    pub fn engine(code: ErrorCode, cause: Option<&EngineError>) -> Self {
        let message = cause
            .map(|e| e.to_string())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| code.default_message().to_string());
        Self::new(code, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Rejection body handed to the application facade
    pub fn to_payload(&self) -> Value {
        json!({
            "code": self.code.as_str(),
            "message": self.message,
        })
    }
}

/// Failures reported by the protocol engine seam
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("Timed out waiting for broker after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Network(String),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Client(String),
    #[error("")]
    Unknown,
    #[error("Engine session is closed")]
    Closed,
}

impl From<rumqttc::ClientError> for EngineError {
    fn from(err: rumqttc::ClientError) -> Self {
        EngineError::Client(err.to_string())
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
