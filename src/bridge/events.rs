//! Event records emitted by the session bridge
//!
//! Each record maps to one named channel of the application-facing event surface and a
//! JSON body for that channel.

use crate::error::ErrorCode;
use bytes::Bytes;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Named event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    Disconnected,
    MessageReceived,
    Error,
    Subscribed,
    Unsubscribed,
}

impl EventName {
    pub const ALL: [EventName; 6] = [
        EventName::Connected,
        EventName::Disconnected,
        EventName::MessageReceived,
        EventName::Error,
        EventName::Subscribed,
        EventName::Unsubscribed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connected => "onMqttConnected",
            EventName::Disconnected => "onMqttDisconnected",
            EventName::MessageReceived => "onMqttMessageReceived",
            EventName::Error => "onMqttError",
            EventName::Subscribed => "onMqttSubscribed",
            EventName::Unsubscribed => "onMqttUnsubscribed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("Unknown event channel: {s}"))
    }
}

/// Details of an established (or re-established) session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedInfo {
    pub message: String,
    pub endpoint: String,
    pub session_id: String,
    /// True when the engine restored a lost connection on its own
    pub reconnected: bool,
}

/// Transient record forwarded to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected(ConnectedInfo),
    Disconnected { reason: String },
    MessageReceived { topic: String, payload: Bytes },
    Error { context: ErrorCode, message: String },
    Subscribed { topic: String },
    Unsubscribed { topic: String },
}

impl BridgeEvent {
    pub fn name(&self) -> EventName {
        match self {
            BridgeEvent::Connected(_) => EventName::Connected,
            BridgeEvent::Disconnected { .. } => EventName::Disconnected,
            BridgeEvent::MessageReceived { .. } => EventName::MessageReceived,
            BridgeEvent::Error { .. } => EventName::Error,
            BridgeEvent::Subscribed { .. } => EventName::Subscribed,
            BridgeEvent::Unsubscribed { .. } => EventName::Unsubscribed,
        }
    }

    /// Inbound payload as text, replacing invalid UTF-8
    pub fn payload_text(&self) -> Option<String> {
        match self {
            BridgeEvent::MessageReceived { payload, .. } => {
                Some(String::from_utf8_lossy(payload).into_owned())
            }
            _ => None,
        }
    }

    /// Body delivered on the event's channel
    pub fn to_payload(&self) -> Value {
        match self {
            BridgeEvent::Connected(info) => json!({
                "message": info.message,
                "reconnected": info.reconnected,
            }),
            BridgeEvent::Disconnected { reason } => json!({ "message": reason }),
            BridgeEvent::MessageReceived { topic, .. } => json!({
                "topic": topic,
                "message": self.payload_text().unwrap_or_default(),
            }),
            BridgeEvent::Error { message, .. } => json!({ "error": message }),
            BridgeEvent::Subscribed { topic } => json!({ "topic": topic }),
            BridgeEvent::Unsubscribed { topic } => json!({ "topic": topic }),
        }
    }
}
