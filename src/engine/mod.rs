//! Protocol engine seam
//!
//! The bridge never talks to the network directly. It drives an implementation of
//! [`ProtocolEngine`], which owns the MQTT connection, and receives the engine's
//! unsolicited notifications through an [`EngineNotifier`] handed over at connect time.
//!
//! - [`options`] - Fixed connect parameters, broker URL parsing and reconnect pacing
//! - [`tracker`] - Pure completion bookkeeping that matches acknowledgements to requests
//! - [`rumqtt`] - Production engine backed by `rumqttc`

pub mod options;
pub mod rumqtt;
pub mod tracker;

use crate::error::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use options::{generate_session_id, ReconnectConfig};
pub use rumqtt::RumqttEngine;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Username/password pair attached to a connect request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Engine-level connect options for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub endpoint: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub clean_start: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub automatic_reconnect: bool,
}

/// Message handed to the engine for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl OutgoingMessage {
    /// Build a non-retained message
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: options::RETAIN_PUBLISHED,
        }
    }
}

/// Unsolicited notification raised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    ConnectionLost { cause: Option<String> },
    Reconnected,
    MessageArrived { topic: String, payload: Bytes },
    DeliveryComplete { packet_id: u16 },
}

/// Notification tagged with the session that raised it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineNotification {
    pub session_id: String,
    pub kind: NotificationKind,
}

type NotificationSink = Arc<dyn Fn(EngineNotification) + Send + Sync>;

/// Handler registration passed to the engine on connect
///
/// The engine may call it from any task; the sink must not block.
#[derive(Clone)]
pub struct EngineNotifier {
    session_id: Arc<str>,
    sink: NotificationSink,
}

impl EngineNotifier {
    pub fn new<F>(session_id: &str, sink: F) -> Self
    where
        F: Fn(EngineNotification) + Send + Sync + 'static,
    {
        Self {
            session_id: Arc::from(session_id),
            sink: Arc::new(sink),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn notify(&self, kind: NotificationKind) {
        (self.sink)(EngineNotification {
            session_id: self.session_id.to_string(),
            kind,
        });
    }

    pub fn connection_lost(&self, cause: Option<String>) {
        self.notify(NotificationKind::ConnectionLost { cause });
    }

    pub fn reconnected(&self) {
        self.notify(NotificationKind::Reconnected);
    }

    pub fn message_arrived(&self, topic: impl Into<String>, payload: impl Into<Bytes>) {
        self.notify(NotificationKind::MessageArrived {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn delivery_complete(&self, packet_id: u16) {
        self.notify(NotificationKind::DeliveryComplete { packet_id });
    }
}

impl fmt::Debug for EngineNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineNotifier")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Factory for broker sessions
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Establish a session. Resolves once the broker accepted the connection.
    async fn connect(
        &self,
        options: ConnectOptions,
        notifier: EngineNotifier,
    ) -> Result<Arc<dyn EngineSession>, EngineError>;
}

/// A live broker session
///
/// Each operation resolves once the broker acknowledged it, or fails.
#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn disconnect(&self) -> Result<(), EngineError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError>;

    async fn publish(&self, message: OutgoingMessage) -> Result<(), EngineError>;

    /// Release the session without a network round-trip
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(3));
        assert_eq!(QoS::try_from(255), Err(255));
    }

    #[test]
    fn test_qos_into_rumqttc() {
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_outgoing_message_is_never_retained() {
        let message = OutgoingMessage::new("t/1", "hello", QoS::AtLeastOnce);
        assert!(!message.retain);
        assert_eq!(message.payload, Bytes::from("hello"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "user".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_notifier_tags_session_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notifier = EngineNotifier::new("MqttBridge_abcd1234", move |n| {
            sink.lock().unwrap().push(n);
        });

        notifier.message_arrived("a/b", "payload");
        notifier.connection_lost(None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|n| n.session_id == "MqttBridge_abcd1234"));
        assert_eq!(
            seen[0].kind,
            NotificationKind::MessageArrived {
                topic: "a/b".to_string(),
                payload: Bytes::from("payload"),
            }
        );
        assert_eq!(seen[1].kind, NotificationKind::ConnectionLost { cause: None });
    }
}
