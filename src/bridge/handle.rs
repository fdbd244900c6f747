//! Application-facing bridge handle
//!
//! [`MqttBridge`] is cheap to clone. Every clone talks to the same dispatcher, and each
//! request resolves exactly once: with a success message or with a [`BridgeError`].

use super::dispatcher::{BridgeStatus, Command, Dispatcher, Reply};
use super::events::{BridgeEvent, EventName};
use super::fanout::EventReceiver;
use super::state::ConnectionState;
use crate::engine::{ProtocolEngine, ReconnectConfig, RumqttEngine};
use crate::error::{BridgeError, BridgeResult, ErrorCode};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Handle to a session bridge
#[derive(Clone)]
pub struct MqttBridge {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<BridgeStatus>,
}

impl MqttBridge {
    /// Start a bridge over the given engine. Must be called within a tokio runtime.
    pub fn new(engine: impl ProtocolEngine + 'static) -> Self {
        Self::with_engine(Arc::new(engine))
    }

    pub fn with_engine(engine: Arc<dyn ProtocolEngine>) -> Self {
        let (commands, status) = Dispatcher::spawn(engine);
        Self { commands, status }
    }

    /// Start a bridge backed by rumqttc
    pub fn with_rumqtt(request_capacity: usize, reconnect_config: ReconnectConfig) -> Self {
        Self::new(RumqttEngine::new(request_capacity, reconnect_config))
    }

    /// Connect to `endpoint`. Empty username and password mean no credentials.
    pub async fn connect(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> BridgeResult<String> {
        let endpoint = endpoint.to_string();
        let username = username.to_string();
        let password = password.to_string();
        self.request(ErrorCode::Connect, |reply| Command::Connect {
            endpoint,
            username,
            password,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> BridgeResult<String> {
        self.request(ErrorCode::Disconnect, |reply| Command::Disconnect { reply })
            .await
    }

    pub async fn subscribe(&self, topic: &str, qos: u8) -> BridgeResult<String> {
        let topic = topic.to_string();
        self.request(ErrorCode::Subscribe, |reply| Command::Subscribe {
            topic,
            qos,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> BridgeResult<String> {
        let topic = topic.to_string();
        self.request(ErrorCode::Unsubscribe, |reply| Command::Unsubscribe {
            topic,
            reply,
        })
        .await
    }

    /// Publish a non-retained message
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: u8,
    ) -> BridgeResult<String> {
        let topic = topic.to_string();
        let payload = payload.into();
        self.request(ErrorCode::Publish, |reply| Command::Publish {
            topic,
            payload,
            qos,
            reply,
        })
        .await
    }

    /// Register one observer and increment the listener count
    ///
    /// `None` observes every channel. After shutdown the returned listener never
    /// yields an event.
    pub async fn add_listener(&self, filter: Option<EventName>) -> Listener {
        let (reply, rx) = oneshot::channel();
        let receiver = match self.commands.send(Command::AddListener { filter, reply }) {
            Ok(()) => rx
                .await
                .unwrap_or_else(|_| EventReceiver::closed(filter)),
            Err(_) => EventReceiver::closed(filter),
        };
        Listener {
            receiver,
            bridge: self.clone(),
        }
    }

    /// Decrement the listener count by `count`, clamped at zero
    ///
    /// Returns the remaining count.
    pub async fn remove_listeners(&self, count: usize) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::RemoveListeners { count, reply })
            .is_err()
        {
            return self.listener_count();
        }
        rx.await.unwrap_or_else(|_| self.listener_count())
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn listener_count(&self) -> usize {
        self.status.borrow().listener_count
    }

    /// Status updates, for callers that need to wait on a transition
    pub fn watch_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// Wait until the bridge reaches `state`, or the bridge is gone
    pub async fn wait_for_state(&self, state: ConnectionState) -> bool {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| s.state == state).await.is_ok();
        reached
    }

    /// Release the session and stop the dispatcher
    ///
    /// Requests issued afterwards fail with "Bridge is shut down". Requests still
    /// waiting on the engine fail the same way.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn request<F>(&self, code: ErrorCode, build: F) -> BridgeResult<String>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(build(reply)).is_err() {
            return Err(BridgeError::bridge_closed(code));
        }
        rx.await
            .unwrap_or_else(|_| Err(BridgeError::bridge_closed(code)))
    }
}

/// One registered observer
pub struct Listener {
    receiver: EventReceiver,
    bridge: MqttBridge,
}

impl Listener {
    pub fn filter(&self) -> Option<EventName> {
        self.receiver.filter()
    }

    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.receiver.try_recv()
    }

    /// Unregister this observer, decrementing the listener count by one
    pub async fn remove(self) -> usize {
        self.bridge.remove_listeners(1).await
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("filter", &self.receiver.filter())
            .finish()
    }
}
