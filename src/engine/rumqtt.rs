//! Production protocol engine backed by rumqttc
//!
//! Each session owns an `AsyncClient` for issuing requests and a spawned task that polls
//! the matching `EventLoop`. The poll task settles request completions through the
//! [`CompletionTracker`] and raises notifications through the [`EngineNotifier`].

use super::options::{configure_mqtt_options, configure_network_options, ReconnectConfig};
use super::tracker::{route_event, CompletionTracker, EventRoute, RequestKind};
use super::{ConnectOptions, EngineNotifier, EngineSession, OutgoingMessage, ProtocolEngine, QoS};
use crate::error::EngineError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Completion = oneshot::Sender<Result<(), EngineError>>;
type SharedTracker = Arc<Mutex<CompletionTracker<Completion>>>;

/// Request channel capacity used when none is configured
pub const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// rumqttc-backed [`ProtocolEngine`]
#[derive(Debug, Clone)]
pub struct RumqttEngine {
    request_capacity: usize,
    reconnect_config: ReconnectConfig,
}

impl Default for RumqttEngine {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_CAPACITY, ReconnectConfig::default())
    }
}

impl RumqttEngine {
    pub fn new(request_capacity: usize, reconnect_config: ReconnectConfig) -> Self {
        Self {
            request_capacity: request_capacity.max(1),
            reconnect_config,
        }
    }
}

#[async_trait]
impl ProtocolEngine for RumqttEngine {
    async fn connect(
        &self,
        options: ConnectOptions,
        notifier: EngineNotifier,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let mqtt_options = configure_mqtt_options(&options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, self.request_capacity);
        event_loop.set_network_options(configure_network_options(&options));

        let tracker: SharedTracker = Arc::new(Mutex::new(CompletionTracker::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connack_tx, connack_rx) = oneshot::channel();

        let poller = SessionPoller {
            event_loop,
            tracker: tracker.clone(),
            notifier,
            reconnect_config: self.reconnect_config.clone(),
            automatic_reconnect: options.automatic_reconnect,
            shutdown_rx,
        };
        let handle = tokio::spawn(poller.run(connack_tx));

        let session = RumqttSession {
            client,
            tracker,
            request_order: tokio::sync::Mutex::new(()),
            shutdown_tx,
            poll_handle: Mutex::new(Some(handle)),
        };

        let timeout = options.connect_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(client_id = %options.client_id, endpoint = %options.endpoint, "MQTT session established");
                Ok(Arc::new(session))
            }
            Ok(Ok(Err(e))) => {
                session.close();
                Err(e)
            }
            Ok(Err(_)) => {
                session.close();
                Err(EngineError::Closed)
            }
            Err(_) => {
                warn!(client_id = %options.client_id, "ConnAck timeout - no connection confirmation received");
                session.close();
                Err(EngineError::Timeout(timeout.as_secs()))
            }
        }
    }
}

/// Live rumqttc session
struct RumqttSession {
    client: AsyncClient,
    tracker: SharedTracker,
    // Keeps tracker order identical to the rumqttc request channel order
    request_order: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock(tracker: &SharedTracker) -> MutexGuard<'_, CompletionTracker<Completion>> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn await_completion(rx: oneshot::Receiver<Result<(), EngineError>>) -> Result<(), EngineError> {
    rx.await.unwrap_or(Err(EngineError::Closed))
}

#[async_trait]
impl EngineSession for RumqttSession {
    async fn disconnect(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let _ordered = self.request_order.lock().await;
            if let Some(previous) = lock(&self.tracker).set_disconnect(tx) {
                let _ = previous.send(Err(EngineError::Rejected(
                    "Disconnect superseded".to_string(),
                )));
            }
            if let Err(e) = self.client.disconnect().await {
                lock(&self.tracker).take_disconnect();
                return Err(e.into());
            }
        }
        await_completion(rx).await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let _ordered = self.request_order.lock().await;
            lock(&self.tracker).queue(RequestKind::Subscribe, tx);
            if let Err(e) = self.client.subscribe(topic, qos.into()).await {
                lock(&self.tracker).withdraw_last(RequestKind::Subscribe);
                return Err(e.into());
            }
        }
        debug!(topic = %topic, qos = ?qos, "Subscribe request queued");
        await_completion(rx).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let _ordered = self.request_order.lock().await;
            lock(&self.tracker).queue(RequestKind::Unsubscribe, tx);
            if let Err(e) = self.client.unsubscribe(topic).await {
                lock(&self.tracker).withdraw_last(RequestKind::Unsubscribe);
                return Err(e.into());
            }
        }
        debug!(topic = %topic, "Unsubscribe request queued");
        await_completion(rx).await
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let _ordered = self.request_order.lock().await;
            lock(&self.tracker).queue_publish(tx, message.qos);
            if let Err(e) = self
                .client
                .publish(
                    message.topic.as_str(),
                    message.qos.into(),
                    message.retain,
                    message.payload.to_vec(),
                )
                .await
            {
                lock(&self.tracker).withdraw_last(RequestKind::Publish);
                return Err(e.into());
            }
        }
        await_completion(rx).await
    }

    fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .poll_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        for completion in lock(&self.tracker).drain() {
            let _ = completion.send(Err(EngineError::Closed));
        }
    }
}

/// Owns the event loop for one session
struct SessionPoller {
    event_loop: EventLoop,
    tracker: SharedTracker,
    notifier: EngineNotifier,
    reconnect_config: ReconnectConfig,
    automatic_reconnect: bool,
    shutdown_rx: watch::Receiver<bool>,
}

/// What the poll loop should do after handling one event
enum Flow {
    Continue,
    Stop,
}

impl SessionPoller {
    async fn run(mut self, connack_tx: oneshot::Sender<Result<(), EngineError>>) {
        let session_id = self.notifier.session_id().to_string();
        info!(session_id = %session_id, "Starting MQTT event loop");

        let mut connack_tx = Some(connack_tx);
        let mut online = false;
        let mut reconnect_attempts = 0u32;

        loop {
            let polled = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(session_id = %session_id, "Shutdown signal received, stopping event loop");
                        break;
                    }
                    continue;
                }
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    let route = route_event(&event);
                    if let EventRoute::ConnectionAcknowledged { accepted, code } = &route {
                        if !*accepted {
                            let refused = EngineError::ConnectionRefused(code.clone());
                            if let Some(tx) = connack_tx.take() {
                                let _ = tx.send(Err(refused));
                                break;
                            }
                            continue;
                        }
                        online = true;
                        reconnect_attempts = 0;
                        match connack_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Ok(()));
                            }
                            None => {
                                info!(session_id = %session_id, "Reconnection successful");
                                self.notifier.reconnected();
                            }
                        }
                        continue;
                    }
                    if let Flow::Stop = self.handle_route(route) {
                        break;
                    }
                }
                Err(e) => {
                    if let Some(tx) = connack_tx.take() {
                        error!(session_id = %session_id, error = %e, "MQTT connect failed");
                        let _ = tx.send(Err(map_connection_error(&e)));
                        break;
                    }

                    if online {
                        online = false;
                        warn!(session_id = %session_id, error = %e, "MQTT connection lost");
                        self.fail_requests_on_loss();
                        self.notifier.connection_lost(Some(e.to_string()));
                    } else {
                        debug!(session_id = %session_id, error = %e, "Reconnection attempt failed");
                    }

                    if !self.automatic_reconnect {
                        break;
                    }

                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let delay_ms = self.reconnect_config.calculate_backoff_delay(reconnect_attempts);
                    info!(
                        session_id = %session_id,
                        attempt = reconnect_attempts,
                        delay_ms = delay_ms,
                        "Attempting reconnection"
                    );
                    if !self.interruptible_sleep(delay_ms).await {
                        break;
                    }
                }
            }
        }

        for completion in lock(&self.tracker).drain() {
            let _ = completion.send(Err(EngineError::Closed));
        }
        info!(session_id = %session_id, "MQTT event loop stopped");
    }

    fn handle_route(&mut self, route: EventRoute) -> Flow {
        match route {
            EventRoute::MessageReceived { topic, payload } => {
                debug!(topic = %topic, payload_size = payload.len(), "Received MQTT message");
                self.notifier.message_arrived(topic, payload);
            }
            EventRoute::RequestWritten { kind, packet_id } => {
                if let Some(completion) = lock(&self.tracker).bind(kind, packet_id) {
                    let _ = completion.send(Ok(()));
                }
            }
            EventRoute::Acknowledged {
                kind,
                packet_id,
                result,
            } => {
                if let Some(completion) = lock(&self.tracker).acknowledge(kind, packet_id) {
                    let _ = completion.send(result);
                }
                if kind == RequestKind::Publish {
                    self.notifier.delivery_complete(packet_id);
                }
            }
            EventRoute::DisconnectSent => {
                if let Some(completion) = lock(&self.tracker).take_disconnect() {
                    let _ = completion.send(Ok(()));
                }
                return Flow::Stop;
            }
            EventRoute::Infrastructure(event) => {
                tracing::trace!(target: "mqtt_engine", "MQTT event: {}", event);
            }
            EventRoute::ConnectionAcknowledged { .. } => {}
        }
        Flow::Continue
    }

    fn fail_requests_on_loss(&self) {
        for completion in lock(&self.tracker).fail_on_loss() {
            let _ = completion.send(Err(EngineError::ConnectionLost));
        }
    }

    /// Returns false when shutdown was requested during the delay
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => changed.is_ok() && !*self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

fn map_connection_error(error: &ConnectionError) -> EngineError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            EngineError::ConnectionRefused(format!("{code:?}"))
        }
        other => EngineError::Network(other.to_string()),
    }
}
