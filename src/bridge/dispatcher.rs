//! Serialized command dispatcher for the session bridge
//!
//! One task owns the connection state, the session handle and the event fan-out.
//! Requests from the public handle, completions of engine calls and engine
//! notifications all arrive on the same command queue and are processed one at a
//! time, so check-then-act sequences never interleave.
//!
//! Engine calls are spawned off the dispatcher. Their completion is posted back as a
//! command tagged with the session id that issued the call, so results from a
//! superseded session cannot touch the current one.
//! Notifications the pending session raises before its connect completion is
//! processed are held and replayed once the session is established.

use super::events::{BridgeEvent, ConnectedInfo, EventName};
use super::fanout::{EventFanout, EventReceiver};
use super::state::{ConnectionEvent, ConnectionState, StateMachine};
use crate::engine::{
    generate_session_id, ConnectOptions, EngineNotification, EngineNotifier, EngineSession,
    NotificationKind, OutgoingMessage, ProtocolEngine, QoS,
};
use crate::error::{BridgeError, BridgeResult, EngineError, ErrorCode};
use crate::{mqtt_span, session_span};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

pub(crate) type Reply = oneshot::Sender<BridgeResult<String>>;

const DISCONNECTED_SUCCESSFULLY: &str = "Disconnected successfully";

/// Snapshot published after every processed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    pub listener_count: usize,
}

/// Topic operation awaiting its engine result
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String },
}

impl Operation {
    fn code(&self) -> ErrorCode {
        match self {
            Operation::Subscribe { .. } => ErrorCode::Subscribe,
            Operation::Unsubscribe { .. } => ErrorCode::Unsubscribe,
            Operation::Publish { .. } => ErrorCode::Publish,
        }
    }
}

pub(crate) enum Command {
    Connect {
        endpoint: String,
        username: String,
        password: String,
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
    Subscribe {
        topic: String,
        qos: u8,
        reply: Reply,
    },
    Unsubscribe {
        topic: String,
        reply: Reply,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        reply: Reply,
    },
    AddListener {
        filter: Option<EventName>,
        reply: oneshot::Sender<EventReceiver>,
    },
    RemoveListeners {
        count: usize,
        reply: oneshot::Sender<usize>,
    },
    ConnectCompleted {
        session_id: String,
        endpoint: String,
        result: Result<Arc<dyn EngineSession>, EngineError>,
        reply: Reply,
    },
    DisconnectCompleted {
        session_id: String,
        result: Result<(), EngineError>,
        reply: Reply,
    },
    OperationCompleted {
        operation: Operation,
        result: Result<(), EngineError>,
        reply: Reply,
    },
    Notification(EngineNotification),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveSession {
    id: String,
    endpoint: String,
    handle: Arc<dyn EngineSession>,
}

pub(crate) struct Dispatcher {
    engine: Arc<dyn ProtocolEngine>,
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<BridgeStatus>,
    state: ConnectionState,
    pending_connect: Option<String>,
    // Notifications raised by the pending session before its connect completion arrives
    early_notifications: Vec<EngineNotification>,
    session: Option<ActiveSession>,
    fanout: EventFanout,
}

impl Dispatcher {
    /// Spawn the dispatcher task and return its command queue
    pub(crate) fn spawn(
        engine: Arc<dyn ProtocolEngine>,
    ) -> (
        mpsc::UnboundedSender<Command>,
        watch::Receiver<BridgeStatus>,
    ) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(BridgeStatus::default());

        let dispatcher = Dispatcher {
            engine,
            commands: commands_tx.downgrade(),
            status: status_tx,
            state: ConnectionState::Disconnected,
            pending_connect: None,
            early_notifications: Vec::new(),
            session: None,
            fanout: EventFanout::new(),
        };
        tokio::spawn(dispatcher.run(commands_rx));

        (commands_tx, status_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Bridge dispatcher started");

        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        self.release_session();
        debug!("Bridge dispatcher stopped");
    }

    /// Process one command. Returns false once the bridge is shut down.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect {
                endpoint,
                username,
                password,
                reply,
            } => self.handle_connect(endpoint, &username, &password, reply),
            Command::Disconnect { reply } => self.handle_disconnect(reply),
            Command::Subscribe { topic, qos, reply } => self.handle_subscribe(topic, qos, reply),
            Command::Unsubscribe { topic, reply } => self.handle_unsubscribe(topic, reply),
            Command::Publish {
                topic,
                payload,
                qos,
                reply,
            } => self.handle_publish(topic, payload, qos, reply),
            Command::AddListener { filter, reply } => {
                let receiver = self.fanout.add_listener(filter);
                self.publish_status();
                let _ = reply.send(receiver);
            }
            Command::RemoveListeners { count, reply } => {
                let remaining = self.fanout.remove_listeners(count);
                self.publish_status();
                let _ = reply.send(remaining);
            }
            Command::ConnectCompleted {
                session_id,
                endpoint,
                result,
                reply,
            } => self.complete_connect(session_id, endpoint, result, reply),
            Command::DisconnectCompleted {
                session_id,
                result,
                reply,
            } => self.complete_disconnect(session_id, result, reply),
            Command::OperationCompleted {
                operation,
                result,
                reply,
            } => self.complete_operation(operation, result, reply),
            Command::Notification(notification) => self.handle_notification(notification),
            Command::Shutdown { reply } => {
                self.release_session();
                self.pending_connect = None;
                self.early_notifications.clear();
                self.transition(ConnectionEvent::ConnectionLost);
                let _ = reply.send(());
                info!("Bridge shut down");
                return false;
            }
        }
        true
    }

    fn handle_connect(&mut self, endpoint: String, username: &str, password: &str, reply: Reply) {
        if !StateMachine::can_connect(self.state) {
            warn!(state = ?self.state, "Connect rejected: session already active");
            let _ = reply.send(Err(BridgeError::already_connected()));
            return;
        }

        let session_id = generate_session_id();
        let _span = mqtt_span!(operation = "connect", session_id = %session_id).entered();

        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(Err(BridgeError::bridge_closed(ErrorCode::Connect)));
            return;
        };

        // A session kept alive through a connection loss is replaced
        self.release_session();

        let options = ConnectOptions::new(&endpoint, &session_id, username, password);
        let notifier = self.notifier(&session_id);
        let engine = Arc::clone(&self.engine);

        self.pending_connect = Some(session_id.clone());
        self.early_notifications.clear();
        self.transition(ConnectionEvent::ConnectRequested);
        info!(endpoint = %endpoint, "Connecting to MQTT broker");

        tokio::spawn(async move {
            let result = engine.connect(options, notifier).await;
            let _ = commands.send(Command::ConnectCompleted {
                session_id,
                endpoint,
                result,
                reply,
            });
        });
    }

    fn complete_connect(
        &mut self,
        session_id: String,
        endpoint: String,
        result: Result<Arc<dyn EngineSession>, EngineError>,
        reply: Reply,
    ) {
        let _span = session_span!(session_id = %session_id).entered();

        if self.pending_connect.as_deref() != Some(session_id.as_str()) {
            debug!("Discarding completion of a superseded connect");
            if let Ok(handle) = &result {
                handle.close();
            }
            let cause = result.err().unwrap_or(EngineError::Closed);
            let _ = reply.send(Err(BridgeError::engine(ErrorCode::Connect, Some(&cause))));
            return;
        }
        self.pending_connect = None;
        let early = std::mem::take(&mut self.early_notifications);

        match result {
            Ok(handle) => {
                self.transition(ConnectionEvent::ConnectSucceeded);
                let message = format!("Connected to {endpoint}");
                self.session = Some(ActiveSession {
                    id: session_id.clone(),
                    endpoint: endpoint.clone(),
                    handle,
                });
                self.emit(BridgeEvent::Connected(ConnectedInfo {
                    message: message.clone(),
                    endpoint,
                    session_id,
                    reconnected: false,
                }));
                for notification in early {
                    self.handle_notification(notification);
                }
                let _ = reply.send(Ok(message));
            }
            Err(e) => {
                self.transition(ConnectionEvent::ConnectFailed);
                if !early.is_empty() {
                    debug!(dropped = early.len(), "Dropping notifications of a failed connect");
                }
                let error = BridgeError::engine(ErrorCode::Connect, Some(&e));
                error!(error = %e, "MQTT connect failed");
                self.emit(BridgeEvent::Error {
                    context: ErrorCode::Connect,
                    message: error.message().to_string(),
                });
                let _ = reply.send(Err(error));
            }
        }
    }

    fn handle_disconnect(&mut self, reply: Reply) {
        let (session_id, handle) = match self.require_session(ErrorCode::Disconnect) {
            Ok(session) => session,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(Err(BridgeError::bridge_closed(ErrorCode::Disconnect)));
            return;
        };

        self.transition(ConnectionEvent::DisconnectRequested);
        info!(session_id = %session_id, "Disconnecting from MQTT broker");

        tokio::spawn(async move {
            let result = handle.disconnect().await;
            let _ = commands.send(Command::DisconnectCompleted {
                session_id,
                result,
                reply,
            });
        });
    }

    fn complete_disconnect(
        &mut self,
        session_id: String,
        result: Result<(), EngineError>,
        reply: Reply,
    ) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|session| session.id == session_id);

        match result {
            Ok(()) => {
                let message = DISCONNECTED_SUCCESSFULLY;
                if current {
                    self.release_session();
                    self.transition(ConnectionEvent::DisconnectSucceeded);
                    self.emit(BridgeEvent::Disconnected {
                        reason: message.to_string(),
                    });
                } else {
                    debug!(session_id = %session_id, "Disconnect completed for a replaced session");
                }
                let _ = reply.send(Ok(message.to_string()));
            }
            Err(e) => {
                let error = BridgeError::engine(ErrorCode::Disconnect, Some(&e));
                warn!(session_id = %session_id, error = %e, "MQTT disconnect failed");
                if current {
                    self.transition(ConnectionEvent::DisconnectFailed);
                    self.emit(BridgeEvent::Error {
                        context: ErrorCode::Disconnect,
                        message: error.message().to_string(),
                    });
                }
                let _ = reply.send(Err(error));
            }
        }
    }

    fn handle_subscribe(&mut self, topic: String, qos: u8, reply: Reply) {
        let (handle, qos, commands) = match self.prepare_operation(ErrorCode::Subscribe, Some(qos)) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let _span = mqtt_span!(operation = "subscribe", topic = %topic).entered();
        debug!(qos = ?qos, "Subscribing");

        tokio::spawn(async move {
            let result = handle.subscribe(&topic, qos).await;
            let _ = commands.send(Command::OperationCompleted {
                operation: Operation::Subscribe { topic },
                result,
                reply,
            });
        });
    }

    fn handle_unsubscribe(&mut self, topic: String, reply: Reply) {
        let (handle, _, commands) = match self.prepare_operation(ErrorCode::Unsubscribe, None) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let _span = mqtt_span!(operation = "unsubscribe", topic = %topic).entered();
        debug!("Unsubscribing");

        tokio::spawn(async move {
            let result = handle.unsubscribe(&topic).await;
            let _ = commands.send(Command::OperationCompleted {
                operation: Operation::Unsubscribe { topic },
                result,
                reply,
            });
        });
    }

    fn handle_publish(&mut self, topic: String, payload: Bytes, qos: u8, reply: Reply) {
        let (handle, qos, commands) = match self.prepare_operation(ErrorCode::Publish, Some(qos)) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let _span = mqtt_span!(operation = "publish", topic = %topic).entered();
        debug!(qos = ?qos, bytes = payload.len(), "Publishing");

        tokio::spawn(async move {
            let message = OutgoingMessage::new(topic.clone(), payload, qos);
            let result = handle.publish(message).await;
            let _ = commands.send(Command::OperationCompleted {
                operation: Operation::Publish { topic },
                result,
                reply,
            });
        });
    }

    fn complete_operation(
        &mut self,
        operation: Operation,
        result: Result<(), EngineError>,
        reply: Reply,
    ) {
        let code = operation.code();
        let outcome = match (result, operation) {
            (Ok(()), Operation::Subscribe { topic }) => {
                let message = format!("Subscribed to {topic}");
                self.emit(BridgeEvent::Subscribed { topic });
                Ok(message)
            }
            (Ok(()), Operation::Unsubscribe { topic }) => {
                let message = format!("Unsubscribed from {topic}");
                self.emit(BridgeEvent::Unsubscribed { topic });
                Ok(message)
            }
            (Ok(()), Operation::Publish { topic }) => Ok(format!("Message published to {topic}")),
            (Err(e), operation) => {
                warn!(operation = ?operation, error = %e, "MQTT operation failed");
                Err(BridgeError::engine(code, Some(&e)))
            }
        };
        let _ = reply.send(outcome);
    }

    fn handle_notification(&mut self, notification: EngineNotification) {
        let _span = session_span!(session_id = %notification.session_id).entered();

        if self.pending_connect.as_deref() == Some(notification.session_id.as_str()) {
            debug!("Holding notification until the connect completes");
            self.early_notifications.push(notification);
            return;
        }

        let Some(session) = self
            .session
            .as_ref()
            .filter(|session| session.id == notification.session_id)
        else {
            debug!(
                session_id = %notification.session_id,
                "Ignoring notification from a stale session"
            );
            return;
        };
        let endpoint = session.endpoint.clone();

        match notification.kind {
            NotificationKind::ConnectionLost { cause } => {
                let reason = cause
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| EngineError::ConnectionLost.to_string());
                warn!(session_id = %notification.session_id, reason = %reason, "MQTT connection lost");
                self.transition(ConnectionEvent::ConnectionLost);
                self.emit(BridgeEvent::Disconnected { reason });
            }
            NotificationKind::Reconnected => {
                if self.state != ConnectionState::Disconnected {
                    trace!(state = ?self.state, "Reconnect notification in non-lost state");
                    return;
                }
                self.transition(ConnectionEvent::Reconnected);
                self.emit(BridgeEvent::Connected(ConnectedInfo {
                    message: format!("Reconnected to {endpoint}"),
                    endpoint,
                    session_id: notification.session_id,
                    reconnected: true,
                }));
            }
            NotificationKind::MessageArrived { topic, payload } => {
                trace!(topic = %topic, bytes = payload.len(), "Message arrived");
                self.emit(BridgeEvent::MessageReceived { topic, payload });
            }
            NotificationKind::DeliveryComplete { packet_id } => {
                trace!(packet_id = packet_id, "Delivery complete");
            }
        }
    }

    /// Check the state precondition, then the QoS level
    fn prepare_operation(
        &self,
        code: ErrorCode,
        qos: Option<u8>,
    ) -> BridgeResult<(Arc<dyn EngineSession>, QoS, mpsc::UnboundedSender<Command>)> {
        let (_, handle) = self.require_session(code)?;
        let qos = match qos {
            Some(value) => {
                QoS::try_from(value).map_err(|value| BridgeError::invalid_qos(code, value))?
            }
            None => QoS::AtMostOnce,
        };
        let commands = self
            .commands
            .upgrade()
            .ok_or_else(|| BridgeError::bridge_closed(code))?;
        Ok((handle, qos, commands))
    }

    fn require_session(
        &self,
        code: ErrorCode,
    ) -> BridgeResult<(String, Arc<dyn EngineSession>)> {
        match &self.session {
            Some(session) if StateMachine::can_operate(self.state) => {
                Ok((session.id.clone(), Arc::clone(&session.handle)))
            }
            _ => {
                debug!(state = ?self.state, code = %code, "Rejected: client is not connected");
                Err(BridgeError::not_connected(code))
            }
        }
    }

    /// Notification handler that posts into this dispatcher's queue
    fn notifier(&self, session_id: &str) -> EngineNotifier {
        let commands = self.commands.clone();
        EngineNotifier::new(session_id, move |notification| {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Notification(notification));
            }
        })
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.id, "Releasing MQTT session");
            session.handle.close();
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = StateMachine::determine_next_state(self.state, event);
        StateMachine::log_state_transition(self.state, next);
        self.state = next;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(BridgeStatus {
            state: self.state,
            listener_count: self.fanout.listener_count(),
        });
    }

    fn emit(&mut self, event: BridgeEvent) {
        self.fanout.emit(event);
    }
}
