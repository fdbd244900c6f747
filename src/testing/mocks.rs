//! Mock implementations for testing
//!
//! Provides a scripted in-memory [`ProtocolEngine`] so the bridge can be exercised
//! without a broker. Tests can fail or hold any connect or session operation, inspect
//! what the bridge asked for, and fire engine notifications by hand.

use crate::engine::{
    ConnectOptions, EngineNotifier, EngineSession, OutgoingMessage, ProtocolEngine, QoS,
};
use crate::error::EngineError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

type Outcome = Result<(), EngineError>;

/// Releases a held operation with the chosen outcome
#[derive(Debug)]
pub struct Gate {
    tx: oneshot::Sender<Outcome>,
}

impl Gate {
    pub fn succeed(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: EngineError) {
        let _ = self.tx.send(Err(error));
    }
}

#[derive(Debug)]
enum Script {
    Fail(EngineError),
    Hold(oneshot::Receiver<Outcome>),
}

impl Script {
    fn hold() -> (Self, Gate) {
        let (tx, rx) = oneshot::channel();
        (Script::Hold(rx), Gate { tx })
    }

    async fn resolve(script: Option<Script>) -> Outcome {
        match script {
            None => Ok(()),
            Some(Script::Fail(error)) => Err(error),
            // Dropping the gate counts as the engine going away
            Some(Script::Hold(rx)) => rx.await.unwrap_or(Err(EngineError::Closed)),
        }
    }
}

/// Session operation kinds that can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOp {
    Disconnect,
    Subscribe,
    Unsubscribe,
    Publish,
}

/// A call the bridge made on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Disconnect,
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish(OutgoingMessage),
}

/// Mock session handed out by [`MockEngine`]
#[derive(Debug)]
pub struct MockSession {
    id: String,
    calls: Mutex<Vec<SessionCall>>,
    scripts: Mutex<HashMap<SessionOp, VecDeque<Script>>>,
    closed: AtomicBool,
}

impl MockSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().await.clone()
    }

    /// Fail the next `op` with `error`
    pub async fn fail_next(&self, op: SessionOp, error: EngineError) {
        self.push_script(op, Script::Fail(error)).await;
    }

    /// Hold the next `op` open until the returned gate is released
    pub async fn hold_next(&self, op: SessionOp) -> Gate {
        let (script, gate) = Script::hold();
        self.push_script(op, script).await;
        gate
    }

    async fn push_script(&self, op: SessionOp, script: Script) {
        self.scripts
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(script);
    }

    async fn run(&self, op: SessionOp, call: SessionCall) -> Outcome {
        self.calls.lock().await.push(call);
        let script = self
            .scripts
            .lock()
            .await
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        Script::resolve(script).await
    }
}

#[async_trait]
impl EngineSession for MockSession {
    async fn disconnect(&self) -> Result<(), EngineError> {
        self.run(SessionOp::Disconnect, SessionCall::Disconnect).await
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        let call = SessionCall::Subscribe {
            topic: topic.to_string(),
            qos,
        };
        self.run(SessionOp::Subscribe, call).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), EngineError> {
        let call = SessionCall::Unsubscribe {
            topic: topic.to_string(),
        };
        self.run(SessionOp::Unsubscribe, call).await
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), EngineError> {
        self.run(SessionOp::Publish, SessionCall::Publish(message))
            .await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct MockEngineState {
    connects: Mutex<Vec<(ConnectOptions, EngineNotifier)>>,
    connect_scripts: Mutex<VecDeque<Script>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

/// Scripted protocol engine
///
/// Clones share state, so a test can keep one clone while the bridge owns another.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    state: Arc<MockEngineState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_connect(&self, error: EngineError) {
        self.state
            .connect_scripts
            .lock()
            .await
            .push_back(Script::Fail(error));
    }

    /// Hold the next connect open until the returned gate is released
    pub async fn hold_next_connect(&self) -> Gate {
        let (script, gate) = Script::hold();
        self.state.connect_scripts.lock().await.push_back(script);
        gate
    }

    pub async fn connect_count(&self) -> usize {
        self.state.connects.lock().await.len()
    }

    /// Options of every connect call, in order
    pub async fn connect_options(&self) -> Vec<ConnectOptions> {
        self.state
            .connects
            .lock()
            .await
            .iter()
            .map(|(options, _)| options.clone())
            .collect()
    }

    /// Notifier registered by the connect call at `index`
    pub async fn notifier(&self, index: usize) -> Option<EngineNotifier> {
        self.state
            .connects
            .lock()
            .await
            .get(index)
            .map(|(_, notifier)| notifier.clone())
    }

    pub async fn last_notifier(&self) -> Option<EngineNotifier> {
        self.state
            .connects
            .lock()
            .await
            .last()
            .map(|(_, notifier)| notifier.clone())
    }

    /// Session created by the `index`-th successful connect
    pub async fn session(&self, index: usize) -> Option<Arc<MockSession>> {
        self.state.sessions.lock().await.get(index).cloned()
    }

    pub async fn last_session(&self) -> Option<Arc<MockSession>> {
        self.state.sessions.lock().await.last().cloned()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn connect(
        &self,
        options: ConnectOptions,
        notifier: EngineNotifier,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let session_id = notifier.session_id().to_string();
        self.state.connects.lock().await.push((options, notifier));

        let script = self.state.connect_scripts.lock().await.pop_front();
        Script::resolve(script).await?;

        let session = Arc::new(MockSession::new(&session_id));
        self.state.sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }
}
