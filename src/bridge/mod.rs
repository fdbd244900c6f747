//! Session bridge between an application event surface and an MQTT engine
//!
//! - `state`: pure connection state transitions
//! - `events`: event records and channel names
//! - `fanout`: listener-count gated event delivery
//! - `dispatcher`: the single task that serializes requests, completions and notifications
//! - `handle`: the clonable [`MqttBridge`] handle

mod dispatcher;
pub mod events;
pub mod fanout;
mod handle;
pub mod state;

pub use dispatcher::BridgeStatus;
pub use events::{BridgeEvent, ConnectedInfo, EventName};
pub use fanout::{EventFanout, EventReceiver};
pub use handle::{Listener, MqttBridge};
pub use state::{ConnectionEvent, ConnectionState, StateMachine};
