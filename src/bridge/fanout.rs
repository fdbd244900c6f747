//! Reference-counted event fan-out
//!
//! Observers register one at a time and are counted. Delivery is gated on the count
//! at emission time: with a zero count nothing is delivered, even to observers whose
//! receivers are still open.

use super::events::{BridgeEvent, EventName};
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Observer {
    filter: Option<EventName>,
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl Observer {
    fn wants(&self, name: EventName) -> bool {
        self.filter.map_or(true, |filter| filter == name)
    }
}

/// Receiving end handed to one observer
#[derive(Debug)]
pub struct EventReceiver {
    filter: Option<EventName>,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl EventReceiver {
    /// A receiver that never yields, for registrations made after shutdown
    pub fn closed(filter: Option<EventName>) -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { filter, rx }
    }

    pub fn filter(&self) -> Option<EventName> {
        self.filter
    }

    /// Next event, or `None` once the bridge is gone
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event without waiting
    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }
}

/// Observer registry gated by a listener count
#[derive(Default)]
pub struct EventFanout {
    listener_count: usize,
    observers: Vec<Observer>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for one channel (or all channels with `None`)
    pub fn add_listener(&mut self, filter: Option<EventName>) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(Observer { filter, tx });
        self.listener_count += 1;
        debug!(
            listener_count = self.listener_count,
            channel = filter.map_or("*", |f| f.as_str()),
            "Listener added"
        );
        EventReceiver { filter, rx }
    }

    /// Decrement the count by `count`, clamped at zero. Returns the new count.
    pub fn remove_listeners(&mut self, count: usize) -> usize {
        self.listener_count = self.listener_count.saturating_sub(count);
        debug!(listener_count = self.listener_count, "Listeners removed");
        self.listener_count
    }

    pub fn listener_count(&self) -> usize {
        self.listener_count
    }

    /// Deliver to every interested observer. Returns how many received it.
    pub fn emit(&mut self, event: BridgeEvent) -> usize {
        if self.listener_count == 0 {
            trace!(event = %event.name(), "No listeners, event dropped");
            return 0;
        }

        let name = event.name();
        let mut delivered = 0;
        self.observers.retain(|observer| {
            if observer.tx.is_closed() {
                return false;
            }
            if observer.wants(name) && observer.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
            true
        });
        trace!(event = %name, delivered = delivered, "Event emitted");
        delivered
    }
}
