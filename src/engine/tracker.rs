//! Pure completion bookkeeping and event routing for the rumqttc engine
//!
//! rumqttc accepts requests through a FIFO channel and only reports packet ids once a
//! request has been written (`Outgoing::*`). Requests are therefore queued here in issue
//! order, bound to their packet id when the matching outgoing event shows up, and
//! resolved when the broker acknowledgement for that id arrives.

use super::QoS;
use crate::error::EngineError;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};

/// Request kinds whose completion depends on a broker acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

/// Routing decision for a single rumqttc event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Broker answered the CONNECT packet
    ConnectionAcknowledged { accepted: bool, code: String },
    /// Inbound PUBLISH on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// A queued request was written with this packet id
    RequestWritten { kind: RequestKind, packet_id: u16 },
    /// Broker acknowledged a request
    Acknowledged {
        kind: RequestKind,
        packet_id: u16,
        result: Result<(), EngineError>,
    },
    /// Our DISCONNECT packet went out
    DisconnectSent,
    /// Keep-alive and other protocol chatter
    Infrastructure(String),
}

/// Route rumqttc event to a tracker action (pure routing decision)
pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                accepted: connack.code == ConnectReturnCode::Success,
                code: format!("{:?}", connack.code),
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Packet::SubAck(suback) => {
                let rejected = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(EngineError::Rejected(
                        "Subscription rejected by broker".to_string(),
                    ))
                } else {
                    Ok(())
                };
                EventRoute::Acknowledged {
                    kind: RequestKind::Subscribe,
                    packet_id: suback.pkid,
                    result,
                }
            }
            Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                kind: RequestKind::Unsubscribe,
                packet_id: unsuback.pkid,
                result: Ok(()),
            },
            Packet::PubAck(puback) => EventRoute::Acknowledged {
                kind: RequestKind::Publish,
                packet_id: puback.pkid,
                result: Ok(()),
            },
            Packet::PubComp(pubcomp) => EventRoute::Acknowledged {
                kind: RequestKind::Publish,
                packet_id: pubcomp.pkid,
                result: Ok(()),
            },
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Subscribe(pkid) => EventRoute::RequestWritten {
                kind: RequestKind::Subscribe,
                packet_id: *pkid,
            },
            Outgoing::Unsubscribe(pkid) => EventRoute::RequestWritten {
                kind: RequestKind::Unsubscribe,
                packet_id: *pkid,
            },
            Outgoing::Publish(pkid) => EventRoute::RequestWritten {
                kind: RequestKind::Publish,
                packet_id: *pkid,
            },
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
    }
}

/// Tracks outstanding requests until the broker settles them
///
/// `T` is whatever the caller resolves on completion, usually a oneshot sender.
#[derive(Debug)]
pub struct CompletionTracker<T> {
    subscribes: VecDeque<T>,
    unsubscribes: VecDeque<T>,
    publishes: VecDeque<(T, QoS)>,
    inflight: HashMap<(RequestKind, u16), T>,
    disconnect: Option<T>,
}

impl<T> Default for CompletionTracker<T> {
    fn default() -> Self {
        Self {
            subscribes: VecDeque::new(),
            unsubscribes: VecDeque::new(),
            publishes: VecDeque::new(),
            inflight: HashMap::new(),
            disconnect: None,
        }
    }
}

impl<T> CompletionTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a subscribe or unsubscribe in issue order
    pub fn queue(&mut self, kind: RequestKind, token: T) {
        match kind {
            RequestKind::Subscribe => self.subscribes.push_back(token),
            RequestKind::Unsubscribe => self.unsubscribes.push_back(token),
            RequestKind::Publish => self.publishes.push_back((token, QoS::AtLeastOnce)),
        }
    }

    /// Queue a publish; QoS 0 completes as soon as it is written
    pub fn queue_publish(&mut self, token: T, qos: QoS) {
        self.publishes.push_back((token, qos));
    }

    /// Undo the most recent `queue` when the request never reached the engine
    pub fn withdraw_last(&mut self, kind: RequestKind) -> Option<T> {
        match kind {
            RequestKind::Subscribe => self.subscribes.pop_back(),
            RequestKind::Unsubscribe => self.unsubscribes.pop_back(),
            RequestKind::Publish => self.publishes.pop_back().map(|(token, _)| token),
        }
    }

    /// Bind the oldest queued request of `kind` to the packet id it was written with.
    /// Returns the token when the request is already complete (QoS 0 publish).
    pub fn bind(&mut self, kind: RequestKind, packet_id: u16) -> Option<T> {
        match kind {
            RequestKind::Publish => {
                // rumqttc replays unacknowledged publishes after a reconnect
                if packet_id != 0 && self.inflight.contains_key(&(kind, packet_id)) {
                    return None;
                }
                let (token, qos) = self.publishes.pop_front()?;
                if qos == QoS::AtMostOnce {
                    Some(token)
                } else {
                    self.inflight.insert((kind, packet_id), token);
                    None
                }
            }
            RequestKind::Subscribe => {
                let token = self.subscribes.pop_front()?;
                self.inflight.insert((kind, packet_id), token);
                None
            }
            RequestKind::Unsubscribe => {
                let token = self.unsubscribes.pop_front()?;
                self.inflight.insert((kind, packet_id), token);
                None
            }
        }
    }

    /// Settle the request bound to `packet_id`
    pub fn acknowledge(&mut self, kind: RequestKind, packet_id: u16) -> Option<T> {
        self.inflight.remove(&(kind, packet_id))
    }

    pub fn set_disconnect(&mut self, token: T) -> Option<T> {
        self.disconnect.replace(token)
    }

    pub fn take_disconnect(&mut self) -> Option<T> {
        self.disconnect.take()
    }

    /// Requests that cannot survive a connection loss: written subscribes and
    /// unsubscribes are not replayed by the engine. Written publishes are.
    pub fn fail_on_loss(&mut self) -> Vec<T> {
        let lost: Vec<(RequestKind, u16)> = self
            .inflight
            .keys()
            .filter(|(kind, _)| *kind != RequestKind::Publish)
            .copied()
            .collect();
        lost.into_iter()
            .filter_map(|key| self.inflight.remove(&key))
            .collect()
    }

    /// Everything still outstanding, used when the session ends
    pub fn drain(&mut self) -> Vec<T> {
        let mut tokens: Vec<T> = Vec::new();
        tokens.extend(self.subscribes.drain(..));
        tokens.extend(self.unsubscribes.drain(..));
        tokens.extend(self.publishes.drain(..).map(|(token, _)| token));
        tokens.extend(self.inflight.drain().map(|(_, token)| token));
        tokens.extend(self.disconnect.take());
        tokens
    }

    pub fn outstanding(&self) -> usize {
        self.subscribes.len()
            + self.unsubscribes.len()
            + self.publishes.len()
            + self.inflight.len()
            + usize::from(self.disconnect.is_some())
    }
}
