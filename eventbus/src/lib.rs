//! Publish/subscribe event bus (spec §4.I).
//!
//! Subscriptions are kept per-node: `outgoing` is what we've asked peers
//! for, `incoming` is what peers have asked us for. A publish walks
//! `incoming` for matches, appends to a bounded replay log, and — for
//! `Reliable` subscribers — hands the caller a pending-ack entry to retry
//! on the timer tick. Unlike `peer`/`routing`/`resource`'s tables, the
//! subscription lists and the pending-ack list stay `Vec`-backed: there's
//! no natural fixed-size key space here the way `(node_id, resource_id)`
//! gives the resource cache one.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use wki_abi::payload::EventSubscribePayload;
use wki_abi::NodeId;
use wki_lib::config::{EVENT_LOG_CAPACITY, EVENT_MAX_RETRIES, EVENT_RETRY_INTERVAL_MS};
use wki_lib::IrqMutex;

pub const WILDCARD: u16 = EventSubscribePayload::WILDCARD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    BestEffort,
    Reliable,
}

impl DeliveryMode {
    pub fn from_u8(v: u8) -> Self {
        if v == 1 {
            DeliveryMode::Reliable
        } else {
            DeliveryMode::BestEffort
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    node: NodeId,
    event_class: u16,
    event_id: u16,
    delivery_mode: DeliveryMode,
}

fn matches(class: u16, id: u16, sub_class: u16, sub_id: u16) -> bool {
    (sub_class == WILDCARD || sub_class == class) && (sub_id == WILDCARD || sub_id == id)
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub event_class: u16,
    pub event_id: u16,
    pub origin: NodeId,
    pub data: Vec<u8>,
}

struct PendingAck {
    subscriber: NodeId,
    event_class: u16,
    event_id: u16,
    origin: NodeId,
    data: Vec<u8>,
    sent_ns: u64,
    retries: u32,
}

/// A pending-ack entry due for another send, handed back by [`EventBus::tick`].
pub struct PendingRetransmit {
    pub subscriber: NodeId,
    pub event_class: u16,
    pub event_id: u16,
    pub origin: NodeId,
    pub data: Vec<u8>,
}

pub struct EventBus {
    my_node: NodeId,
    outgoing: IrqMutex<Vec<Subscription>>,
    incoming: IrqMutex<Vec<Subscription>>,
    log: IrqMutex<VecDeque<LogEntry>>,
    pending_acks: IrqMutex<Vec<PendingAck>>,
}

impl EventBus {
    pub fn new(my_node: NodeId) -> Self {
        Self {
            my_node,
            outgoing: IrqMutex::new(Vec::new()),
            incoming: IrqMutex::new(Vec::new()),
            log: IrqMutex::new(VecDeque::new()),
            pending_acks: IrqMutex::new(Vec::new()),
        }
    }

    /// Record that we've asked `peer` for `class`/`id` events, and build
    /// the `EVENT_SUBSCRIBE` payload to send.
    pub fn subscribe(&self, peer: NodeId, event_class: u16, event_id: u16, mode: DeliveryMode) -> EventSubscribePayload {
        let mut subs = self.outgoing.lock();
        if !subs.iter().any(|s| s.node == peer && s.event_class == event_class && s.event_id == event_id) {
            subs.push(Subscription { node: peer, event_class, event_id, delivery_mode: mode });
        }
        EventSubscribePayload {
            event_class,
            event_id,
            delivery_mode: match mode {
                DeliveryMode::BestEffort => 0,
                DeliveryMode::Reliable => 1,
            },
        }
    }

    /// Handle an incoming `EVENT_SUBSCRIBE`: record it, then return every
    /// logged entry matching it, oldest-first, to replay to the new
    /// subscriber.
    pub fn on_subscribe(&self, peer: NodeId, req: &EventSubscribePayload) -> Vec<LogEntry> {
        {
            let mut subs = self.incoming.lock();
            if !subs.iter().any(|s| s.node == peer && s.event_class == req.event_class && s.event_id == req.event_id) {
                subs.push(Subscription {
                    node: peer,
                    event_class: req.event_class,
                    event_id: req.event_id,
                    delivery_mode: DeliveryMode::from_u8(req.delivery_mode),
                });
            }
        }
        self.log
            .lock()
            .iter()
            .filter(|e| matches(e.event_class, e.event_id, req.event_class, req.event_id))
            .cloned()
            .collect()
    }

    /// Publish a local event: log it and return every matching incoming
    /// subscriber this should be sent to (and by which delivery mode).
    /// `Reliable` targets are also registered for retry.
    pub fn publish(&self, event_class: u16, event_id: u16, data: &[u8], now_ns: u64) -> Vec<(NodeId, DeliveryMode)> {
        let origin = self.my_node;
        {
            let mut log = self.log.lock();
            if log.len() >= EVENT_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(LogEntry { event_class, event_id, origin, data: data.to_vec() });
        }

        let targets: Vec<Subscription> = self
            .incoming
            .lock()
            .iter()
            .filter(|s| matches(event_class, event_id, s.event_class, s.event_id))
            .copied()
            .collect();

        let mut pending = self.pending_acks.lock();
        for sub in &targets {
            if sub.delivery_mode == DeliveryMode::Reliable {
                pending.push(PendingAck {
                    subscriber: sub.node,
                    event_class,
                    event_id,
                    origin,
                    data: data.to_vec(),
                    sent_ns: now_ns,
                    retries: 0,
                });
            }
        }

        targets.into_iter().map(|s| (s.node, s.delivery_mode)).collect()
    }

    /// Handle an `EVENT_ACK`: best-effort subscribers never send one, so
    /// any ack here resolves a reliable pending entry.
    pub fn on_ack(&self, subscriber: NodeId, event_class: u16, event_id: u16, origin: NodeId) {
        self.pending_acks
            .lock()
            .retain(|p| !(p.subscriber == subscriber && p.event_class == event_class && p.event_id == event_id && p.origin == origin));
    }

    /// Periodic retry pass: retransmits every pending entry whose retry
    /// interval has elapsed, dropping it silently once [`EVENT_MAX_RETRIES`]
    /// is exceeded (spec: "exceeding the retry limit drops the entry
    /// without any further error surface").
    pub fn tick(&self, now_ns: u64) -> Vec<PendingRetransmit> {
        let mut due = Vec::new();
        let mut pending = self.pending_acks.lock();
        pending.retain_mut(|p| {
            if now_ns.saturating_sub(p.sent_ns) < EVENT_RETRY_INTERVAL_MS * 1_000_000 {
                return true;
            }
            if p.retries >= EVENT_MAX_RETRIES {
                return false;
            }
            p.retries += 1;
            p.sent_ns = now_ns;
            due.push(PendingRetransmit {
                subscriber: p.subscriber,
                event_class: p.event_class,
                event_id: p.event_id,
                origin: p.origin,
                data: p.data.clone(),
            });
            true
        });
        due
    }

    /// Peer fencing: drop every subscription and pending-ack entry
    /// involving `node`, in either direction.
    pub fn fence_peer(&self, node: NodeId) {
        self.outgoing.lock().retain(|s| s.node != node);
        self.incoming.lock().retain(|s| s.node != node);
        self.pending_acks.lock().retain(|p| p.subscriber != node && p.origin != node);
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_matches_wildcard_subscription() {
        let bus = EventBus::new(NodeId(1));
        bus.on_subscribe(NodeId(2), &EventSubscribePayload { event_class: WILDCARD, event_id: WILDCARD, delivery_mode: 0 });
        let targets = bus.publish(5, 9, b"hello", 0);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0], (NodeId(2), DeliveryMode::BestEffort));
    }

    #[test]
    fn replay_sends_matching_log_entries_on_new_subscribe() {
        let bus = EventBus::new(NodeId(1));
        bus.publish(5, 9, b"before-sub", 0);
        bus.publish(5, 10, b"different-id", 0);
        let replay = bus.on_subscribe(NodeId(2), &EventSubscribePayload { event_class: 5, event_id: 9, delivery_mode: 0 });
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].data, b"before-sub");
    }

    #[test]
    fn reliable_publish_is_retried_until_acked() {
        let bus = EventBus::new(NodeId(1));
        bus.on_subscribe(NodeId(2), &EventSubscribePayload { event_class: 5, event_id: 9, delivery_mode: 1 });
        bus.publish(5, 9, b"reliable", 0);

        let due = bus.tick(EVENT_RETRY_INTERVAL_MS * 1_000_000);
        assert_eq!(due.len(), 1);

        bus.on_ack(NodeId(2), 5, 9, NodeId(1));
        let due_after_ack = bus.tick(EVENT_RETRY_INTERVAL_MS * 2_000_000);
        assert!(due_after_ack.is_empty());
    }

    #[test]
    fn reliable_publish_drops_after_max_retries() {
        let bus = EventBus::new(NodeId(1));
        bus.on_subscribe(NodeId(2), &EventSubscribePayload { event_class: 5, event_id: 9, delivery_mode: 1 });
        bus.publish(5, 9, b"reliable", 0);

        let mut now = 0u64;
        for _ in 0..EVENT_MAX_RETRIES {
            now += EVENT_RETRY_INTERVAL_MS * 1_000_000;
            let due = bus.tick(now);
            assert_eq!(due.len(), 1);
        }
        now += EVENT_RETRY_INTERVAL_MS * 1_000_000;
        assert!(bus.tick(now).is_empty());
    }

    #[test]
    fn fencing_drops_subscriptions_and_pending_acks_for_that_peer() {
        let bus = EventBus::new(NodeId(1));
        bus.on_subscribe(NodeId(2), &EventSubscribePayload { event_class: 5, event_id: 9, delivery_mode: 1 });
        bus.publish(5, 9, b"reliable", 0);
        bus.fence_peer(NodeId(2));
        assert!(bus.tick(u64::MAX).is_empty());
        assert!(bus.publish(5, 9, b"after-fence", 0).is_empty());
    }
}
