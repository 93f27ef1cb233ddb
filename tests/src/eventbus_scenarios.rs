//! Reliable event delivery (spec §4.I): a reliable subscriber that never
//! acks gets retransmitted on the next [`EventBus::tick`], and fencing the
//! subscriber's node drops it from the retry queue.

use wki_abi::payload::EventSubscribePayload;
use wki_abi::NodeId;
use wki_eventbus::{DeliveryMode, EventBus};

const EVENT_CLASS: u16 = 10;
const EVENT_ID: u16 = 1;

#[test]
fn reliable_subscriber_is_retransmitted_until_acked() {
    let origin = NodeId(1);
    let subscriber = NodeId(2);
    let bus = EventBus::new(origin);

    bus.on_subscribe(subscriber, &EventSubscribePayload { event_class: EVENT_CLASS, event_id: EVENT_ID, delivery_mode: DeliveryMode::Reliable as u8 });

    let targets = bus.publish(EVENT_CLASS, EVENT_ID, b"payload", 0);
    assert_eq!(targets, std::vec![(subscriber, DeliveryMode::Reliable)]);

    // Too soon: nothing due yet.
    assert!(bus.tick(1).is_empty());

    // Past the retry interval with no ack: the entry comes back for resend.
    let due = bus.tick(60_000_000_000);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].subscriber, subscriber);
    assert_eq!(due[0].origin, origin);
    assert_eq!(due[0].data, b"payload");

    // Ack arrives: no further retransmits even past the interval again.
    bus.on_ack(subscriber, EVENT_CLASS, EVENT_ID, origin);
    assert!(bus.tick(120_000_000_000).is_empty());
}

#[test]
fn fencing_the_subscriber_drops_its_pending_retransmits() {
    let origin = NodeId(1);
    let subscriber = NodeId(2);
    let bus = EventBus::new(origin);

    bus.on_subscribe(subscriber, &EventSubscribePayload { event_class: EVENT_CLASS, event_id: EVENT_ID, delivery_mode: DeliveryMode::Reliable as u8 });
    bus.publish(EVENT_CLASS, EVENT_ID, b"payload", 0);

    bus.fence_peer(subscriber);
    assert!(bus.tick(60_000_000_000).is_empty());
}

#[test]
fn best_effort_subscriber_is_never_queued_for_retry() {
    let origin = NodeId(1);
    let subscriber = NodeId(2);
    let bus = EventBus::new(origin);

    bus.on_subscribe(subscriber, &EventSubscribePayload { event_class: EVENT_CLASS, event_id: EVENT_ID, delivery_mode: DeliveryMode::BestEffort as u8 });
    let targets = bus.publish(EVENT_CLASS, EVENT_ID, b"payload", 0);
    assert_eq!(targets, std::vec![(subscriber, DeliveryMode::BestEffort)]);

    assert!(bus.tick(60_000_000_000).is_empty());
}
