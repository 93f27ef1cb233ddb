//! HELLO exchange and node-id collision resolution (spec §4.D), with two
//! independent [`PeerRegistry`] instances standing in for two booted nodes.

use wki_abi::payload::{HELLO_MAGIC, HelloCaps, HelloPayload};
use wki_abi::NodeId;
use wki_peer::{HelloOutcome, PeerRegistry};

fn hello_from(node: NodeId, mac: [u8; 6]) -> HelloPayload {
    HelloPayload {
        magic: HELLO_MAGIC,
        protocol_version: 1,
        node_id: node.0,
        mac_addr: mac,
        capabilities: HelloCaps::RDMA_SUPPORT.union(HelloCaps::ZONE_SUPPORT),
        heartbeat_interval_ms: 1000,
        max_channels: 256,
        rdma_zone_bitmap: 0,
    }
}

#[test]
fn hello_exchange_connects_both_sides() {
    let node_a = NodeId(1);
    let mac_a = [1, 0, 0, 0, 0, 0];
    let node_b = NodeId(2);
    let mac_b = [2, 0, 0, 0, 0, 0];

    let registry_a = PeerRegistry::new(node_a);
    let registry_b = PeerRegistry::new(node_b);

    // A's HELLO arrives at B.
    let outcome = registry_b.on_hello(0, node_a, mac_a, &hello_from(node_a, mac_a), mac_b, 1000);
    assert!(matches!(outcome, HelloOutcome::Accepted { .. }));

    // B's HELLO_ACK (also a HelloPayload) arrives back at A.
    let outcome = registry_a.on_hello(0, node_b, mac_b, &hello_from(node_b, mac_b), mac_a, 1000);
    assert!(matches!(outcome, HelloOutcome::Accepted { .. }));

    let snap_b_at_a = registry_a.snapshot(node_b).expect("B recorded at A");
    let snap_a_at_b = registry_b.snapshot(node_a).expect("A recorded at B");
    assert_eq!(snap_b_at_a.mac, mac_b);
    assert_eq!(snap_a_at_b.mac, mac_a);
}

#[test]
fn node_id_collision_is_resolved_by_mac_comparison() {
    let node = NodeId(5);
    let winner_mac = [0x01, 0, 0, 0, 0, 0];
    let loser_mac = [0x02, 0, 0, 0, 0, 0];

    // Node `node` with `winner_mac` receives its own id echoed back by a
    // peer claiming the same id with a numerically larger MAC: we win.
    let registry = PeerRegistry::new(node);
    let outcome = registry.on_hello(0, node, loser_mac, &hello_from(node, loser_mac), winner_mac, 1000);
    assert!(matches!(outcome, HelloOutcome::TheyLoseCollision));

    // Same setup but the incoming MAC is numerically smaller: we lose and
    // must regenerate.
    let registry = PeerRegistry::new(node);
    let outcome = registry.on_hello(0, node, winner_mac, &hello_from(node, winner_mac), loser_mac, 1000);
    assert!(matches!(outcome, HelloOutcome::WeLoseCollision));
}
