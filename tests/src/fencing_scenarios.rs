//! Peer fencing cascade (spec §4.D.3): fencing a peer in [`PeerRegistry`]
//! must run every registered [`FenceHandler`] in registration order and
//! invalidate that peer's routes and resource ads.

use std::boxed::Box;
use std::sync::atomic::{AtomicU32, Ordering};
use std::vec::Vec;

use wki_abi::payload::FenceReason;
use wki_abi::{NodeId, ResourceType};
use wki_peer::{FenceHandler, PeerRegistry};
use wki_resource::{FLAG_SHAREABLE, ResourceRegistry};
use wki_routing::Router;

struct RecordingHandler {
    order: &'static AtomicU32,
    slot: &'static std::sync::Mutex<Vec<(u32, u16)>>,
    tag: u32,
}

impl FenceHandler for RecordingHandler {
    fn on_peer_fenced(&self, node: NodeId) {
        let seq = self.order.fetch_add(1, Ordering::SeqCst);
        self.slot.lock().unwrap().push((seq, node.0));
        let _ = self.tag;
    }
}

#[test]
fn fence_cascade_runs_handlers_in_registration_order() {
    static ORDER: AtomicU32 = AtomicU32::new(0);
    static CALLS: std::sync::Mutex<Vec<(u32, u16)>> = std::sync::Mutex::new(Vec::new());

    let registry = PeerRegistry::new(NodeId(1));
    let peer = NodeId(2);
    let mac = [2, 0, 0, 0, 0, 0];
    let hello = wki_abi::payload::HelloPayload {
        magic: wki_abi::payload::HELLO_MAGIC,
        protocol_version: 1,
        node_id: peer.0,
        mac_addr: mac,
        capabilities: wki_abi::payload::HelloCaps::empty(),
        heartbeat_interval_ms: 1000,
        max_channels: 256,
        rdma_zone_bitmap: 0,
    };
    registry.on_hello(0, peer, mac, &hello, [1, 0, 0, 0, 0, 0], 1000);

    assert!(registry.register_fence_handler(Box::leak(Box::new(RecordingHandler {
        order: &ORDER,
        slot: &CALLS,
        tag: 1,
    }))));
    assert!(registry.register_fence_handler(Box::leak(Box::new(RecordingHandler {
        order: &ORDER,
        slot: &CALLS,
        tag: 2,
    }))));

    let outcome = registry.fence(peer, FenceReason::HeartbeatTimeout);
    assert!(!outcome.already_fenced);
    assert!(outcome.notify.is_some());

    let calls = CALLS.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], (0, peer.0));
    assert_eq!(calls[1], (1, peer.0));

    // Fencing an already-fenced peer is a no-op, not a second cascade run.
    let again = registry.fence(peer, FenceReason::Manual);
    assert!(again.already_fenced);
    assert_eq!(CALLS.lock().unwrap().len(), 2);
}

#[test]
fn fencing_invalidates_routes_and_resource_ads() {
    let router = Router::new(NodeId(1));
    let resources = ResourceRegistry::new(NodeId(1));
    let peer = NodeId(2);

    resources.on_advert(peer, ResourceType::Block, 7, b"disk0", FLAG_SHAREABLE);
    assert_eq!(resources.local_ads_snapshot().len(), 0);

    router.invalidate(peer);
    let dropped = resources.invalidate_for_peer(peer);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].owner_node, peer);
}
