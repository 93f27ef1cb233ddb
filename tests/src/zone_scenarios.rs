//! Shared-memory zone creation (spec §4.J): an initiator and a responder,
//! each with their own [`ZoneManager`], round-trip `ZONE_CREATE_REQ`/
//! `ZONE_CREATE_ACK` and converge on the same RDMA-vs-chunked access plan.

use core::sync::atomic::{AtomicU64, Ordering};

use wki_abi::payload::ZoneCreateStatus;
use wki_abi::{NodeId, WkiResult};
use wki_lib::collab::PhysAllocator;
use wki_transport::Transport;
use wki_zones::{CreatePoll, ZoneAccessPlan, ZoneManager};

struct FakePhys {
    next_addr: AtomicU64,
}

impl PhysAllocator for FakePhys {
    fn alloc_pages(&self, count: usize) -> Option<u64> {
        Some(self.next_addr.fetch_add((count * 4096) as u64, Ordering::SeqCst))
    }
    fn free_pages(&self, _phys_addr: u64, _count: usize) {}
    fn phys_to_virt(&self, phys_addr: u64) -> *mut u8 {
        phys_addr as *mut u8
    }
}

struct FakeTransport {
    rdma: bool,
}

impl Transport for FakeTransport {
    fn mtu(&self) -> usize {
        1400
    }
    fn rdma_capable(&self) -> bool {
        self.rdma
    }
    fn tx(&self, _neighbor_mac: [u8; 6], _frame: &[u8]) -> WkiResult<()> {
        Ok(())
    }
    fn tx_broadcast(&self, _frame: &[u8]) -> WkiResult<()> {
        Ok(())
    }
    fn set_rx_handler(&self, _handler: fn(&[u8])) {}
    fn register_region(&self, _phys: u64, _size: usize) -> Option<u32> {
        self.rdma.then_some(0xBEEF)
    }
}

#[test]
fn rdma_capable_round_trip_converges_on_direct_access() {
    let initiator = ZoneManager::new(NodeId(1));
    let responder = ZoneManager::new(NodeId(2));
    let phys_a = FakePhys { next_addr: AtomicU64::new(0x1000) };
    let phys_b = FakePhys { next_addr: AtomicU64::new(0x5000) };
    let transport_a = FakeTransport { rdma: true };
    let transport_b = FakeTransport { rdma: true };

    let req = initiator.begin_create(NodeId(2), 3, 8192, 0, 0, 0).expect("aligned size accepted locally");
    let ack = responder.handle_create_req(NodeId(1), &req, &transport_b, &phys_b);
    assert_eq!(ack.status, ZoneCreateStatus::Accepted as u8);
    assert_ne!(ack.rkey, 0);

    let poll = initiator.on_create_ack(NodeId(2), &ack, &transport_a, &phys_a);
    assert!(matches!(poll, CreatePoll::Active { is_rdma: true, .. }));

    assert_eq!(initiator.access_plan(NodeId(2), 3), Some(ZoneAccessPlan::Direct));
    assert_eq!(responder.access_plan(NodeId(1), 3), Some(ZoneAccessPlan::Direct));
}

#[test]
fn falls_back_to_chunked_access_without_rdma_transport() {
    let initiator = ZoneManager::new(NodeId(1));
    let responder = ZoneManager::new(NodeId(2));
    let phys_a = FakePhys { next_addr: AtomicU64::new(0x1000) };
    let phys_b = FakePhys { next_addr: AtomicU64::new(0x5000) };
    let transport_a = FakeTransport { rdma: false };
    let transport_b = FakeTransport { rdma: false };

    let req = initiator.begin_create(NodeId(2), 4, 4096, 0, 0, 0).unwrap();
    let ack = responder.handle_create_req(NodeId(1), &req, &transport_b, &phys_b);
    assert_eq!(ack.rkey, 0);

    let poll = initiator.on_create_ack(NodeId(2), &ack, &transport_a, &phys_a);
    assert!(matches!(poll, CreatePoll::Active { is_rdma: false, .. }));
    assert_eq!(initiator.access_plan(NodeId(2), 4), Some(ZoneAccessPlan::Chunked));
}

#[test]
fn duplicate_zone_id_from_same_peer_is_rejected() {
    let responder = ZoneManager::new(NodeId(2));
    let phys = FakePhys { next_addr: AtomicU64::new(0x1000) };
    let transport = FakeTransport { rdma: false };
    let req = wki_abi::payload::ZoneCreateReqPayload { zone_id: 9, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };

    let first = responder.handle_create_req(NodeId(1), &req, &transport, &phys);
    assert_eq!(first.status, ZoneCreateStatus::Accepted as u8);

    let second = responder.handle_create_req(NodeId(1), &req, &transport, &phys);
    assert_eq!(second.status, ZoneCreateStatus::RejectedPolicy as u8);
}
