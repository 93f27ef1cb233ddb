//! Shared-memory zones (spec §4.J).
//!
//! A zone is negotiated by one side (the initiator, who calls
//! [`ZoneManager::begin_create`]) and granted by the other (the responder,
//! who calls [`ZoneManager::handle_create_req`]). Both sides record the
//! same `(peer, zone_id)` -> backing-memory mapping; which one allocates
//! first differs, but the fallback cascade is identical.
//!
//! The three-way cascade spec.md names — "ivshmem RDMA pool → RoCE-
//! registered local pages → plain local pages" — collapses to two branches
//! against the collaborator surface actually available here:
//! [`wki_transport::Transport::rdma_capable`]/`register_region` already
//! covers both the ivshmem-direct and RoCE-registration cases (neither
//! distinguishes a dedicated ivshmem pool from general NIC RDMA
//! registration), so a zone is either RDMA-backed (`is_rdma`) or plain
//! message-based.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::payload::{
    ZoneCreateAckPayload, ZoneCreateReqPayload, ZoneCreateStatus, ZoneDestroyPayload, ZoneNotifyPayload,
};
use wki_abi::{NodeId, WkiError, WkiResult};
use wki_lib::collab::PhysAllocator;
use wki_lib::config::{MAX_ZONES, ZONE_CHUNK_MAX, ZONE_OP_TIMEOUT_MS, ZONE_PAGE_SIZE};
use wki_lib::IrqMutex;
use wki_transport::Transport;

/// `access_policy` bit: the responder accepts `ZONE_WRITE_REQ` from the
/// peer. Absent, a remote write is rejected with `AccessDenied`.
pub const ACCESS_REMOTE_WRITE: u8 = 0x01;
/// `notify_mode` bit: deliver `ZONE_NOTIFY` before a remote access.
pub const NOTIFY_PRE: u8 = 0x01;
/// `notify_mode` bit: deliver `ZONE_NOTIFY` after a remote access.
pub const NOTIFY_POST: u8 = 0x02;
/// Distinguished `ZoneNotifyPayload::op_type` the initiator sends a RoCE
/// responder to hand over its own rkey (spec §4.J).
pub const OP_TYPE_ROCE_RKEY_POST: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZonePhase {
    Negotiating { started_ns: u64 },
    Active { phys_addr: u64, rkey: u32, is_rdma: bool },
}

#[derive(Debug, Clone, Copy)]
struct Zone {
    peer: NodeId,
    size: u32,
    access_policy: u8,
    notify_mode: u8,
    initiator: bool,
    peer_rkey: u32,
    phase: ZonePhase,
}

/// Backing-memory details a caller needs to free a zone's pages and
/// deregister its RDMA region, if any.
#[derive(Debug, Clone, Copy)]
pub struct ZoneTeardown {
    pub zone_id: u32,
    pub peer: NodeId,
    pub phys_addr: u64,
    pub size: u32,
    pub is_rdma: bool,
}

/// Progress of an in-flight `begin_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePoll {
    Negotiating,
    Active { phys_addr: u64, is_rdma: bool },
    TimedOut,
    Rejected(ZoneCreateStatus),
}

/// How to serve a local `read`/`write` once a zone is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneAccessPlan {
    /// Use [`ZoneManager::get_ptr`] directly; no message round trip.
    Direct,
    /// Chunk the access into `ZONE_READ_REQ`/`ZONE_WRITE_REQ` messages of
    /// at most `ZONE_CHUNK_MAX` bytes each.
    Chunked,
}

pub struct ZoneManager {
    my_node: NodeId,
    zones: [IrqMutex<Option<(u32, Zone)>>; MAX_ZONES],
    table_lock: IrqMutex<()>,
}

impl ZoneManager {
    pub fn new(my_node: NodeId) -> Self {
        Self {
            my_node,
            zones: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, peer: NodeId, zone_id: u32) -> Option<usize> {
        self.zones
            .iter()
            .position(|slot| slot.lock().as_ref().is_some_and(|(id, z)| *id == zone_id && z.peer == peer))
    }

    fn allocate_backing(&self, size: u32, transport: &dyn Transport, phys: &dyn PhysAllocator) -> Option<(u64, u32, bool)> {
        let pages = (size as usize).div_ceil(ZONE_PAGE_SIZE as usize);
        let phys_addr = phys.alloc_pages(pages)?;
        if transport.rdma_capable() {
            if let Some(rkey) = transport.register_region(phys_addr, size as usize) {
                return Some((phys_addr, rkey, true));
            }
        }
        Some((phys_addr, 0, false))
    }

    /// Initiator side: validate locally and reserve a negotiating slot,
    /// returning the `ZONE_CREATE_REQ` to send. `None` if `size` isn't
    /// page-aligned, `zone_id` is already in use locally, or the table is
    /// full.
    pub fn begin_create(&self, peer: NodeId, zone_id: u32, size: u32, access_policy: u8, notify_mode: u8, now_ns: u64) -> Option<ZoneCreateReqPayload> {
        if size % ZONE_PAGE_SIZE != 0 || size == 0 {
            return None;
        }
        let _guard = self.table_lock.lock();
        if self.find_index(peer, zone_id).is_some() {
            return None;
        }
        for slot in &self.zones {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some((
                    zone_id,
                    Zone {
                        peer,
                        size,
                        access_policy,
                        notify_mode,
                        initiator: true,
                        peer_rkey: 0,
                        phase: ZonePhase::Negotiating { started_ns: now_ns },
                    },
                ));
                return Some(ZoneCreateReqPayload { zone_id, size, access_policy, notify_mode, zone_type_hint: 0 });
            }
        }
        None
    }

    /// Responder side: validate, allocate backing via the fallback
    /// cascade, record the zone as `Active`, and build the
    /// `ZONE_CREATE_ACK` to send back.
    pub fn handle_create_req(&self, peer: NodeId, req: &ZoneCreateReqPayload, transport: &dyn Transport, phys: &dyn PhysAllocator) -> ZoneCreateAckPayload {
        if req.size % ZONE_PAGE_SIZE != 0 || req.size == 0 {
            return ZoneCreateAckPayload { zone_id: req.zone_id, status: ZoneCreateStatus::RejectedPolicy as u8, phys_addr: 0, rkey: 0 };
        }
        let _guard = self.table_lock.lock();
        if self.find_index(peer, req.zone_id).is_some() {
            return ZoneCreateAckPayload { zone_id: req.zone_id, status: ZoneCreateStatus::RejectedPolicy as u8, phys_addr: 0, rkey: 0 };
        }

        let Some((phys_addr, rkey, is_rdma)) = self.allocate_backing(req.size, transport, phys) else {
            return ZoneCreateAckPayload { zone_id: req.zone_id, status: ZoneCreateStatus::RejectedNoMem as u8, phys_addr: 0, rkey: 0 };
        };

        for slot in &self.zones {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some((
                    req.zone_id,
                    Zone {
                        peer,
                        size: req.size,
                        access_policy: req.access_policy,
                        notify_mode: req.notify_mode,
                        initiator: false,
                        peer_rkey: 0,
                        phase: ZonePhase::Active { phys_addr, rkey, is_rdma },
                    },
                ));
                return ZoneCreateAckPayload { zone_id: req.zone_id, status: ZoneCreateStatus::Accepted as u8, phys_addr, rkey };
            }
        }
        phys.free_pages(phys_addr, (req.size as usize).div_ceil(ZONE_PAGE_SIZE as usize));
        ZoneCreateAckPayload { zone_id: req.zone_id, status: ZoneCreateStatus::RejectedNoMem as u8, phys_addr: 0, rkey: 0 }
    }

    /// Initiator side: apply a `ZONE_CREATE_ACK`, mirroring the
    /// responder's RDMA-or-plain choice (`rkey != 0` means the responder
    /// went RDMA; this side allocates/registers the same way). On a local
    /// allocation failure after an `Accepted` ack, falls back to a plain
    /// (message-based) zone rather than failing the whole create, per
    /// spec.md's "falls back to message-based on failure".
    pub fn on_create_ack(&self, peer: NodeId, ack: &ZoneCreateAckPayload, transport: &dyn Transport, phys: &dyn PhysAllocator) -> CreatePoll {
        let Some(idx) = self.find_index(peer, ack.zone_id) else {
            return CreatePoll::Rejected(ZoneCreateStatus::RejectedPolicy);
        };
        if ack.status != ZoneCreateStatus::Accepted as u8 {
            *self.zones[idx].lock() = None;
            return CreatePoll::Rejected(status_from_u8(ack.status));
        }

        let size = {
            let guard = self.zones[idx].lock();
            guard.as_ref().map(|(_, z)| z.size).unwrap_or(0)
        };
        let responder_wants_rdma = ack.rkey != 0;

        let (phys_addr, is_rdma) = if responder_wants_rdma {
            match self.allocate_backing(size, transport, phys) {
                Some((addr, _rkey, true)) => (addr, true),
                Some((addr, _, false)) => (addr, false),
                None => (0, false),
            }
        } else {
            match phys.alloc_pages((size as usize).div_ceil(ZONE_PAGE_SIZE as usize)) {
                Some(addr) => (addr, false),
                None => (0, false),
            }
        };

        let mut guard = self.zones[idx].lock();
        if let Some((_, z)) = guard.as_mut() {
            z.phase = ZonePhase::Active { phys_addr, rkey: ack.rkey, is_rdma };
        }
        CreatePoll::Active { phys_addr, is_rdma }
    }

    pub fn poll_create(&self, peer: NodeId, zone_id: u32, now_ns: u64) -> CreatePoll {
        let Some(idx) = self.find_index(peer, zone_id) else {
            return CreatePoll::Rejected(ZoneCreateStatus::RejectedPolicy);
        };
        let mut guard = self.zones[idx].lock();
        match guard.as_ref().map(|(_, z)| z.phase) {
            Some(ZonePhase::Active { phys_addr, is_rdma, .. }) => CreatePoll::Active { phys_addr, is_rdma },
            Some(ZonePhase::Negotiating { started_ns }) => {
                if now_ns.saturating_sub(started_ns) >= ZONE_OP_TIMEOUT_MS * 1_000_000 {
                    *guard = None;
                    CreatePoll::TimedOut
                } else {
                    CreatePoll::Negotiating
                }
            }
            None => CreatePoll::Rejected(ZoneCreateStatus::RejectedPolicy),
        }
    }

    /// Local-access pointer for an active zone. Not policed by this
    /// crate — spec.md: "local accesses via `get_ptr` are not policed by
    /// the core."
    pub fn get_ptr(&self, peer: NodeId, zone_id: u32, phys: &dyn PhysAllocator) -> Option<*mut u8> {
        let idx = self.find_index(peer, zone_id)?;
        match self.zones[idx].lock().as_ref()?.1.phase {
            ZonePhase::Active { phys_addr, .. } => Some(phys.phys_to_virt(phys_addr)),
            ZonePhase::Negotiating { .. } => None,
        }
    }

    pub fn access_plan(&self, peer: NodeId, zone_id: u32) -> Option<ZoneAccessPlan> {
        let idx = self.find_index(peer, zone_id)?;
        match self.zones[idx].lock().as_ref()?.1.phase {
            ZonePhase::Active { is_rdma, .. } => Some(if is_rdma { ZoneAccessPlan::Direct } else { ZoneAccessPlan::Chunked }),
            ZonePhase::Negotiating { .. } => None,
        }
    }

    /// Splits a chunked access into `(offset, len)` pairs no larger than
    /// `ZONE_CHUNK_MAX`.
    pub fn chunk_range(offset: u32, len: u32) -> Vec<(u32, u32)> {
        let mut chunks = Vec::new();
        let mut remaining = len;
        let mut pos = offset;
        while remaining > 0 {
            let n = remaining.min(ZONE_CHUNK_MAX as u32);
            chunks.push((pos, n));
            pos += n;
            remaining -= n;
        }
        chunks
    }

    /// Responder side: serve a `ZONE_READ_REQ`. No access-policy check —
    /// spec.md only restricts remote writes.
    pub fn handle_read(&self, peer: NodeId, zone_id: u32, offset: u32, len: u32, phys: &dyn PhysAllocator, out: &mut [u8]) -> WkiResult<usize> {
        let idx = self.find_index(peer, zone_id).ok_or(WkiError::ZoneNotFound)?;
        let phys_addr = match self.zones[idx].lock().as_ref().ok_or(WkiError::ZoneNotFound)?.1.phase {
            ZonePhase::Active { phys_addr, .. } => phys_addr,
            ZonePhase::Negotiating { .. } => return Err(WkiError::ZoneInactive),
        };
        let n = (len as usize).min(out.len());
        let base = phys.phys_to_virt(phys_addr + offset as u64);
        unsafe {
            core::ptr::copy_nonoverlapping(base, out.as_mut_ptr(), n);
        }
        Ok(n)
    }

    /// Responder side: serve a `ZONE_WRITE_REQ`, enforcing
    /// `ACCESS_REMOTE_WRITE`.
    pub fn handle_write(&self, peer: NodeId, zone_id: u32, offset: u32, data: &[u8], phys: &dyn PhysAllocator) -> WkiResult<()> {
        let idx = self.find_index(peer, zone_id).ok_or(WkiError::ZoneNotFound)?;
        let guard = self.zones[idx].lock();
        let zone = &guard.as_ref().ok_or(WkiError::ZoneNotFound)?.1;
        if zone.access_policy & ACCESS_REMOTE_WRITE == 0 {
            return Err(WkiError::ZoneAccessDenied);
        }
        let phys_addr = match zone.phase {
            ZonePhase::Active { phys_addr, .. } => phys_addr,
            ZonePhase::Negotiating { .. } => return Err(WkiError::ZoneInactive),
        };
        let base = phys.phys_to_virt(phys_addr + offset as u64);
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), base, data.len());
        }
        Ok(())
    }

    /// Record the initiator's rkey post from a RoCE
    /// `ZONE_NOTIFY{op_type: OP_TYPE_ROCE_RKEY_POST}`, rather than
    /// delivering it to the registered notify handler.
    pub fn on_notify(&self, peer: NodeId, notify: &ZoneNotifyPayload) -> Option<ZoneNotifyPayload> {
        let idx = self.find_index(peer, notify.zone_id)?;
        if notify.op_type == OP_TYPE_ROCE_RKEY_POST {
            if let Some((_, z)) = self.zones[idx].lock().as_mut() {
                z.peer_rkey = notify.offset;
            }
            return None;
        }
        Some(*notify)
    }

    pub fn build_roce_rkey_post(zone_id: u32, my_rkey: u32) -> ZoneNotifyPayload {
        ZoneNotifyPayload { zone_id, offset: my_rkey, length: 0, op_type: OP_TYPE_ROCE_RKEY_POST }
    }

    pub fn notify_mode(&self, peer: NodeId, zone_id: u32) -> Option<u8> {
        let idx = self.find_index(peer, zone_id)?;
        Some(self.zones[idx].lock().as_ref()?.1.notify_mode)
    }

    /// Tear down a zone locally, returning the backing details to free.
    pub fn destroy(&self, peer: NodeId, zone_id: u32) -> Option<ZoneTeardown> {
        let idx = self.find_index(peer, zone_id)?;
        let (_, zone) = self.zones[idx].lock().take()?;
        match zone.phase {
            ZonePhase::Active { phys_addr, is_rdma, .. } => Some(ZoneTeardown { zone_id, peer, phys_addr, size: zone.size, is_rdma }),
            ZonePhase::Negotiating { .. } => None,
        }
    }

    pub fn destroy_payload(zone_id: u32) -> ZoneDestroyPayload {
        ZoneDestroyPayload { zone_id }
    }

    /// Fencing cascade step: every zone sharing the fenced peer is torn
    /// down (spec.md: "Peer fencing destroys every zone sharing that
    /// peer").
    pub fn destroy_all_for_peer(&self, node: NodeId) -> Vec<ZoneTeardown> {
        let mut torn_down = Vec::new();
        for slot in &self.zones {
            let taken = {
                let mut guard = slot.lock();
                if guard.is_some_and(|(_, z)| z.peer == node) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some((zone_id, zone)) = taken {
                if let ZonePhase::Active { phys_addr, is_rdma, .. } = zone.phase {
                    torn_down.push(ZoneTeardown { zone_id, peer: node, phys_addr, size: zone.size, is_rdma });
                }
            }
        }
        torn_down
    }
}

fn status_from_u8(v: u8) -> ZoneCreateStatus {
    match v {
        1 => ZoneCreateStatus::RejectedNoMem,
        2 => ZoneCreateStatus::RejectedPolicy,
        _ => ZoneCreateStatus::Accepted,
    }
}

impl core::fmt::Debug for Zone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Zone")
            .field("peer", &self.peer)
            .field("size", &self.size)
            .field("initiator", &self.initiator)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePhys {
        next_addr: core::sync::atomic::AtomicU64,
    }

    impl PhysAllocator for FakePhys {
        fn alloc_pages(&self, count: usize) -> Option<u64> {
            let addr = self.next_addr.fetch_add((count * ZONE_PAGE_SIZE as usize) as u64, core::sync::atomic::Ordering::SeqCst);
            Some(addr)
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
            if self.rdma {
                Some(0xCAFE)
            } else {
                None
            }
        }
    }

    #[test]
    fn begin_create_rejects_unaligned_size() {
        let zm = ZoneManager::new(NodeId(1));
        assert!(zm.begin_create(NodeId(2), 1, 100, 0, 0, 0).is_none());
    }

    #[test]
    fn responder_grants_plain_zone_without_rdma_transport() {
        let zm = ZoneManager::new(NodeId(2));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x1000) };
        let transport = FakeTransport { rdma: false };
        let req = ZoneCreateReqPayload { zone_id: 1, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };
        let ack = zm.handle_create_req(NodeId(1), &req, &transport, &phys);
        assert_eq!(ack.status, ZoneCreateStatus::Accepted as u8);
        assert_eq!(ack.rkey, 0);
        assert_eq!(zm.access_plan(NodeId(1), 1), Some(ZoneAccessPlan::Chunked));
    }

    #[test]
    fn responder_grants_rdma_zone_with_rdma_transport() {
        let zm = ZoneManager::new(NodeId(2));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x1000) };
        let transport = FakeTransport { rdma: true };
        let req = ZoneCreateReqPayload { zone_id: 1, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };
        let ack = zm.handle_create_req(NodeId(1), &req, &transport, &phys);
        assert_eq!(ack.rkey, 0xCAFE);
        assert_eq!(zm.access_plan(NodeId(1), 1), Some(ZoneAccessPlan::Direct));
    }

    #[test]
    fn initiator_mirrors_responders_plain_choice() {
        let zm = ZoneManager::new(NodeId(1));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x2000) };
        let transport = FakeTransport { rdma: false };
        zm.begin_create(NodeId(2), 7, 4096, 0, 0, 0).unwrap();
        let ack = ZoneCreateAckPayload { zone_id: 7, status: ZoneCreateStatus::Accepted as u8, phys_addr: 0x9000, rkey: 0 };
        let result = zm.on_create_ack(NodeId(2), &ack, &transport, &phys);
        assert_eq!(result, CreatePoll::Active { phys_addr: 0x2000, is_rdma: false });
    }

    #[test]
    fn remote_write_denied_without_access_flag() {
        let zm = ZoneManager::new(NodeId(2));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x1000) };
        let transport = FakeTransport { rdma: false };
        let req = ZoneCreateReqPayload { zone_id: 1, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };
        zm.handle_create_req(NodeId(1), &req, &transport, &phys);
        let err = zm.handle_write(NodeId(1), 1, 0, &[1, 2, 3], &phys).unwrap_err();
        assert_eq!(err, WkiError::ZoneAccessDenied);
    }

    #[test]
    fn remote_write_allowed_with_access_flag() {
        let zm = ZoneManager::new(NodeId(2));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x1000) };
        let transport = FakeTransport { rdma: false };
        let req = ZoneCreateReqPayload { zone_id: 1, size: 4096, access_policy: ACCESS_REMOTE_WRITE, notify_mode: 0, zone_type_hint: 0 };
        zm.handle_create_req(NodeId(1), &req, &transport, &phys);
        assert!(zm.handle_write(NodeId(1), 1, 0, &[1, 2, 3], &phys).is_ok());
    }

    #[test]
    fn fencing_tears_down_every_zone_for_that_peer() {
        let zm = ZoneManager::new(NodeId(2));
        let phys = FakePhys { next_addr: core::sync::atomic::AtomicU64::new(0x1000) };
        let transport = FakeTransport { rdma: false };
        let req1 = ZoneCreateReqPayload { zone_id: 1, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };
        let req2 = ZoneCreateReqPayload { zone_id: 2, size: 4096, access_policy: 0, notify_mode: 0, zone_type_hint: 0 };
        zm.handle_create_req(NodeId(1), &req1, &transport, &phys);
        zm.handle_create_req(NodeId(3), &req2, &transport, &phys);
        let torn_down = zm.destroy_all_for_peer(NodeId(1));
        assert_eq!(torn_down.len(), 1);
        assert_eq!(torn_down[0].zone_id, 1);
        assert!(zm.access_plan(NodeId(3), 2).is_some());
    }
}
