//! Peer discovery, heartbeat liveness, and fencing (spec §4.D).
//!
//! A [`PeerRegistry`] owns the fixed-capacity peer table and nothing else —
//! it knows nothing about transports or channels. Callers (the dispatcher in
//! the `core` crate) feed it decoded HELLO/HEARTBEAT payloads and periodic
//! ticks, and act on the [`PeerEvent`]s it returns: broadcasting a reply,
//! resending a HELLO, or invoking [`PeerRegistry::fence`].

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::node;
use wki_abi::payload::{FenceNotifyPayload, FenceReason, HeartbeatPayload, HelloCaps, HelloPayload};
use wki_abi::NodeId;
use wki_lib::IrqMutex;
use wki_lib::config::{
    HEARTBEAT_INTERVAL_MAX_MS, HEARTBEAT_INTERVAL_MIN_MS, HEARTBEAT_MISS_THRESHOLD,
    HELLO_INTERVAL_MS, HELLO_MAX_RETRIES, MAX_PEERS, PEER_GRACE_PERIOD_NS,
};

/// Number of ordered fence-cascade steps a single [`PeerRegistry`] can hold
/// handlers for (spec §3.3's cascade has nine steps: event-bus unsubscribe,
/// IRQ-forward unbind, device-server detach-all, device-proxy detach-all,
/// VFS proxy/server-FD cleanup, NIC proxy cleanup, compute task/load-cache
/// cleanup, zone destroy-for-peer, channel close-for-peer).
pub const MAX_FENCE_HANDLERS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Transient: occupies a slot between `insert_new` and the first state
    /// assignment. Never observed outside this module.
    Unknown,
    /// We sent HELLO and are waiting for HELLO_ACK.
    HelloSent,
    Connected,
    /// A HELLO arrived from a node whose previous record was `Fenced`;
    /// waiting on the caller to run RECONCILE_REQ/ACK before promoting back
    /// to `Connected` via [`PeerRegistry::mark_reconciled`].
    Reconnecting,
    Fenced,
}

struct PeerRecord {
    node_id: NodeId,
    mac: [u8; 6],
    state: PeerState,
    capabilities: HelloCaps,
    heartbeat_interval_ms: u64,
    max_channels: u16,
    rdma_zone_bitmap: u32,
    connected_time_ns: u64,
    last_heartbeat_ns: u64,
    hello_sent_time_ns: u64,
    hello_retries: u32,
    last_load: u16,
    last_mem_free: u16,
}

impl PeerRecord {
    fn hello_sent(node_id: NodeId, now_ns: u64) -> Self {
        Self {
            node_id,
            mac: [0; 6],
            state: PeerState::HelloSent,
            capabilities: HelloCaps::empty(),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MAX_MS,
            max_channels: 0,
            rdma_zone_bitmap: 0,
            connected_time_ns: 0,
            last_heartbeat_ns: 0,
            hello_sent_time_ns: now_ns,
            hello_retries: 0,
            last_load: 0,
            last_mem_free: 0,
        }
    }

    fn connected(
        node_id: NodeId,
        mac: [u8; 6],
        hello: &HelloPayload,
        heartbeat_interval_ms: u64,
        now_ns: u64,
    ) -> Self {
        Self {
            node_id,
            mac,
            state: PeerState::Connected,
            capabilities: hello.capabilities,
            heartbeat_interval_ms,
            max_channels: hello.max_channels,
            rdma_zone_bitmap: hello.rdma_zone_bitmap,
            connected_time_ns: now_ns,
            last_heartbeat_ns: now_ns,
            hello_sent_time_ns: 0,
            hello_retries: 0,
            last_load: 0,
            last_mem_free: 0,
        }
    }
}

/// Read-only copy of a peer's state, safe to hold across calls into other
/// subsystems (unlike a table slot guard).
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub node_id: NodeId,
    pub mac: [u8; 6],
    pub state: PeerState,
    pub capabilities: HelloCaps,
    pub heartbeat_interval_ms: u64,
    pub connected_time_ns: u64,
    pub last_heartbeat_ns: u64,
    pub last_load: u16,
    pub last_mem_free: u16,
}

/// Events a caller must act on: reply with a wire message, run RECONCILE, or
/// hand off to [`PeerRegistry::fence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    NodeJoin(NodeId),
    PeerReconnected(NodeId),
    ResendHello(NodeId),
    FenceDue(NodeId, FenceReason),
    HelloRetriesExhausted(NodeId),
}

#[derive(Debug)]
pub enum HelloOutcome {
    Accepted {
        negotiated_heartbeat_ms: u64,
        event: Option<PeerEvent>,
    },
    /// `sender_node` equals our own id and our MAC loses the tiebreak — the
    /// caller must regenerate its local node id.
    WeLoseCollision,
    /// Same collision, but our MAC wins; the sender is expected to
    /// regenerate instead.
    TheyLoseCollision,
    TableFull,
}

pub struct FenceOutcome {
    pub already_fenced: bool,
    pub notify: Option<FenceNotifyPayload>,
}

/// A subsystem's hook into the fencing cascade (spec §3.3). Registered once
/// at init time, in the exact cascade order, by the crate that owns the
/// corresponding per-peer state (event bus, device server, device proxy,
/// zones, channel table, ...).
///
/// This is a distinct pattern from `wki_lib::collab`'s single-slot
/// `collaborator_cell!`: fencing has multiple ordered registrants rather
/// than one collaborator per trait, so it uses a small fixed-capacity
/// ordered list instead.
pub trait FenceHandler: Send + Sync {
    fn on_peer_fenced(&self, node: NodeId);
}

enum TickAction {
    ResendHello,
    FenceDue,
    ReclaimSlot,
}

struct PeerTable {
    slots: [IrqMutex<Option<PeerRecord>>; MAX_PEERS],
    /// Serializes slot claims during insertion. Per spec §5's distinction
    /// between a peer's own lock and the peer table's lock: reads and
    /// in-place mutations of an existing record only ever take the relevant
    /// slot's lock, this one is held only while picking a vacant slot for a
    /// brand-new node id.
    table_lock: IrqMutex<()>,
}

impl PeerTable {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    /// `(node_id * 0x9E37) >> 8`, per spec §5's 256-entry hash table layout.
    fn hash_index(node_id: NodeId) -> usize {
        (((node_id.0 as u32).wrapping_mul(0x9E37)) >> 8) as usize % MAX_PEERS
    }

    /// Full linear probe over every slot starting at the hash index. No
    /// tombstones are needed since reclaimed slots are cleared to `None`
    /// outright rather than deleted mid-chain.
    fn find(&self, node_id: NodeId) -> Option<usize> {
        let start = Self::hash_index(node_id);
        for i in 0..MAX_PEERS {
            let idx = (start + i) % MAX_PEERS;
            if self.slots[idx]
                .lock()
                .as_ref()
                .is_some_and(|r| r.node_id == node_id)
            {
                return Some(idx);
            }
        }
        None
    }

    fn with_occupied<R>(&self, idx: usize, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        let mut slot = self.slots[idx].lock();
        slot.as_mut().map(f)
    }

    fn insert_new(&self, record: PeerRecord) -> Option<usize> {
        let _table_guard = self.table_lock.lock();
        if self.find(record.node_id).is_some() {
            return None;
        }
        let start = Self::hash_index(record.node_id);
        for i in 0..MAX_PEERS {
            let idx = (start + i) % MAX_PEERS;
            let mut slot = self.slots[idx].lock();
            if slot.is_none() {
                *slot = Some(record);
                return Some(idx);
            }
        }
        None
    }

    fn clear_slot(&self, idx: usize) {
        *self.slots[idx].lock() = None;
    }

    fn occupied_node_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for slot in &self.slots {
            if let Some(rec) = slot.lock().as_ref() {
                ids.push(rec.node_id);
            }
        }
        ids
    }
}

/// Peer discovery, liveness, and fencing for one node.
pub struct PeerRegistry {
    my_node_id: NodeId,
    table: PeerTable,
    fence_handlers: IrqMutex<[Option<&'static dyn FenceHandler>; MAX_FENCE_HANDLERS]>,
}

impl PeerRegistry {
    pub fn new(my_node_id: NodeId) -> Self {
        Self {
            my_node_id,
            table: PeerTable::new(),
            fence_handlers: IrqMutex::new([None; MAX_FENCE_HANDLERS]),
        }
    }

    /// Register a fence-cascade step. Order of registration is the order of
    /// invocation during `fence()`. Returns `false` if the fixed-size
    /// registrant list is already full.
    pub fn register_fence_handler(&self, handler: &'static dyn FenceHandler) -> bool {
        let mut slots = self.fence_handlers.lock();
        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(handler);
                true
            }
            None => false,
        }
    }

    /// Begin proactively contacting a node we learned about some other way
    /// (e.g. a static seed list, or a routing LSA naming a node we have no
    /// record for). Returns `false` if a record for `node_id` already
    /// exists.
    pub fn start_hello(&self, node_id: NodeId, now_ns: u64) -> bool {
        if self.table.find(node_id).is_some() {
            return false;
        }
        self.table
            .insert_new(PeerRecord::hello_sent(node_id, now_ns))
            .is_some()
    }

    /// Handle a received HELLO or HELLO_ACK. `our_heartbeat_proposal_ms` is
    /// this node's own preferred interval; the negotiated interval is the
    /// smaller of the two proposals, clamped to the configured bounds.
    pub fn on_hello(
        &self,
        now_ns: u64,
        sender_node: NodeId,
        sender_mac: [u8; 6],
        hello: &HelloPayload,
        our_mac: [u8; 6],
        our_heartbeat_proposal_ms: u64,
    ) -> HelloOutcome {
        if sender_node == self.my_node_id {
            return if node::wins_collision(our_mac, sender_mac) {
                HelloOutcome::TheyLoseCollision
            } else {
                HelloOutcome::WeLoseCollision
            };
        }

        let negotiated = (hello.heartbeat_interval_ms as u64)
            .min(our_heartbeat_proposal_ms)
            .clamp(HEARTBEAT_INTERVAL_MIN_MS, HEARTBEAT_INTERVAL_MAX_MS);

        if let Some(idx) = self.table.find(sender_node) {
            let event = self
                .table
                .with_occupied(idx, |rec| {
                    rec.mac = sender_mac;
                    rec.capabilities = hello.capabilities;
                    rec.heartbeat_interval_ms = negotiated;
                    rec.max_channels = hello.max_channels;
                    rec.rdma_zone_bitmap = hello.rdma_zone_bitmap;
                    rec.last_heartbeat_ns = now_ns;
                    match rec.state {
                        PeerState::Fenced => {
                            rec.state = PeerState::Reconnecting;
                            rec.connected_time_ns = now_ns;
                            Some(PeerEvent::PeerReconnected(sender_node))
                        }
                        PeerState::HelloSent | PeerState::Unknown => {
                            rec.state = PeerState::Connected;
                            rec.connected_time_ns = now_ns;
                            Some(PeerEvent::NodeJoin(sender_node))
                        }
                        PeerState::Connected | PeerState::Reconnecting => None,
                    }
                })
                .flatten();
            return HelloOutcome::Accepted {
                negotiated_heartbeat_ms: negotiated,
                event,
            };
        }

        let record = PeerRecord::connected(sender_node, sender_mac, hello, negotiated, now_ns);
        match self.table.insert_new(record) {
            Some(_) => HelloOutcome::Accepted {
                negotiated_heartbeat_ms: negotiated,
                event: Some(PeerEvent::NodeJoin(sender_node)),
            },
            None => HelloOutcome::TableFull,
        }
    }

    /// Promote a `Reconnecting` peer back to `Connected` once the caller has
    /// completed RECONCILE_REQ/ACK for it. A no-op for any other state.
    pub fn mark_reconciled(&self, node_id: NodeId) {
        if let Some(idx) = self.table.find(node_id) {
            self.table.with_occupied(idx, |rec| {
                if rec.state == PeerState::Reconnecting {
                    rec.state = PeerState::Connected;
                }
            });
        }
    }

    /// Record a received heartbeat. Returns `false` if `sender_node` has no
    /// record (the caller may choose to treat that as an implicit prompt to
    /// re-HELLO).
    pub fn on_heartbeat(&self, now_ns: u64, sender_node: NodeId, hb: &HeartbeatPayload) -> bool {
        match self.table.find(sender_node) {
            Some(idx) => self
                .table
                .with_occupied(idx, |rec| {
                    rec.last_heartbeat_ns = now_ns;
                    rec.last_load = hb.sender_load;
                    rec.last_mem_free = hb.sender_mem_free;
                })
                .is_some(),
            None => false,
        }
    }

    pub fn snapshot(&self, node_id: NodeId) -> Option<PeerSnapshot> {
        let idx = self.table.find(node_id)?;
        self.table.with_occupied(idx, |rec| PeerSnapshot {
            node_id: rec.node_id,
            mac: rec.mac,
            state: rec.state,
            capabilities: rec.capabilities,
            heartbeat_interval_ms: rec.heartbeat_interval_ms,
            connected_time_ns: rec.connected_time_ns,
            last_heartbeat_ns: rec.last_heartbeat_ns,
            last_load: rec.last_load,
            last_mem_free: rec.last_mem_free,
        })
    }

    /// Snapshot every peer currently `Connected` or `Reconnecting`, for
    /// building a link-state advertisement's neighbor list and for fanning
    /// out periodic broadcasts (load reports) to every live peer.
    pub fn connected_snapshots(&self) -> Vec<PeerSnapshot> {
        self.table
            .occupied_node_ids()
            .into_iter()
            .filter_map(|node_id| self.snapshot(node_id))
            .filter(|s| matches!(s.state, PeerState::Connected | PeerState::Reconnecting))
            .collect()
    }

    /// Drive HELLO retry timing and heartbeat-miss detection. Returns the
    /// events the caller must act on; does not itself fence anyone — that
    /// happens via an explicit `fence()` call so the caller controls when
    /// the wire-level FENCE_NOTIFY broadcast and cascade actually run.
    pub fn tick(&self, now_ns: u64) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        for node_id in self.table.occupied_node_ids() {
            let Some(idx) = self.table.find(node_id) else {
                continue;
            };
            let action = self
                .table
                .with_occupied(idx, |rec| match rec.state {
                    PeerState::HelloSent => {
                        let elapsed_ms = now_ns.saturating_sub(rec.hello_sent_time_ns) / 1_000_000;
                        if elapsed_ms < HELLO_INTERVAL_MS {
                            return None;
                        }
                        rec.hello_retries += 1;
                        if rec.hello_retries > HELLO_MAX_RETRIES {
                            Some(TickAction::ReclaimSlot)
                        } else {
                            rec.hello_sent_time_ns = now_ns;
                            Some(TickAction::ResendHello)
                        }
                    }
                    PeerState::Connected => {
                        let interval_ns = rec.heartbeat_interval_ms * 1_000_000;
                        let miss_deadline_ns = interval_ns.saturating_mul(HEARTBEAT_MISS_THRESHOLD);
                        let since_heartbeat = now_ns.saturating_sub(rec.last_heartbeat_ns);
                        let since_connect = now_ns.saturating_sub(rec.connected_time_ns);
                        if since_heartbeat >= miss_deadline_ns && since_connect >= PEER_GRACE_PERIOD_NS {
                            Some(TickAction::FenceDue)
                        } else {
                            None
                        }
                    }
                    PeerState::Unknown | PeerState::Reconnecting | PeerState::Fenced => None,
                })
                .flatten();
            match action {
                Some(TickAction::ResendHello) => events.push(PeerEvent::ResendHello(node_id)),
                Some(TickAction::FenceDue) => {
                    events.push(PeerEvent::FenceDue(node_id, FenceReason::HeartbeatTimeout))
                }
                Some(TickAction::ReclaimSlot) => {
                    self.table.clear_slot(idx);
                    events.push(PeerEvent::HelloRetriesExhausted(node_id));
                }
                None => {}
            }
        }
        events
    }

    /// Run the fencing cascade for `node_id`: every registered
    /// [`FenceHandler`] fires in registration order, then the peer's state
    /// becomes `Fenced`. Idempotent — a peer already `Fenced` (or with no
    /// record at all) runs no handlers and reports `already_fenced: true`.
    pub fn fence(&self, node_id: NodeId, reason: FenceReason) -> FenceOutcome {
        let Some(idx) = self.table.find(node_id) else {
            return FenceOutcome {
                already_fenced: true,
                notify: None,
            };
        };
        let already = self
            .table
            .with_occupied(idx, |rec| rec.state == PeerState::Fenced)
            .unwrap_or(true);
        if already {
            return FenceOutcome {
                already_fenced: true,
                notify: None,
            };
        }

        for handler in self.fence_handlers.lock().iter().flatten() {
            handler.on_peer_fenced(node_id);
        }
        self.table.with_occupied(idx, |rec| rec.state = PeerState::Fenced);

        FenceOutcome {
            already_fenced: false,
            notify: Some(FenceNotifyPayload {
                fenced_node: node_id.0,
                fencing_node: self.my_node_id.0,
                reason,
            }),
        }
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::*;

    fn sample_hello(node_id: u16) -> HelloPayload {
        HelloPayload {
            magic: wki_abi::payload::HELLO_MAGIC,
            protocol_version: 1,
            node_id,
            mac_addr: [0; 6],
            capabilities: HelloCaps::empty(),
            heartbeat_interval_ms: 300,
            max_channels: 64,
            rdma_zone_bitmap: 0,
        }
    }

    #[test]
    fn fresh_hello_creates_connected_peer_and_emits_join() {
        let registry = PeerRegistry::new(NodeId(1));
        let outcome = registry.on_hello(1_000, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        match outcome {
            HelloOutcome::Accepted { event, .. } => {
                assert!(matches!(event, Some(PeerEvent::NodeJoin(n)) if n == NodeId(2)));
            }
            _ => panic!("expected Accepted"),
        }
        assert_eq!(registry.snapshot(NodeId(2)).unwrap().state, PeerState::Connected);
    }

    #[test]
    fn duplicate_hello_from_connected_peer_emits_no_event() {
        let registry = PeerRegistry::new(NodeId(1));
        registry.on_hello(0, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        let outcome = registry.on_hello(500, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        match outcome {
            HelloOutcome::Accepted { event, .. } => assert!(event.is_none()),
            _ => panic!("expected Accepted"),
        }
    }

    #[test]
    fn collision_resolves_by_lower_mac() {
        let registry = PeerRegistry::new(NodeId(5));
        let our_mac = [0x02, 0x22, 0x22, 0x22, 0x22, 0x22];
        let lower_mac = [0x02, 0x11, 0x11, 0x11, 0x11, 0x11];
        let higher_mac = [0x02, 0x33, 0x33, 0x33, 0x33, 0x33];
        let hello = sample_hello(5);

        let outcome = registry.on_hello(0, NodeId(5), lower_mac, &hello, our_mac, 300);
        assert!(matches!(outcome, HelloOutcome::WeLoseCollision));

        let outcome = registry.on_hello(0, NodeId(5), higher_mac, &hello, our_mac, 300);
        assert!(matches!(outcome, HelloOutcome::TheyLoseCollision));
    }

    #[test]
    fn hello_from_fenced_peer_transitions_through_reconnecting() {
        let registry = PeerRegistry::new(NodeId(1));
        registry.on_hello(0, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        let outcome = registry.fence(NodeId(2), FenceReason::HeartbeatTimeout);
        assert!(!outcome.already_fenced);

        let outcome = registry.on_hello(10_000, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        match outcome {
            HelloOutcome::Accepted { event, .. } => {
                assert!(matches!(event, Some(PeerEvent::PeerReconnected(n)) if n == NodeId(2)));
            }
            _ => panic!("expected Accepted"),
        }
        assert_eq!(registry.snapshot(NodeId(2)).unwrap().state, PeerState::Reconnecting);

        registry.mark_reconciled(NodeId(2));
        assert_eq!(registry.snapshot(NodeId(2)).unwrap().state, PeerState::Connected);
    }

    struct RecordingHandler {
        id: u8,
        log: &'static IrqMutex<Vec<u8>>,
    }

    impl FenceHandler for RecordingHandler {
        fn on_peer_fenced(&self, _node: NodeId) {
            self.log.lock().push(self.id);
        }
    }

    #[test]
    fn fencing_runs_handlers_in_registered_order_and_is_idempotent() {
        let log: &'static IrqMutex<Vec<u8>> = Box::leak(Box::new(IrqMutex::new(Vec::new())));
        let registry = PeerRegistry::new(NodeId(1));
        registry.on_hello(0, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);

        let h1: &'static RecordingHandler = Box::leak(Box::new(RecordingHandler { id: 1, log }));
        let h2: &'static RecordingHandler = Box::leak(Box::new(RecordingHandler { id: 2, log }));
        assert!(registry.register_fence_handler(h1));
        assert!(registry.register_fence_handler(h2));

        let outcome = registry.fence(NodeId(2), FenceReason::HeartbeatTimeout);
        assert!(!outcome.already_fenced);
        assert!(outcome.notify.is_some());
        assert_eq!(*log.lock(), vec![1u8, 2u8]);

        let outcome = registry.fence(NodeId(2), FenceReason::HeartbeatTimeout);
        assert!(outcome.already_fenced);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn heartbeat_timeout_past_grace_period_emits_fence_due() {
        let registry = PeerRegistry::new(NodeId(1));
        registry.on_hello(0, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        let miss_ns = 300 * 1_000_000 * HEARTBEAT_MISS_THRESHOLD;
        let now = PEER_GRACE_PERIOD_NS + miss_ns + 1;
        let events = registry.tick(now);
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::FenceDue(n, FenceReason::HeartbeatTimeout) if *n == NodeId(2))));
    }

    #[test]
    fn heartbeat_within_interval_does_not_fence() {
        let registry = PeerRegistry::new(NodeId(1));
        registry.on_hello(0, NodeId(2), [2; 6], &sample_hello(2), [1; 6], 300);
        registry.on_heartbeat(
            1_000_000,
            NodeId(2),
            &HeartbeatPayload {
                send_timestamp: 1_000_000,
                sender_load: 10,
                sender_mem_free: 1000,
            },
        );
        let events = registry.tick(1_000_000 + 10_000_000);
        assert!(events.is_empty());
    }

    #[test]
    fn hello_sent_exhausts_retries_and_reclaims_slot() {
        let registry = PeerRegistry::new(NodeId(1));
        assert!(registry.start_hello(NodeId(9), 0));
        let mut now = 0u64;
        for _ in 0..=HELLO_MAX_RETRIES {
            now += HELLO_INTERVAL_MS * 1_000_000;
            let _ = registry.tick(now);
        }
        assert!(registry.snapshot(NodeId(9)).is_none());
    }
}
