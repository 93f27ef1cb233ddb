//! Link-state routing: LSDB, Dijkstra SPF, and the forwarding decision
//! (spec §4.E).
//!
//! `Router` owns the link-state database and the computed next-hop table.
//! It has no opinion about peers or transports: callers feed it decoded
//! LINK_STATE_ADVERT payloads and connectivity-change notifications, and
//! consult [`Router::decide_forward`]/[`Router::next_hop`] when routing a
//! frame.

#![no_std]

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use wki_abi::payload::LsaNeighborEntry;
use wki_abi::{NodeId, WireHeader};
use wki_lib::IrqMutex;
use wki_lib::IrqRwLock;
use wki_lib::config::{LSA_MAX_AGE_MULTIPLE, LSA_REFRESH_INTERVAL_MS, MAX_PEERS};

/// Max neighbors a single LSA can carry. Bounds `LsdbEntry`'s storage;
/// chosen well above any realistic per-node fan-out rather than tied to a
/// spec-named constant.
const MAX_NEIGHBORS_PER_LSA: usize = 32;

/// One LSDB slot per possible origin node, same order of magnitude as the
/// peer table since every Connected peer originates at most one LSA.
const MAX_LSDB_ENTRIES: usize = MAX_PEERS;

#[derive(Debug, Clone, Copy)]
struct LsdbEntry {
    origin_node: NodeId,
    lsa_seq: u32,
    rdma_zone_bitmap: u32,
    neighbors: [Option<LsaNeighborEntry>; MAX_NEIGHBORS_PER_LSA],
    num_neighbors: usize,
    last_refreshed_ms: u64,
}

impl LsdbEntry {
    fn new(origin_node: NodeId, lsa_seq: u32, rdma_zone_bitmap: u32, now_ms: u64) -> Self {
        Self {
            origin_node,
            lsa_seq,
            rdma_zone_bitmap,
            neighbors: [None; MAX_NEIGHBORS_PER_LSA],
            num_neighbors: 0,
            last_refreshed_ms: now_ms,
        }
    }

    fn set_neighbors(&mut self, neighbors: &[LsaNeighborEntry]) {
        self.num_neighbors = neighbors.len().min(MAX_NEIGHBORS_PER_LSA);
        for (slot, nb) in self.neighbors.iter_mut().zip(neighbors.iter()) {
            *slot = Some(*nb);
        }
        for slot in self.neighbors.iter_mut().skip(self.num_neighbors) {
            *slot = None;
        }
    }

    fn neighbors(&self) -> &[Option<LsaNeighborEntry>] {
        &self.neighbors[..self.num_neighbors]
    }
}

struct Lsdb {
    slots: [IrqMutex<Option<LsdbEntry>>; MAX_LSDB_ENTRIES],
    table_lock: IrqMutex<()>,
}

impl Lsdb {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn hash_index(node_id: NodeId) -> usize {
        (((node_id.0 as u32).wrapping_mul(0x9E37)) >> 8) as usize % MAX_LSDB_ENTRIES
    }

    fn find(&self, node_id: NodeId) -> Option<usize> {
        let start = Self::hash_index(node_id);
        for i in 0..MAX_LSDB_ENTRIES {
            let idx = (start + i) % MAX_LSDB_ENTRIES;
            if self.slots[idx]
                .lock()
                .as_ref()
                .is_some_and(|e| e.origin_node == node_id)
            {
                return Some(idx);
            }
        }
        None
    }

    fn with_occupied<R>(&self, idx: usize, f: impl FnOnce(&mut LsdbEntry) -> R) -> Option<R> {
        let mut slot = self.slots[idx].lock();
        slot.as_mut().map(f)
    }

    fn insert_new(&self, entry: LsdbEntry) -> Option<usize> {
        let _table_guard = self.table_lock.lock();
        if self.find(entry.origin_node).is_some() {
            return None;
        }
        let start = Self::hash_index(entry.origin_node);
        for i in 0..MAX_LSDB_ENTRIES {
            let idx = (start + i) % MAX_LSDB_ENTRIES;
            let mut slot = self.slots[idx].lock();
            if slot.is_none() {
                *slot = Some(entry);
                return Some(idx);
            }
        }
        None
    }

    /// Unconditional overwrite, used only for our own locally-originated
    /// entry (we own the sequence number, so the usual "newer wins" check
    /// doesn't apply).
    fn force_store(&self, entry: LsdbEntry) {
        if let Some(idx) = self.find(entry.origin_node) {
            self.with_occupied(idx, |e| *e = entry);
        } else {
            self.insert_new(entry);
        }
    }

    fn clear_slot(&self, idx: usize) {
        *self.slots[idx].lock() = None;
    }

    fn occupied_origins(&self) -> Vec<NodeId> {
        let mut origins = Vec::new();
        for slot in &self.slots {
            if let Some(e) = slot.lock().as_ref() {
                origins.push(e.origin_node);
            }
        }
        origins
    }

    fn snapshot_all(&self) -> Vec<LsdbEntry> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if let Some(e) = slot.lock().as_ref() {
                out.push(*e);
            }
        }
        out
    }
}

/// A computed next-hop for one destination. `path_cost` is the sum of link
/// costs along the shortest path, not a literal hop count — it equals the
/// hop count only when every link on the path has `link_cost == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub dest: NodeId,
    pub next_hop: NodeId,
    pub path_cost: u16,
}

/// What to do with a received frame not destined for this node's local
/// stack, per spec §4.E's forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// `dst_node` is us, or broadcast: hand to the local dispatcher.
    Deliver,
    /// Forward unchanged (TTL already decremented in the header) via
    /// whichever transport reaches `next_hop`.
    Forward { next_hop: NodeId },
    /// TTL exhausted, or destination unreachable: drop silently.
    Drop,
}

pub struct Router {
    my_node_id: NodeId,
    my_lsa_seq: AtomicU32,
    lsdb: Lsdb,
    routes: IrqRwLock<Vec<RouteEntry>>,
}

impl Router {
    pub fn new(my_node_id: NodeId) -> Self {
        Self {
            my_node_id,
            my_lsa_seq: AtomicU32::new(0),
            lsdb: Lsdb::new(),
            routes: IrqRwLock::new(Vec::new()),
        }
    }

    /// (Re)install this node's own LSA after a connectivity change (a peer
    /// became Connected, or was fenced). Bumps and returns the new
    /// monotonic sequence number for the caller to encode into the
    /// LINK_STATE_ADVERT it floods.
    pub fn install_local_lsa(
        &self,
        now_ms: u64,
        neighbors: &[LsaNeighborEntry],
        rdma_zone_bitmap: u32,
    ) -> u32 {
        let seq = self.my_lsa_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entry = LsdbEntry::new(self.my_node_id, seq, rdma_zone_bitmap, now_ms);
        entry.set_neighbors(neighbors);
        self.lsdb.force_store(entry);
        self.recompute();
        seq
    }

    /// Handle a received LINK_STATE_ADVERT. Returns `true` if it was newer
    /// than what we had (or new outright) and should be re-flooded to every
    /// Connected neighbor except the one it arrived on; `false` if stale or
    /// self-originated (a flooding loop) and should be dropped.
    pub fn on_lsa(
        &self,
        now_ms: u64,
        origin_node: NodeId,
        lsa_seq: u32,
        rdma_zone_bitmap: u32,
        neighbors: &[LsaNeighborEntry],
    ) -> bool {
        if origin_node == self.my_node_id {
            return false;
        }
        let stored = match self.lsdb.find(origin_node) {
            Some(idx) => self
                .lsdb
                .with_occupied(idx, |e| {
                    if lsa_seq <= e.lsa_seq {
                        false
                    } else {
                        e.lsa_seq = lsa_seq;
                        e.rdma_zone_bitmap = rdma_zone_bitmap;
                        e.set_neighbors(neighbors);
                        e.last_refreshed_ms = now_ms;
                        true
                    }
                })
                .unwrap_or(false),
            None => {
                let mut entry = LsdbEntry::new(origin_node, lsa_seq, rdma_zone_bitmap, now_ms);
                entry.set_neighbors(neighbors);
                self.lsdb.insert_new(entry).is_some()
            }
        };
        if stored {
            self.recompute();
        }
        stored
    }

    /// Drop LSDB entries unrefreshed for longer than
    /// `LSA_REFRESH_INTERVAL_MS * LSA_MAX_AGE_MULTIPLE`, recomputing routes
    /// if anything aged out. Returns the origin nodes that were dropped.
    pub fn age_lsdb(&self, now_ms: u64) -> Vec<NodeId> {
        let max_age_ms = LSA_REFRESH_INTERVAL_MS * LSA_MAX_AGE_MULTIPLE;
        let mut aged = Vec::new();
        for node_id in self.lsdb.occupied_origins() {
            if node_id == self.my_node_id {
                continue;
            }
            if let Some(idx) = self.lsdb.find(node_id) {
                let stale = self
                    .lsdb
                    .with_occupied(idx, |e| now_ms.saturating_sub(e.last_refreshed_ms) >= max_age_ms)
                    .unwrap_or(false);
                if stale {
                    self.lsdb.clear_slot(idx);
                    aged.push(node_id);
                }
            }
        }
        if !aged.is_empty() {
            self.recompute();
        }
        aged
    }

    /// Immediately drop a node's LSDB entry, called as the routing step of
    /// the fencing cascade.
    pub fn invalidate(&self, node_id: NodeId) {
        if let Some(idx) = self.lsdb.find(node_id) {
            self.lsdb.clear_slot(idx);
            self.recompute();
        }
    }

    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        self.routes
            .read()
            .iter()
            .find(|r| r.dest == dest)
            .map(|r| r.next_hop)
    }

    pub fn routes_snapshot(&self) -> Vec<RouteEntry> {
        self.routes.read().clone()
    }

    /// Apply spec §4.E's forwarding rule: decrement TTL, drop at zero,
    /// otherwise look up the next hop. Mutates `header.hop_ttl` in place
    /// when forwarding.
    pub fn decide_forward(&self, header: &mut WireHeader) -> ForwardDecision {
        let dst = NodeId(header.dst_node);
        if dst == self.my_node_id || dst.is_broadcast() {
            return ForwardDecision::Deliver;
        }
        header.hop_ttl = header.hop_ttl.saturating_sub(1);
        if header.hop_ttl == 0 {
            return ForwardDecision::Drop;
        }
        match self.next_hop(dst) {
            Some(next_hop) => ForwardDecision::Forward { next_hop },
            None => ForwardDecision::Drop,
        }
    }

    /// Dijkstra SPF over the LSDB's directed graph (edge A->B exists with
    /// weight `link_cost` whenever A's stored LSA lists B as a neighbor).
    /// O(n^2) over the discovered node set; cheap at `MAX_PEERS` scale and
    /// run only on LSDB change, never per-packet.
    fn recompute(&self) {
        let snapshot = self.lsdb.snapshot_all();

        let mut nodes: Vec<NodeId> = Vec::new();
        nodes.push(self.my_node_id);
        for e in &snapshot {
            if !nodes.contains(&e.origin_node) {
                nodes.push(e.origin_node);
            }
            for nb in e.neighbors().iter().flatten() {
                let nid = NodeId(nb.node_id);
                if !nodes.contains(&nid) {
                    nodes.push(nid);
                }
            }
        }

        let n = nodes.len();
        let mut dist = vec![u32::MAX; n];
        let mut next_hop: Vec<Option<NodeId>> = vec![None; n];
        let mut visited = vec![false; n];
        let Some(src) = nodes.iter().position(|&x| x == self.my_node_id) else {
            return;
        };
        dist[src] = 0;

        for _ in 0..n {
            let Some(u) = (0..n).filter(|&i| !visited[i]).min_by_key(|&i| dist[i]) else {
                break;
            };
            if dist[u] == u32::MAX {
                break;
            }
            visited[u] = true;

            if let Some(entry) = snapshot.iter().find(|e| e.origin_node == nodes[u]) {
                for nb in entry.neighbors().iter().flatten() {
                    let v_id = NodeId(nb.node_id);
                    let Some(v) = nodes.iter().position(|&x| x == v_id) else {
                        continue;
                    };
                    let alt = dist[u].saturating_add(nb.link_cost as u32);
                    if alt < dist[v] {
                        dist[v] = alt;
                        next_hop[v] = if u == src { Some(v_id) } else { next_hop[u] };
                    }
                }
            }
        }

        let mut routes = Vec::new();
        for i in 0..n {
            if i == src || dist[i] == u32::MAX {
                continue;
            }
            if let Some(nh) = next_hop[i] {
                routes.push(RouteEntry {
                    dest: nodes[i],
                    next_hop: nh,
                    path_cost: dist[i].min(u16::MAX as u32) as u16,
                });
            }
        }
        *self.routes.write() = routes;
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    fn nb(node_id: u16, cost: u16) -> LsaNeighborEntry {
        LsaNeighborEntry {
            node_id,
            link_cost: cost,
            transport_mtu: 1500,
        }
    }

    #[test]
    fn linear_chain_computes_multihop_route() {
        let router = Router::new(NodeId(1));
        router.install_local_lsa(0, &[nb(2, 1)], 0);
        router.on_lsa(0, NodeId(2), 1, 0, &[nb(1, 1), nb(3, 1)]);

        assert_eq!(router.next_hop(NodeId(2)), Some(NodeId(2)));
        assert_eq!(router.next_hop(NodeId(3)), Some(NodeId(2)));
        let route3 = router
            .routes_snapshot()
            .into_iter()
            .find(|r| r.dest == NodeId(3))
            .unwrap();
        assert_eq!(route3.path_cost, 2);
    }

    #[test]
    fn stale_lsa_sequence_is_discarded() {
        let router = Router::new(NodeId(1));
        assert!(router.on_lsa(0, NodeId(2), 5, 0, &[]));
        assert!(!router.on_lsa(0, NodeId(2), 3, 0, &[]));
        assert!(!router.on_lsa(0, NodeId(2), 5, 0, &[]));
        assert!(router.on_lsa(0, NodeId(2), 6, 0, &[]));
    }

    #[test]
    fn self_originated_lsa_is_rejected() {
        let router = Router::new(NodeId(1));
        assert!(!router.on_lsa(0, NodeId(1), 1, 0, &[]));
    }

    #[test]
    fn aging_drops_stale_entries_and_their_routes() {
        let router = Router::new(NodeId(1));
        router.install_local_lsa(0, &[nb(2, 1)], 0);
        router.on_lsa(1_000, NodeId(2), 1, 0, &[nb(1, 1)]);
        assert!(router.next_hop(NodeId(2)).is_some());

        let max_age_ms = LSA_REFRESH_INTERVAL_MS * LSA_MAX_AGE_MULTIPLE;
        let aged = router.age_lsdb(1_000 + max_age_ms + 1);
        assert_eq!(aged, alloc::vec![NodeId(2)]);
        assert!(router.next_hop(NodeId(2)).is_none());
    }

    #[test]
    fn invalidate_removes_the_route() {
        let router = Router::new(NodeId(1));
        router.install_local_lsa(0, &[nb(2, 1)], 0);
        router.on_lsa(0, NodeId(2), 1, 0, &[]);
        assert!(router.next_hop(NodeId(2)).is_some());
        router.invalidate(NodeId(2));
        assert!(router.next_hop(NodeId(2)).is_none());
    }

    #[test]
    fn forwarding_decrements_ttl_and_drops_at_zero() {
        let router = Router::new(NodeId(1));
        router.install_local_lsa(0, &[nb(2, 1)], 0);
        router.on_lsa(0, NodeId(2), 1, 0, &[]);

        let mut h = WireHeader::new(0x01, 9, 2, 0, 0, 0);
        h.hop_ttl = 1;
        assert_eq!(router.decide_forward(&mut h), ForwardDecision::Drop);

        let mut h = WireHeader::new(0x01, 9, 2, 0, 0, 0);
        h.hop_ttl = 2;
        assert_eq!(
            router.decide_forward(&mut h),
            ForwardDecision::Forward { next_hop: NodeId(2) }
        );
        assert_eq!(h.hop_ttl, 1);
    }

    #[test]
    fn self_and_broadcast_destined_frames_are_delivered() {
        let router = Router::new(NodeId(1));
        let mut h = WireHeader::new(0x01, 9, 1, 0, 0, 0);
        assert_eq!(router.decide_forward(&mut h), ForwardDecision::Deliver);

        let mut h = WireHeader::new(0x01, 9, wki_abi::node::NODE_BROADCAST, 0, 0, 0);
        assert_eq!(router.decide_forward(&mut h), ForwardDecision::Deliver);
    }

    #[test]
    fn unreachable_destination_is_dropped() {
        let router = Router::new(NodeId(1));
        let mut h = WireHeader::new(0x01, 9, 42, 0, 0, 0);
        h.hop_ttl = 10;
        assert_eq!(router.decide_forward(&mut h), ForwardDecision::Drop);
    }
}
