//! Device-proxy: client side of resource remoting (spec §4.H).
//!
//! Mirrors `wki-devserver`'s binding table with an attach table of its own,
//! plus the per-device-kind local-shim state (block LBA chunking, NIC stats
//! cache, VFS read-ahead/write-behind/dir-listing cache) that turns a
//! remote resource into something the embedding kernel's own block/net/vfs
//! subsystem can register like a local device. Like its sibling crates it
//! does no wire I/O or logging itself — callers decode/encode payloads and
//! drive `tick`-style polling against a clock of their own.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::payload::{DevAttachAckPayload, DevAttachReqPayload, DevAttachStatus, DevDetachPayload};
use wki_abi::{NodeId, ResourceType};
use wki_lib::collab::NetDeviceStats;
use wki_lib::config::{ATTACH_TIMEOUT_MS, MAX_PROXY_ATTACHES, MAX_VFS_OPEN_HANDLES, NET_STATS_POLL_INTERVAL_MS, VFS_CACHE_SIZE, VFS_DIR_CACHE_STALE_US};
use wki_lib::IrqMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachPhase {
    Pending { started_ns: u64 },
    Active { channel: u16, max_op_size: u16 },
}

#[derive(Debug, Clone, Copy)]
struct AttachEntry {
    target: NodeId,
    resource_type: ResourceType,
    resource_id: u32,
    phase: AttachPhase,
}

/// Result of polling an in-flight attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPoll {
    Pending,
    Active { channel: u16, max_op_size: u16 },
    TimedOut,
    Rejected(DevAttachStatus),
}

/// Tracks every attach this node has asked a peer for, keyed by
/// `(target, resource_id)` — the same key the server advertises resources
/// under.
pub struct DeviceProxy {
    attaches: [IrqMutex<Option<AttachEntry>>; MAX_PROXY_ATTACHES],
    table_lock: IrqMutex<()>,
}

impl DeviceProxy {
    pub fn new() -> Self {
        Self {
            attaches: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, target: NodeId, resource_id: u32) -> Option<usize> {
        self.attaches
            .iter()
            .position(|slot| slot.lock().as_ref().is_some_and(|a| a.target == target && a.resource_id == resource_id))
    }

    /// Start an attach: claims a table slot and returns the `DEV_ATTACH_REQ`
    /// payload to send on the Resource channel. `None` if every slot is in
    /// use or this `(target, resource_id)` is already attaching/attached.
    pub fn begin_attach(&self, target: NodeId, resource_type: ResourceType, resource_id: u32, now_ns: u64) -> Option<DevAttachReqPayload> {
        let _guard = self.table_lock.lock();
        if self.find_index(target, resource_id).is_some() {
            return None;
        }
        for slot in &self.attaches {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(AttachEntry {
                    target,
                    resource_type,
                    resource_id,
                    phase: AttachPhase::Pending { started_ns: now_ns },
                });
                return Some(DevAttachReqPayload {
                    target_node: target.0,
                    resource_type: resource_type as u16,
                    resource_id,
                    attach_mode: 0,
                    requested_channel: 0,
                });
            }
        }
        None
    }

    /// `DEV_ATTACH_ACK` carries no `resource_id` of its own, so a caller
    /// matching one to a pending attach must first find which resource is
    /// still pending against `target`. Only one attach to a given target is
    /// normally in flight at a time; if several are, the oldest is assumed
    /// to be the one acked first (FIFO, matching in-order delivery on the
    /// control channel).
    pub fn pending_for_target(&self, target: NodeId) -> Option<u32> {
        self.attaches
            .iter()
            .filter_map(|slot| slot.lock().as_ref().filter(|a| a.target == target && matches!(a.phase, AttachPhase::Pending { .. })).map(|a| a.resource_id))
            .next()
    }

    /// Apply a received `DEV_ATTACH_ACK`.
    pub fn on_attach_ack(&self, target: NodeId, resource_id: u32, ack: &DevAttachAckPayload) {
        let Some(idx) = self.find_index(target, resource_id) else {
            return;
        };
        let mut guard = self.attaches[idx].lock();
        let Some(entry) = guard.as_mut() else {
            return;
        };
        if ack.status == DevAttachStatus::Ok as u8 {
            entry.phase = AttachPhase::Active {
                channel: ack.assigned_channel,
                max_op_size: ack.max_op_size,
            };
        } else {
            *guard = None;
        }
    }

    /// Poll an attach's progress. Callers spin-yield between polls; a
    /// `Pending` result past `ATTACH_TIMEOUT_MS` since `begin_attach` frees
    /// the slot and reports `TimedOut`.
    pub fn poll_attach(&self, target: NodeId, resource_id: u32, now_ns: u64) -> AttachPoll {
        let Some(idx) = self.find_index(target, resource_id) else {
            return AttachPoll::Rejected(DevAttachStatus::NotFound);
        };
        let mut guard = self.attaches[idx].lock();
        match guard.as_ref().map(|e| e.phase) {
            Some(AttachPhase::Active { channel, max_op_size }) => AttachPoll::Active { channel, max_op_size },
            Some(AttachPhase::Pending { started_ns }) => {
                if now_ns.saturating_sub(started_ns) >= ATTACH_TIMEOUT_MS * 1_000_000 {
                    *guard = None;
                    AttachPoll::TimedOut
                } else {
                    AttachPoll::Pending
                }
            }
            None => AttachPoll::Rejected(DevAttachStatus::NotFound),
        }
    }

    /// Look up an active attach's negotiated channel/max_op_size, for
    /// building `DEV_OP_REQ` frames after attach completes.
    pub fn active(&self, target: NodeId, resource_id: u32) -> Option<(u16, u16)> {
        let idx = self.find_index(target, resource_id)?;
        match self.attaches[idx].lock().as_ref()?.phase {
            AttachPhase::Active { channel, max_op_size } => Some((channel, max_op_size)),
            AttachPhase::Pending { .. } => None,
        }
    }

    /// Tear down an attach locally and return the `DEV_DETACH` payload to
    /// send, if one was active.
    pub fn detach(&self, target: NodeId, resource_id: u32) -> Option<DevDetachPayload> {
        let idx = self.find_index(target, resource_id)?;
        let entry = self.attaches[idx].lock().take()?;
        Some(DevDetachPayload {
            target_node: entry.target.0,
            resource_type: entry.resource_type as u16,
            resource_id: entry.resource_id,
        })
    }

    /// Peer fencing: every attach pointed at `node` is aborted locally
    /// (spec §4.C's "fencing unblocks every in-flight operation waiting on
    /// that peer"). Returns what was torn down so the caller can unregister
    /// the corresponding local block/net/vfs shims.
    pub fn fence_peer(&self, node: NodeId) -> Vec<(ResourceType, u32)> {
        let mut torn_down = Vec::new();
        for slot in &self.attaches {
            let taken = {
                let mut guard = slot.lock();
                if guard.is_some_and(|a| a.target == node) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(entry) = taken {
                torn_down.push((entry.resource_type, entry.resource_id));
            }
        }
        torn_down
    }
}

impl Default for DeviceProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an LBA range into chunks no larger than `max_op_size` lets
/// through, for the local block shim's `read_blocks`/`write_blocks`.
pub fn chunk_lba_range(start_lba: u64, block_count: u32, block_size: u32, max_op_size: u16) -> Vec<(u64, u32)> {
    let blocks_per_chunk = (max_op_size as u32 / block_size.max(1)).max(1);
    let mut chunks = Vec::new();
    let mut lba = start_lba;
    let mut remaining = block_count;
    while remaining > 0 {
        let n = remaining.min(blocks_per_chunk);
        chunks.push((lba, n));
        lba += n as u64;
        remaining -= n;
    }
    chunks
}

/// Cached `OP_BLOCK_INFO` result backing the local block shim's
/// `block_size`/`total_blocks` accessors once populated.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockProxyInfo {
    pub block_size: u32,
    pub total_blocks: u64,
}

/// NIC proxy statistics cache: `OP_NET_GET_STATS` is polled in the
/// background at [`NET_STATS_POLL_INTERVAL_MS`] rather than per-call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NicProxyStats {
    pub stats: NetDeviceStats,
    last_polled_ns: u64,
}

impl NicProxyStats {
    pub fn due_for_poll(&self, now_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_polled_ns) >= NET_STATS_POLL_INTERVAL_MS * 1_000_000
    }

    pub fn record(&mut self, stats: NetDeviceStats, now_ns: u64) {
        self.stats = stats;
        self.last_polled_ns = now_ns;
    }
}

struct ReadCache {
    offset: u64,
    data: Vec<u8>,
}

struct WriteBuffer {
    offset: u64,
    data: Vec<u8>,
}

struct DirCache {
    data: Vec<u8>,
    cached_at_ns: u64,
}

/// Per-open-remote-file state: read-ahead cache, write-behind buffer, and
/// (for directory inodes) a TTL'd listing cache — each lazily populated.
#[derive(Default)]
struct VfsHandleState {
    remote_fd: u64,
    read_cache: Option<ReadCache>,
    write_buffer: Option<WriteBuffer>,
    dir_cache: Option<DirCache>,
}

/// What a read request needs before it can be served from `serve_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// The cache already covers the requested range.
    CacheHit,
    /// Fetch `len` bytes starting at `offset` and call
    /// [`VfsProxy::fill_read_cache`] with the result before serving.
    Fetch { offset: u64, len: u32 },
}

/// What to do with a buffered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// Buffered locally; nothing to send yet.
    Buffered,
    /// Send `OP_BLOCK_WRITE`/equivalent for the bytes now evicted from the
    /// write-behind buffer before buffering the new write.
    FlushThenBuffer,
}

pub struct VfsProxy {
    handles: [IrqMutex<Option<VfsHandleState>>; MAX_VFS_OPEN_HANDLES],
}

impl VfsProxy {
    pub fn new() -> Self {
        Self {
            handles: core::array::from_fn(|_| IrqMutex::new(None)),
        }
    }

    /// Open a local handle backing `remote_fd`. Returns `None` if every
    /// slot is in use.
    pub fn open(&self, remote_fd: u64) -> Option<usize> {
        for (idx, slot) in self.handles.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(VfsHandleState {
                    remote_fd,
                    ..Default::default()
                });
                return Some(idx);
            }
        }
        None
    }

    pub fn close(&self, handle: usize) {
        if let Some(slot) = self.handles.get(handle) {
            *slot.lock() = None;
        }
    }

    /// Read-ahead consistency: a pending write buffer must be flushed
    /// before a read proceeds (spec's "reads flush the write buffer").
    /// Returns the pending bytes to send as `OP_BLOCK_WRITE`, if any.
    pub fn take_pending_write(&self, handle: usize) -> Option<(u64, Vec<u8>)> {
        let slot = self.handles.get(handle)?;
        let buffer = slot.lock().as_mut()?.write_buffer.take();
        buffer.map(|b| (b.offset, b.data))
    }

    pub fn plan_read(&self, handle: usize, offset: u64, len: usize, max_op_size: u16) -> Option<ReadPlan> {
        let slot = self.handles.get(handle)?;
        let guard = slot.lock();
        let state = guard.as_ref()?;
        if let Some(cache) = &state.read_cache {
            let cache_end = cache.offset + cache.data.len() as u64;
            if offset >= cache.offset && offset + len as u64 <= cache_end {
                return Some(ReadPlan::CacheHit);
            }
        }
        let fetch_len = (len.max(VFS_CACHE_SIZE) as u32).min(max_op_size as u32);
        Some(ReadPlan::Fetch { offset, len: fetch_len })
    }

    /// Copies from the read cache into `out`. Call only after a `CacheHit`
    /// plan or after [`fill_read_cache`](Self::fill_read_cache).
    pub fn serve_read(&self, handle: usize, offset: u64, out: &mut [u8]) -> usize {
        let Some(slot) = self.handles.get(handle) else {
            return 0;
        };
        let guard = slot.lock();
        let Some(cache) = guard.as_ref().and_then(|s| s.read_cache.as_ref()) else {
            return 0;
        };
        if offset < cache.offset {
            return 0;
        }
        let start = (offset - cache.offset) as usize;
        if start >= cache.data.len() {
            return 0;
        }
        let n = (cache.data.len() - start).min(out.len());
        out[..n].copy_from_slice(&cache.data[start..start + n]);
        n
    }

    pub fn fill_read_cache(&self, handle: usize, offset: u64, data: &[u8]) {
        if let Some(slot) = self.handles.get(handle) {
            if let Some(state) = slot.lock().as_mut() {
                state.read_cache = Some(ReadCache { offset, data: data.to_vec() });
            }
        }
    }

    fn invalidate_read_cache(&self, handle: usize) {
        if let Some(slot) = self.handles.get(handle) {
            if let Some(state) = slot.lock().as_mut() {
                state.read_cache = None;
            }
        }
    }

    /// Buffer a write, coalescing sequential appends up to
    /// [`VFS_CACHE_SIZE`]. Non-sequential writes (or ones that would
    /// overflow the buffer) force an immediate flush of whatever was
    /// pending before the new write is buffered in its place.
    pub fn buffer_write(&self, handle: usize, offset: u64, data: &[u8]) -> WriteDecision {
        self.invalidate_read_cache(handle);
        let Some(slot) = self.handles.get(handle) else {
            return WriteDecision::FlushThenBuffer;
        };
        let mut guard = slot.lock();
        let Some(state) = guard.as_mut() else {
            return WriteDecision::FlushThenBuffer;
        };

        let sequential = state.write_buffer.as_ref().is_some_and(|b| b.offset + b.data.len() as u64 == offset);
        let fits = state.write_buffer.as_ref().is_some_and(|b| b.data.len() + data.len() <= VFS_CACHE_SIZE);

        if sequential && fits {
            state.write_buffer.as_mut().unwrap().data.extend_from_slice(data);
            return WriteDecision::Buffered;
        }

        let had_pending = state.write_buffer.is_some();
        state.write_buffer = Some(WriteBuffer { offset, data: data.to_vec() });
        if had_pending {
            WriteDecision::FlushThenBuffer
        } else {
            WriteDecision::Buffered
        }
    }

    pub fn dir_cache_get(&self, handle: usize, now_ns: u64) -> Option<Vec<u8>> {
        let slot = self.handles.get(handle)?;
        let guard = slot.lock();
        let dir = guard.as_ref()?.dir_cache.as_ref()?;
        if now_ns.saturating_sub(dir.cached_at_ns) <= VFS_DIR_CACHE_STALE_US * 1_000 {
            Some(dir.data.clone())
        } else {
            None
        }
    }

    pub fn dir_cache_put(&self, handle: usize, data: &[u8], now_ns: u64) {
        if let Some(slot) = self.handles.get(handle) {
            if let Some(state) = slot.lock().as_mut() {
                state.dir_cache = Some(DirCache { data: data.to_vec(), cached_at_ns: now_ns });
            }
        }
    }
}

impl Default for VfsProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_attach_claims_a_slot_and_rejects_a_duplicate() {
        let proxy = DeviceProxy::new();
        let req = proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).unwrap();
        assert_eq!(req.resource_id, 7);
        assert!(proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).is_none());
    }

    #[test]
    fn attach_ack_ok_transitions_to_active() {
        let proxy = DeviceProxy::new();
        proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).unwrap();
        proxy.on_attach_ack(
            NodeId(5),
            7,
            &DevAttachAckPayload { status: DevAttachStatus::Ok as u8, assigned_channel: 20, max_op_size: 1400 },
        );
        assert_eq!(proxy.poll_attach(NodeId(5), 7, 0), AttachPoll::Active { channel: 20, max_op_size: 1400 });
    }

    #[test]
    fn attach_ack_rejection_frees_the_slot() {
        let proxy = DeviceProxy::new();
        proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).unwrap();
        proxy.on_attach_ack(
            NodeId(5),
            7,
            &DevAttachAckPayload { status: DevAttachStatus::Busy as u8, assigned_channel: 0, max_op_size: 0 },
        );
        assert_eq!(proxy.poll_attach(NodeId(5), 7, 0), AttachPoll::Rejected(DevAttachStatus::NotFound));
        assert!(proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).is_some());
    }

    #[test]
    fn pending_attach_times_out() {
        let proxy = DeviceProxy::new();
        proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).unwrap();
        let still_waiting = proxy.poll_attach(NodeId(5), 7, 1_000_000_000);
        assert_eq!(still_waiting, AttachPoll::Pending);
        let timed_out = proxy.poll_attach(NodeId(5), 7, ATTACH_TIMEOUT_MS * 1_000_000 + 1);
        assert_eq!(timed_out, AttachPoll::TimedOut);
    }

    #[test]
    fn fencing_tears_down_only_that_peers_attaches() {
        let proxy = DeviceProxy::new();
        proxy.begin_attach(NodeId(5), ResourceType::Block, 7, 0).unwrap();
        proxy.begin_attach(NodeId(6), ResourceType::Block, 8, 0).unwrap();
        let torn_down = proxy.fence_peer(NodeId(5));
        assert_eq!(torn_down, alloc::vec![(ResourceType::Block, 7)]);
        assert!(proxy.active(NodeId(6), 8).is_none());
        assert!(proxy.poll_attach(NodeId(5), 7, 0) == AttachPoll::Rejected(DevAttachStatus::NotFound));
    }

    #[test]
    fn chunk_lba_range_splits_on_max_op_size() {
        let chunks = chunk_lba_range(0, 10, 512, 2048);
        assert_eq!(chunks, alloc::vec![(0, 4), (4, 4), (8, 2)]);
    }

    #[test]
    fn sequential_writes_coalesce_until_the_buffer_is_full() {
        let proxy = VfsProxy::new();
        let handle = proxy.open(42).unwrap();
        assert_eq!(proxy.buffer_write(handle, 0, &[1, 2, 3]), WriteDecision::Buffered);
        assert_eq!(proxy.buffer_write(handle, 3, &[4, 5, 6]), WriteDecision::Buffered);
        assert_eq!(proxy.buffer_write(handle, 100, &[9]), WriteDecision::FlushThenBuffer);
    }

    #[test]
    fn read_plan_hits_cache_after_fill() {
        let proxy = VfsProxy::new();
        let handle = proxy.open(42).unwrap();
        assert_eq!(proxy.plan_read(handle, 0, 10, 1400), Some(ReadPlan::Fetch { offset: 0, len: 1400 }));
        proxy.fill_read_cache(handle, 0, &[0u8; 4096]);
        assert_eq!(proxy.plan_read(handle, 10, 10, 1400), Some(ReadPlan::CacheHit));
    }

    #[test]
    fn write_invalidates_the_read_cache() {
        let proxy = VfsProxy::new();
        let handle = proxy.open(42).unwrap();
        proxy.fill_read_cache(handle, 0, &[0u8; 4096]);
        proxy.buffer_write(handle, 0, &[1, 2, 3]);
        assert_eq!(proxy.plan_read(handle, 0, 10, 1400), Some(ReadPlan::Fetch { offset: 0, len: 1400 }));
    }
}
