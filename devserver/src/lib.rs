//! Device-server: binds consumer attach requests to local resources and
//! dispatches device ops against them (spec §4.G).
//!
//! `DeviceServer` owns the binding table keyed by `(consumer, channel)`. It
//! has no opinion about wire framing: callers decode `DEV_ATTACH_REQ`/
//! `DEV_OP_REQ` payloads and pass the fields in; [`DeviceServer`] returns an
//! outcome the caller encodes back onto the wire. The actual device I/O goes
//! through the `BlockRegistry`/`NetRegistry`/`VfsRegistry` collaborators
//! registered by the embedding kernel.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::payload::DevAttachReqPayload;
use wki_abi::{NodeId, ResourceType, WkiError};
use wki_lib::collab;
use wki_lib::config::{MAX_CHANNELS_PER_PEER, MAX_DEV_BINDINGS};
use wki_lib::IrqMutex;
use wki_resource::ResourceRegistry;

/// Device-op ids, namespaced by resource type, matching `wki_abi::opcode::DeviceOp`.
pub use wki_abi::opcode::DeviceOp;

const DYNAMIC_CHANNEL_BASE: u16 = wki_abi::ChannelId::DYNAMIC_BASE;

#[derive(Debug, Clone, Copy)]
struct Binding {
    consumer: NodeId,
    channel: u16,
    resource_type: ResourceType,
    resource_id: u32,
    accept_multicast: bool,
    accept_broadcast: bool,
}

/// Outcome of a `DEV_ATTACH_REQ`, mirroring `DevAttachStatus` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Ok { channel: u16, max_op_size: u16 },
    NotFound,
    NotRemotable,
    Busy,
}

/// Outcome of a `DEV_OP_REQ` dispatch. `data_len` is how much of the
/// caller-supplied `out` buffer device-server wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpOutcome {
    pub status: i16,
    pub data_len: usize,
}

impl OpOutcome {
    const OK: i16 = 0;

    fn ok(data_len: usize) -> Self {
        Self { status: Self::OK, data_len }
    }

    fn err(e: WkiError) -> Self {
        Self { status: status_code(e), data_len: 0 }
    }
}

/// Maps `WkiError` to a small negative `DEV_OP_RESP::status` code. Not a
/// wire-frozen mapping (no spec component assigns numbers to these) — just
/// distinct non-zero values so a caller logging a failure can tell them
/// apart without decoding a string.
fn status_code(e: WkiError) -> i16 {
    match e {
        WkiError::NotFound => -1,
        WkiError::Busy => -2,
        WkiError::InvalidArgument => -3,
        WkiError::TxFailed => -4,
        WkiError::NoMemory => -5,
        _ => -127,
    }
}

pub struct DeviceServer {
    bindings: [IrqMutex<Option<Binding>>; MAX_DEV_BINDINGS],
    table_lock: IrqMutex<()>,
}

impl DeviceServer {
    pub fn new() -> Self {
        Self {
            bindings: core::array::from_fn(|_| IrqMutex::new(None)),
            table_lock: IrqMutex::new(()),
        }
    }

    fn find_index(&self, consumer: NodeId, channel: u16) -> Option<usize> {
        self.bindings
            .iter()
            .position(|slot| slot.lock().as_ref().is_some_and(|b| b.consumer == consumer && b.channel == channel))
    }

    /// Claim the lowest free dynamic channel id for `consumer` and store the
    /// binding, all under one lock so two concurrent attaches from the same
    /// consumer can't race onto the same id.
    fn reserve(&self, consumer: NodeId, resource_type: ResourceType, resource_id: u32) -> Option<u16> {
        let _guard = self.table_lock.lock();
        'candidate: for offset in 0..MAX_CHANNELS_PER_PEER as u16 {
            let channel = DYNAMIC_CHANNEL_BASE + offset;
            for slot in &self.bindings {
                if slot.lock().as_ref().is_some_and(|b| b.consumer == consumer && b.channel == channel) {
                    continue 'candidate;
                }
            }
            for slot in &self.bindings {
                let mut guard = slot.lock();
                if guard.is_none() {
                    *guard = Some(Binding {
                        consumer,
                        channel,
                        resource_type,
                        resource_id,
                        accept_multicast: false,
                        accept_broadcast: false,
                    });
                    return Some(channel);
                }
            }
            return None;
        }
        None
    }

    fn release(&self, consumer: NodeId, channel: u16) -> Option<Binding> {
        let idx = self.find_index(consumer, channel)?;
        self.bindings[idx].lock().take()
    }

    /// Handle `DEV_ATTACH_REQ` (spec §4.G steps 1-6). `max_op_size` is
    /// supplied by the caller, already negotiated against the transport MTU
    /// reaching `consumer` — device-server has no transport of its own.
    pub fn handle_attach_req(&self, consumer: NodeId, req: &DevAttachReqPayload, resources: &ResourceRegistry, max_op_size: u16) -> AttachOutcome {
        let Some(ad) = resources.lookup_local(req.resource_id) else {
            return AttachOutcome::NotFound;
        };
        if ad.resource_type as u16 != req.resource_type {
            return AttachOutcome::NotFound;
        }

        if !can_remote(ad.resource_type, req.resource_id) {
            return AttachOutcome::NotRemotable;
        }

        let Some(channel) = self.reserve(consumer, ad.resource_type, req.resource_id) else {
            return AttachOutcome::Busy;
        };

        if !on_remote_attach(ad.resource_type, req.resource_id) {
            self.release(consumer, channel);
            return AttachOutcome::Busy;
        }

        AttachOutcome::Ok { channel, max_op_size }
    }

    /// Handle `DEV_DETACH`.
    pub fn handle_detach(&self, consumer: NodeId, channel: u16) {
        if let Some(binding) = self.release(consumer, channel) {
            on_remote_detach(binding.resource_type, binding.resource_id);
        }
    }

    /// Handle `DEV_OP_REQ` on an already-bound `(consumer, channel)`.
    pub fn handle_op_req(&self, consumer: NodeId, channel: u16, op: DeviceOp, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some(idx) = self.find_index(consumer, channel) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        let Some(binding) = *self.bindings[idx].lock() else {
            return OpOutcome::err(WkiError::NotFound);
        };

        match (binding.resource_type, op) {
            (ResourceType::Block, DeviceOp::BlockRead) => self.dispatch_block_read(binding.resource_id, data, out),
            (ResourceType::Block, DeviceOp::BlockWrite) => self.dispatch_block_write(binding.resource_id, data),
            (ResourceType::Block, DeviceOp::BlockFlush) => self.dispatch_block_flush(binding.resource_id),
            (ResourceType::Block, DeviceOp::BlockInfo) => self.dispatch_block_info(binding.resource_id, out),

            (ResourceType::Net, DeviceOp::NetSend) => self.dispatch_net_send(binding.resource_id, data),
            (ResourceType::Net, DeviceOp::NetSetFilter) => {
                self.dispatch_net_set_filter(idx, data);
                OpOutcome::ok(0)
            }
            (ResourceType::Net, DeviceOp::NetGetStats) => self.dispatch_net_get_stats(binding.resource_id, out),

            (ResourceType::Vfs, DeviceOp::VfsLookup) => self.dispatch_vfs_lookup(binding.resource_id, data, out),
            (ResourceType::Vfs, DeviceOp::VfsGetattr) => self.dispatch_vfs_getattr(binding.resource_id, data, out),
            (ResourceType::Vfs, DeviceOp::VfsSetattr) => self.dispatch_vfs_setattr(binding.resource_id, data),
            (ResourceType::Vfs, DeviceOp::VfsRead) => self.dispatch_vfs_read(binding.resource_id, data, out),
            (ResourceType::Vfs, DeviceOp::VfsWrite) => self.dispatch_vfs_write(binding.resource_id, data),
            (ResourceType::Vfs, DeviceOp::VfsCreate) => self.dispatch_vfs_create(binding.resource_id, data, out),
            (ResourceType::Vfs, DeviceOp::VfsUnlink) => self.dispatch_vfs_unlink(binding.resource_id, data),
            (ResourceType::Vfs, DeviceOp::VfsReaddir) => self.dispatch_vfs_readdir(binding.resource_id, data, out),

            _ => OpOutcome::err(WkiError::InvalidArgument),
        }
    }

    fn dispatch_block_read(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some((lba, len)) = decode_block_req(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(dev) = collab::block_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        let len = (len as usize).min(out.len());
        match dev.read(lba, &mut out[..len]) {
            Ok(()) => OpOutcome::ok(len),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_block_write(&self, resource_id: u32, data: &[u8]) -> OpOutcome {
        if data.len() < 8 {
            return OpOutcome::err(WkiError::InvalidArgument);
        }
        let lba = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let Some(dev) = collab::block_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match dev.write(lba, &data[8..]) {
            Ok(()) => OpOutcome::ok(0),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_block_flush(&self, resource_id: u32) -> OpOutcome {
        let Some(dev) = collab::block_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match dev.flush() {
            Ok(()) => OpOutcome::ok(0),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_block_info(&self, resource_id: u32, out: &mut [u8]) -> OpOutcome {
        let Some(dev) = collab::block_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        if out.len() < 12 {
            return OpOutcome::err(WkiError::InvalidArgument);
        }
        out[0..4].copy_from_slice(&dev.block_size().to_le_bytes());
        out[4..12].copy_from_slice(&dev.total_blocks().to_le_bytes());
        OpOutcome::ok(12)
    }

    fn dispatch_net_send(&self, resource_id: u32, data: &[u8]) -> OpOutcome {
        let Some(dev) = collab::net_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match dev.xmit(data) {
            Ok(()) => OpOutcome::ok(0),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_net_set_filter(&self, idx: usize, data: &[u8]) {
        let flags = data.first().copied().unwrap_or(0);
        if let Some(binding) = self.bindings[idx].lock().as_mut() {
            binding.accept_multicast = flags & 0x01 != 0;
            binding.accept_broadcast = flags & 0x02 != 0;
        }
    }

    fn dispatch_net_get_stats(&self, resource_id: u32, out: &mut [u8]) -> OpOutcome {
        let Some(dev) = collab::net_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        if out.len() < 48 {
            return OpOutcome::err(WkiError::InvalidArgument);
        }
        let stats = dev.stats();
        out[0..8].copy_from_slice(&stats.rx_packets.to_le_bytes());
        out[8..16].copy_from_slice(&stats.tx_packets.to_le_bytes());
        out[16..24].copy_from_slice(&stats.rx_bytes.to_le_bytes());
        out[24..32].copy_from_slice(&stats.tx_bytes.to_le_bytes());
        out[32..40].copy_from_slice(&stats.rx_errors.to_le_bytes());
        out[40..48].copy_from_slice(&stats.tx_errors.to_le_bytes());
        OpOutcome::ok(48)
    }

    fn dispatch_vfs_lookup(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some((parent, name)) = decode_vfs_parent_name(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.lookup(parent, name) {
            Ok(inode) if out.len() >= 8 => {
                out[0..8].copy_from_slice(&inode.to_le_bytes());
                OpOutcome::ok(8)
            }
            Ok(_) => OpOutcome::err(WkiError::InvalidArgument),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_getattr(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some(inode) = decode_u64(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.getattr(inode, out) {
            Ok(len) => OpOutcome::ok(len),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_setattr(&self, resource_id: u32, data: &[u8]) -> OpOutcome {
        if data.len() < 8 {
            return OpOutcome::err(WkiError::InvalidArgument);
        }
        let inode = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.setattr(inode, &data[8..]) {
            Ok(()) => OpOutcome::ok(0),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_read(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some((inode, offset, len)) = decode_vfs_rw_req(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        let len = (len as usize).min(out.len());
        match fs.read(inode, offset, &mut out[..len]) {
            Ok(n) => OpOutcome::ok(n),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_write(&self, resource_id: u32, data: &[u8]) -> OpOutcome {
        if data.len() < 16 {
            return OpOutcome::err(WkiError::InvalidArgument);
        }
        let inode = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let offset = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.write(inode, offset, &data[16..]) {
            Ok(n) => OpOutcome::ok(n),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_create(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some((parent, name)) = decode_vfs_parent_name(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.create(parent, name) {
            Ok(inode) if out.len() >= 8 => {
                out[0..8].copy_from_slice(&inode.to_le_bytes());
                OpOutcome::ok(8)
            }
            Ok(_) => OpOutcome::err(WkiError::InvalidArgument),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_unlink(&self, resource_id: u32, data: &[u8]) -> OpOutcome {
        let Some((parent, name)) = decode_vfs_parent_name(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.unlink(parent, name) {
            Ok(()) => OpOutcome::ok(0),
            Err(e) => OpOutcome::err(e),
        }
    }

    fn dispatch_vfs_readdir(&self, resource_id: u32, data: &[u8], out: &mut [u8]) -> OpOutcome {
        let Some(inode) = decode_u64(data) else {
            return OpOutcome::err(WkiError::InvalidArgument);
        };
        let Some(fs) = collab::vfs_registry().and_then(|r| r.lookup(resource_id)) else {
            return OpOutcome::err(WkiError::NotFound);
        };
        match fs.readdir(inode, out) {
            Ok(len) => OpOutcome::ok(len),
            Err(e) => OpOutcome::err(e),
        }
    }

    /// Bindings matching a NIC resource's RX-forward hook: deliver to every
    /// consumer accepting this frame's destination class (spec §4.G step 5 —
    /// unicast always forwarded, multicast/broadcast opt-in per binding).
    pub fn nic_rx_targets(&self, resource_id: u32, is_multicast: bool, is_broadcast: bool) -> Vec<(NodeId, u16)> {
        let mut targets = Vec::new();
        for slot in &self.bindings {
            if let Some(b) = slot.lock().as_ref() {
                if b.resource_type != ResourceType::Net || b.resource_id != resource_id {
                    continue;
                }
                let accept = if is_broadcast {
                    b.accept_broadcast
                } else if is_multicast {
                    b.accept_multicast
                } else {
                    true
                };
                if accept {
                    targets.push((b.consumer, b.channel));
                }
            }
        }
        targets
    }

    /// Fencing cascade step: detach every binding the fenced peer held.
    /// Returns the resources touched so the caller can decide whether to
    /// log per-resource cleanup.
    pub fn detach_all_for_peer(&self, consumer: NodeId) -> Vec<(ResourceType, u32)> {
        let mut detached = Vec::new();
        for slot in &self.bindings {
            let taken = {
                let mut guard = slot.lock();
                if guard.is_some_and(|b| b.consumer == consumer) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(b) = taken {
                on_remote_detach(b.resource_type, b.resource_id);
                detached.push((b.resource_type, b.resource_id));
            }
        }
        detached
    }
}

impl Default for DeviceServer {
    fn default() -> Self {
        Self::new()
    }
}

fn can_remote(resource_type: ResourceType, resource_id: u32) -> bool {
    match resource_type {
        ResourceType::Block => collab::block_registry().is_some_and(|r| r.can_remote(resource_id)),
        ResourceType::Net => collab::net_registry().is_some_and(|r| r.can_remote(resource_id)),
        ResourceType::Vfs => collab::vfs_registry().is_some_and(|r| r.can_remote(resource_id)),
        _ => false,
    }
}

fn on_remote_attach(resource_type: ResourceType, resource_id: u32) -> bool {
    match resource_type {
        ResourceType::Block => collab::block_registry().is_some_and(|r| r.on_remote_attach(resource_id)),
        ResourceType::Net => collab::net_registry().is_some_and(|r| r.on_remote_attach(resource_id)),
        ResourceType::Vfs => collab::vfs_registry().is_some_and(|r| r.on_remote_attach(resource_id)),
        _ => false,
    }
}

fn on_remote_detach(resource_type: ResourceType, resource_id: u32) {
    match resource_type {
        ResourceType::Block => {
            if let Some(r) = collab::block_registry() {
                r.on_remote_detach(resource_id);
            }
        }
        ResourceType::Net => {
            if let Some(r) = collab::net_registry() {
                r.on_remote_detach(resource_id);
            }
        }
        ResourceType::Vfs => {
            if let Some(r) = collab::vfs_registry() {
                r.on_remote_detach(resource_id);
            }
        }
        _ => {}
    }
}

fn decode_u64(data: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(0..8)?.try_into().ok()?))
}

fn decode_block_req(data: &[u8]) -> Option<(u64, u32)> {
    if data.len() < 12 {
        return None;
    }
    let lba = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let len = u32::from_le_bytes(data[8..12].try_into().ok()?);
    Some((lba, len))
}

fn decode_vfs_rw_req(data: &[u8]) -> Option<(u64, u64, u32)> {
    if data.len() < 20 {
        return None;
    }
    let inode = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let offset = u64::from_le_bytes(data[8..16].try_into().ok()?);
    let len = u32::from_le_bytes(data[16..20].try_into().ok()?);
    Some((inode, offset, len))
}

fn decode_vfs_parent_name(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let parent = u64::from_le_bytes(data[0..8].try_into().ok()?);
    Some((parent, &data[8..]))
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use wki_abi::ResourceType as RT;

    struct FakeBlock;
    impl wki_lib::collab::BlockDevice for FakeBlock {
        fn block_size(&self) -> u32 {
            512
        }
        fn total_blocks(&self) -> u64 {
            1000
        }
        fn read(&self, _lba: u64, buf: &mut [u8]) -> wki_abi::WkiResult<()> {
            buf.fill(0xAB);
            Ok(())
        }
        fn write(&self, _lba: u64, _buf: &[u8]) -> wki_abi::WkiResult<()> {
            Ok(())
        }
        fn flush(&self) -> wki_abi::WkiResult<()> {
            Ok(())
        }
    }

    struct FakeBlockRegistry;
    impl wki_lib::collab::BlockRegistry for FakeBlockRegistry {
        fn can_remote(&self, resource_id: u32) -> bool {
            resource_id == 7
        }
        fn on_remote_attach(&self, _resource_id: u32) -> bool {
            true
        }
        fn on_remote_detach(&self, _resource_id: u32) {}
        fn lookup(&self, resource_id: u32) -> Option<&'static dyn wki_lib::collab::BlockDevice> {
            if resource_id == 7 {
                Some(&FakeBlock)
            } else {
                None
            }
        }
    }

    fn setup() -> (DeviceServer, ResourceRegistry) {
        wki_lib::collab::register_block_registry(Box::leak(Box::new(FakeBlockRegistry)));
        let server = DeviceServer::new();
        let resources = ResourceRegistry::new(NodeId(1));
        resources.advertise_local(RT::Block, 7, b"disk0", wki_resource::FLAG_SHAREABLE);
        (server, resources)
    }

    #[test]
    fn attach_unknown_resource_is_not_found() {
        let (server, resources) = setup();
        let req = DevAttachReqPayload {
            target_node: 1,
            resource_type: RT::Block as u16,
            resource_id: 999,
            attach_mode: 0,
            requested_channel: 0,
        };
        assert_eq!(server.handle_attach_req(NodeId(2), &req, &resources, 1400), AttachOutcome::NotFound);
    }

    #[test]
    fn attach_known_block_resource_succeeds_and_assigns_dynamic_channel() {
        let (server, resources) = setup();
        let req = DevAttachReqPayload {
            target_node: 1,
            resource_type: RT::Block as u16,
            resource_id: 7,
            attach_mode: 0,
            requested_channel: 0,
        };
        let outcome = server.handle_attach_req(NodeId(2), &req, &resources, 1400);
        match outcome {
            AttachOutcome::Ok { channel, max_op_size } => {
                assert!(channel >= wki_abi::ChannelId::DYNAMIC_BASE);
                assert_eq!(max_op_size, 1400);
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn block_read_dispatches_through_the_registered_device() {
        let (server, resources) = setup();
        let req = DevAttachReqPayload {
            target_node: 1,
            resource_type: RT::Block as u16,
            resource_id: 7,
            attach_mode: 0,
            requested_channel: 0,
        };
        let AttachOutcome::Ok { channel, .. } = server.handle_attach_req(NodeId(2), &req, &resources, 1400) else {
            panic!("attach failed");
        };

        let mut req_bytes = [0u8; 12];
        req_bytes[0..8].copy_from_slice(&0u64.to_le_bytes());
        req_bytes[8..12].copy_from_slice(&16u32.to_le_bytes());
        let mut out = [0u8; 16];
        let outcome = server.handle_op_req(NodeId(2), channel, DeviceOp::BlockRead, &req_bytes, &mut out);
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.data_len, 16);
        assert!(out.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn op_req_on_unbound_channel_is_not_found() {
        let (server, _resources) = setup();
        let outcome = server.handle_op_req(NodeId(2), 999, DeviceOp::BlockFlush, &[], &mut []);
        assert_eq!(outcome.status, status_code(WkiError::NotFound));
    }

    #[test]
    fn detaching_frees_the_binding() {
        let (server, resources) = setup();
        let req = DevAttachReqPayload {
            target_node: 1,
            resource_type: RT::Block as u16,
            resource_id: 7,
            attach_mode: 0,
            requested_channel: 0,
        };
        let AttachOutcome::Ok { channel, .. } = server.handle_attach_req(NodeId(2), &req, &resources, 1400) else {
            panic!("attach failed");
        };
        server.handle_detach(NodeId(2), channel);
        let outcome = server.handle_op_req(NodeId(2), channel, DeviceOp::BlockFlush, &[], &mut []);
        assert_eq!(outcome.status, status_code(WkiError::NotFound));
    }

    #[test]
    fn fencing_detaches_every_binding_for_that_consumer_only() {
        let (server, resources) = setup();
        let req = DevAttachReqPayload {
            target_node: 1,
            resource_type: RT::Block as u16,
            resource_id: 7,
            attach_mode: 0,
            requested_channel: 0,
        };
        server.handle_attach_req(NodeId(2), &req, &resources, 1400);
        server.handle_attach_req(NodeId(3), &req, &resources, 1400);

        let detached = server.detach_all_for_peer(NodeId(2));
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0], (RT::Block, 7));
    }
}
