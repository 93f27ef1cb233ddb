//! The fencing cascade (spec §3.3): nine [`FenceHandler`] wrappers
//! registered with `wki_peer::PeerRegistry` in the exact order its own
//! `MAX_FENCE_HANDLERS` doc comment prescribes, each delegating to the
//! subsystem that actually owns the per-peer state being torn down.
//!
//! Three steps below are deliberate no-ops: nothing in this workspace keeps
//! a separate per-peer table for them, because the state they'd clean up is
//! already reachable only through a devserver/devproxy binding that an
//! earlier step in the same cascade has just cleared. They stay as
//! registered handlers (occupying their cascade slot) rather than being
//! skipped, so the slot ordering matches the spec even though the body is
//! empty.

use wki_abi::NodeId;
use wki_lib::collab::phys_allocator;
use wki_lib::config::ZONE_PAGE_SIZE;
use wki_lib::klog_debug;
use wki_peer::FenceHandler;

use crate::state::state;

struct EventBusFence;
impl FenceHandler for EventBusFence {
    fn on_peer_fenced(&self, node: NodeId) {
        state().eventbus.fence_peer(node);
    }
}

struct IrqForwardFence;
impl FenceHandler for IrqForwardFence {
    fn on_peer_fenced(&self, _node: NodeId) {
        // No dedicated IRQ-forwarding-binding table exists: every
        // DEV_IRQ_FWD target is reached through a devserver binding, torn
        // down by the device-server detach-all step that follows.
    }
}

struct DevServerFence;
impl FenceHandler for DevServerFence {
    fn on_peer_fenced(&self, node: NodeId) {
        let torn_down = state().devserver.detach_all_for_peer(node);
        klog_debug!("fence[{}]: devserver detached {} binding(s)", node.0, torn_down.len());
    }
}

struct DevProxyFence;
impl FenceHandler for DevProxyFence {
    fn on_peer_fenced(&self, node: NodeId) {
        let torn_down = state().devproxy.fence_peer(node);
        klog_debug!("fence[{}]: devproxy aborted {} attach(es)", node.0, torn_down.len());
    }
}

struct VfsProxyFence;
impl FenceHandler for VfsProxyFence {
    fn on_peer_fenced(&self, _node: NodeId) {
        // Open remote-VFS handles carry no peer tag of their own; every one
        // rides on a devproxy Vfs attach already aborted above.
    }
}

struct NicProxyFence;
impl FenceHandler for NicProxyFence {
    fn on_peer_fenced(&self, _node: NodeId) {
        // NIC proxy statistics are cached per devproxy Net attach, already
        // cleared by the device-proxy detach-all step above.
    }
}

struct ComputeFence;
impl FenceHandler for ComputeFence {
    fn on_peer_fenced(&self, node: NodeId) {
        let st = state();
        let unblocked = st.compute_client.fence_peer(node);
        let killed = st.compute_server.fence_origin(node);
        st.load_cache.fence_peer(node);
        klog_debug!(
            "fence[{}]: compute unblocked {} submit(s), killed {} remote task(s)",
            node.0,
            unblocked.len(),
            killed.len()
        );
    }
}

struct ZoneFence;
impl FenceHandler for ZoneFence {
    fn on_peer_fenced(&self, node: NodeId) {
        for teardown in state().zones.destroy_all_for_peer(node) {
            if teardown.is_rdma {
                continue;
            }
            if let Some(phys) = phys_allocator() {
                let pages = (teardown.size as u64).div_ceil(ZONE_PAGE_SIZE as u64) as usize;
                phys.free_pages(teardown.phys_addr, pages);
            }
        }
    }
}

struct ChannelFence;
impl FenceHandler for ChannelFence {
    fn on_peer_fenced(&self, node: NodeId) {
        let closed = state().close_all_channels_for_peer(node);
        klog_debug!("fence[{}]: closed {} channel(s)", node.0, closed.len());
    }
}

static EVENT_BUS_FENCE: EventBusFence = EventBusFence;
static IRQ_FORWARD_FENCE: IrqForwardFence = IrqForwardFence;
static DEV_SERVER_FENCE: DevServerFence = DevServerFence;
static DEV_PROXY_FENCE: DevProxyFence = DevProxyFence;
static VFS_PROXY_FENCE: VfsProxyFence = VfsProxyFence;
static NIC_PROXY_FENCE: NicProxyFence = NicProxyFence;
static COMPUTE_FENCE: ComputeFence = ComputeFence;
static ZONE_FENCE: ZoneFence = ZoneFence;
static CHANNEL_FENCE: ChannelFence = ChannelFence;

/// Register every cascade step, in spec §3.3 order. Called once from
/// [`crate::state::init`].
pub(crate) fn register_all() {
    let peers = &state().peers;
    peers.register_fence_handler(&EVENT_BUS_FENCE);
    peers.register_fence_handler(&IRQ_FORWARD_FENCE);
    peers.register_fence_handler(&DEV_SERVER_FENCE);
    peers.register_fence_handler(&DEV_PROXY_FENCE);
    peers.register_fence_handler(&VFS_PROXY_FENCE);
    peers.register_fence_handler(&NIC_PROXY_FENCE);
    peers.register_fence_handler(&COMPUTE_FENCE);
    peers.register_fence_handler(&ZONE_FENCE);
    peers.register_fence_handler(&CHANNEL_FENCE);
}
