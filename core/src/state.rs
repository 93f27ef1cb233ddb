//! The dispatcher's singleton: one instance of every subsystem, plus the
//! `(peer, channel_id)`-keyed [`Channel`] arena that `core` itself owns.
//!
//! Every subsystem crate is peer-agnostic and does no wire I/O of its own
//! (see each crate's own doc comment); `WkiState` is what wires them
//! together behind a single process-wide handle, following the same
//! `OnceLock`-backed singleton idiom `wki_lib::collab` uses for collaborator
//! registration.

use alloc::vec::Vec;

use wki_abi::NodeId;
use wki_channel::{Channel, Priority};
use wki_compute::{LoadReportCache, TaskClient, TaskServer};
use wki_devproxy::DeviceProxy;
use wki_devserver::DeviceServer;
use wki_eventbus::EventBus;
use wki_lib::config::MAX_CHANNELS_TOTAL;
use wki_lib::OnceLock;
use wki_peer::PeerRegistry;
use wki_resource::ResourceRegistry;
use wki_routing::Router;
use wki_transport::Transport;
use wki_zones::ZoneManager;

/// `(peer, channel_id)`-keyed arena of live [`Channel`] engines, probed the
/// same way `wki_resource::ResourceTable` probes its `(owner_node,
/// resource_id)` key: a two-term multiplicative hash picks a start slot,
/// then a full linear scan resolves collisions since neither table carries
/// tombstones.
struct ChannelTable {
    slots: [wki_lib::IrqMutex<Option<Channel>>; MAX_CHANNELS_TOTAL],
    table_lock: wki_lib::IrqMutex<()>,
}

impl ChannelTable {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| wki_lib::IrqMutex::new(None)),
            table_lock: wki_lib::IrqMutex::new(()),
        }
    }

    fn hash_index(peer: NodeId, channel_id: u16) -> usize {
        let h = (peer.0 as u32).wrapping_mul(0x9E37_79B9) ^ (channel_id as u32).wrapping_mul(0x85EB_CA6B);
        (h >> 8) as usize % MAX_CHANNELS_TOTAL
    }

    fn find(&self, peer: NodeId, channel_id: u16) -> Option<usize> {
        let start = Self::hash_index(peer, channel_id);
        for i in 0..MAX_CHANNELS_TOTAL {
            let idx = (start + i) % MAX_CHANNELS_TOTAL;
            if self.slots[idx]
                .lock()
                .as_ref()
                .is_some_and(|c| c.peer_node == peer && c.channel_id == channel_id)
            {
                return Some(idx);
            }
        }
        None
    }

    /// Open a new channel engine, or return the existing slot if one is
    /// already open for this `(peer, channel_id)` (channel-open is
    /// idempotent on both the well-known and dynamic ids).
    fn open(&self, peer: NodeId, channel_id: u16, priority: Priority, initial_rx_credits: u16) -> Option<usize> {
        let _guard = self.table_lock.lock();
        if let Some(idx) = self.find(peer, channel_id) {
            return Some(idx);
        }
        let start = Self::hash_index(peer, channel_id);
        for i in 0..MAX_CHANNELS_TOTAL {
            let idx = (start + i) % MAX_CHANNELS_TOTAL;
            let mut slot = self.slots[idx].lock();
            if slot.is_none() {
                *slot = Some(Channel::new(channel_id, peer, priority, initial_rx_credits));
                return Some(idx);
            }
        }
        None
    }

    fn with_channel<R>(&self, idx: usize, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        self.slots[idx].lock().as_mut().map(f)
    }

    fn close(&self, peer: NodeId, channel_id: u16) {
        if let Some(idx) = self.find(peer, channel_id) {
            *self.slots[idx].lock() = None;
        }
    }

    /// Channel-close step of the fencing cascade: drop every engine open
    /// for `peer`, returning the channel ids that were torn down.
    fn close_all_for_peer(&self, peer: NodeId) -> Vec<u16> {
        let mut closed = Vec::new();
        for slot in &self.slots {
            let mut guard = slot.lock();
            if guard.as_ref().is_some_and(|c| c.peer_node == peer) {
                if let Some(mut channel) = guard.take() {
                    channel.close();
                    closed.push(channel.channel_id);
                }
            }
        }
        closed
    }
}

/// Every live subsystem instance the dispatcher drives. One per booted node;
/// reached through the process-wide [`state`] accessor rather than passed
/// explicitly through every call, the same way the embedding kernel reaches
/// its collaborators through `wki_lib::collab`.
pub struct WkiState {
    pub my_node_id: NodeId,
    /// This node's own link-layer address, supplied by the embedding kernel
    /// at [`init`] time — the generic [`wki_transport::Transport`] surface
    /// the dispatcher holds has no accessor for it (only a concrete driver
    /// like `EthernetTransport` would know), so it is threaded in once here
    /// rather than assumed from a concrete transport type.
    pub my_mac: [u8; 6],
    /// The transport frames are sent/forwarded through. [`wki_transport::Transport::set_rx_handler`]
    /// only accepts a bare `fn(&[u8])` (no closure capture), so the
    /// dispatcher's rx entry point recovers it from here rather than having
    /// it passed in on every call.
    pub transport: &'static dyn Transport,
    pub peers: PeerRegistry,
    pub router: Router,
    pub resources: ResourceRegistry,
    channels: ChannelTable,
    pub devserver: DeviceServer,
    pub devproxy: DeviceProxy,
    pub eventbus: EventBus,
    pub zones: ZoneManager,
    pub compute_client: TaskClient,
    pub compute_server: TaskServer,
    pub load_cache: LoadReportCache,
}

impl WkiState {
    pub fn open_channel(&self, peer: NodeId, channel_id: u16, priority: Priority, initial_rx_credits: u16) -> bool {
        self.channels.open(peer, channel_id, priority, initial_rx_credits).is_some()
    }

    pub fn find_channel(&self, peer: NodeId, channel_id: u16) -> Option<usize> {
        self.channels.find(peer, channel_id)
    }

    pub fn with_channel<R>(&self, idx: usize, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        self.channels.with_channel(idx, f)
    }

    pub fn close_channel(&self, peer: NodeId, channel_id: u16) {
        self.channels.close(peer, channel_id);
    }

    pub fn close_all_channels_for_peer(&self, peer: NodeId) -> Vec<u16> {
        self.channels.close_all_for_peer(peer)
    }

    /// Snapshot every open channel's `(peer, channel_id)` pair, for the
    /// periodic retransmit tick to iterate. Collected up front (rather than
    /// invoking a callback per slot while its lock is held) since the
    /// retransmit tick needs to re-lock each slot by key through
    /// `find_channel`/`with_channel` as it goes.
    pub fn open_channel_keys(&self) -> Vec<(NodeId, u16)> {
        let mut keys = Vec::new();
        for slot in &self.channels.slots {
            if let Some(channel) = slot.lock().as_ref() {
                keys.push((channel.peer_node, channel.channel_id));
            }
        }
        keys
    }
}

static STATE: OnceLock<WkiState> = OnceLock::new();

/// Bring up the singleton and register the fencing cascade. Must be called
/// exactly once, before the first frame is dispatched or tick is run. The
/// caller is expected to register [`crate::dispatch::on_frame_received`]
/// with `transport.set_rx_handler` right after this returns.
pub fn init(my_node_id: NodeId, my_mac: [u8; 6], transport: &'static dyn Transport) {
    STATE.call_once(|| WkiState {
        my_node_id,
        my_mac,
        transport,
        peers: PeerRegistry::new(my_node_id),
        router: Router::new(my_node_id),
        resources: ResourceRegistry::new(my_node_id),
        channels: ChannelTable::new(),
        devserver: DeviceServer::new(),
        devproxy: DeviceProxy::new(),
        eventbus: EventBus::new(my_node_id),
        zones: ZoneManager::new(my_node_id),
        compute_client: TaskClient::new(),
        compute_server: TaskServer::new(),
        load_cache: LoadReportCache::new(),
    });
    crate::fence::register_all();
}

pub fn state() -> &'static WkiState {
    STATE.get().expect("wki_core::state::init not called before use")
}
