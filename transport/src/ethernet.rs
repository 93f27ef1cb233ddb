//! Ethernet transport: EtherType 0x88B7, neighbor table populated from HELLO.

use wki_abi::{NodeId, WkiError, WkiResult};
use wki_lib::IrqMutex;
use wki_lib::collab::LinkDriver;
use wki_lib::config::MAX_PEERS;

use crate::{Transport, WKI_ETH_MAX_PAYLOAD};

/// EtherType reserved for WKI frames.
pub const ETHERTYPE_WKI: u16 = 0x88B7;
const ETH_HEADER_LEN: usize = 14;
const BROADCAST_MAC: [u8; 6] = [0xff; 6];

#[derive(Clone, Copy)]
struct NeighborEntry {
    node_id: NodeId,
    mac: [u8; 6],
}

struct NeighborTable {
    entries: [Option<NeighborEntry>; MAX_PEERS],
}

impl NeighborTable {
    const fn new() -> Self {
        Self {
            entries: [None; MAX_PEERS],
        }
    }

    fn lookup(&self, node_id: NodeId) -> Option<[u8; 6]> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.node_id == node_id)
            .map(|e| e.mac)
    }

    fn learn(&mut self, node_id: NodeId, mac: [u8; 6]) {
        if let Some(slot) = self.entries.iter_mut().flatten().find(|e| e.node_id == node_id) {
            slot.mac = mac;
            return;
        }
        if let Some(slot) = self.entries.iter_mut().find(|s| s.is_none()) {
            *slot = Some(NeighborEntry { node_id, mac });
        }
    }

    fn forget(&mut self, node_id: NodeId) {
        for slot in self.entries.iter_mut() {
            if slot.is_some_and(|e| e.node_id == node_id) {
                *slot = None;
            }
        }
    }
}

/// Ethernet link transport. One instance per NIC driver instance.
pub struct EthernetTransport {
    driver: &'static dyn LinkDriver,
    neighbors: IrqMutex<NeighborTable>,
}

impl EthernetTransport {
    pub const fn new(driver: &'static dyn LinkDriver) -> Self {
        Self {
            driver,
            neighbors: IrqMutex::new(NeighborTable::new()),
        }
    }

    /// Record (or refresh) a node's MAC address, called by the peer
    /// registry on HELLO receipt.
    pub fn learn_neighbor(&self, node_id: NodeId, mac: [u8; 6]) {
        self.neighbors.lock().learn(node_id, mac);
    }

    /// Drop a neighbor's entry, called during fencing.
    pub fn forget_neighbor(&self, node_id: NodeId) {
        self.neighbors.lock().forget(node_id);
    }

    /// Resolve a node id to its MAC address via the neighbor table.
    pub fn lookup_mac(&self, node_id: NodeId) -> Option<[u8; 6]> {
        self.neighbors.lock().lookup(node_id)
    }
}

impl Transport for EthernetTransport {
    fn mtu(&self) -> usize {
        self.driver
            .mtu()
            .saturating_sub(ETH_HEADER_LEN)
            .min(WKI_ETH_MAX_PAYLOAD)
    }

    fn rdma_capable(&self) -> bool {
        false
    }

    fn tx(&self, neighbor_mac: [u8; 6], frame: &[u8]) -> WkiResult<()> {
        if frame.len() > self.mtu() {
            return Err(WkiError::InvalidArgument);
        }
        self.driver.send(neighbor_mac, frame)
    }

    fn tx_broadcast(&self, frame: &[u8]) -> WkiResult<()> {
        self.driver.send(BROADCAST_MAC, frame)
    }

    fn set_rx_handler(&self, handler: fn(&[u8])) {
        self.driver.set_rx_callback(handler);
    }
}
