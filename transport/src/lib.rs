//! Transport adapters (spec §4.B).
//!
//! A transport abstracts one link instance into `tx`/`rx` plus, for
//! RDMA-capable links, region registration and remote read/write/doorbell.
//! The channel engine and zone code depend only on the [`Transport`] trait;
//! `ethernet` and `shmem` are the two concrete implementations required.

#![no_std]

extern crate alloc;

pub mod ethernet;
pub mod shmem;

use wki_abi::WkiResult;

/// Default Ethernet-transport MTU: 9000-byte jumbo frame minus 14-byte
/// Ethernet header minus the 32-byte WKI wire header.
pub const WKI_ETH_MAX_PAYLOAD: usize = 8954;

/// One link instance the channel engine can send frames through.
pub trait Transport: Send + Sync {
    /// Maximum WKI payload (header excluded) this transport can carry in
    /// one frame.
    fn mtu(&self) -> usize;

    /// `true` if this transport supports `register_region`/`rdma_read`/
    /// `rdma_write`/`doorbell`.
    fn rdma_capable(&self) -> bool;

    /// Transmit a raw, fully-assembled WKI frame to a direct neighbor.
    fn tx(&self, neighbor_mac: [u8; 6], frame: &[u8]) -> WkiResult<()>;

    /// Transmit to every reachable neighbor (HELLO broadcast, FENCE_NOTIFY).
    fn tx_broadcast(&self, frame: &[u8]) -> WkiResult<()>;

    /// Install the single RX callback invoked for each frame this transport
    /// receives. A second call replaces the first.
    fn set_rx_handler(&self, handler: fn(&[u8]));

    /// Register a physical region for remote RDMA access, returning an
    /// rkey. Only meaningful when [`rdma_capable`](Transport::rdma_capable).
    fn register_region(&self, _phys: u64, _size: usize) -> Option<u32> {
        None
    }

    /// Read `local_buf.len()` bytes from `remote_offset` in the region
    /// named by `rkey` on `neighbor_mac`.
    fn rdma_read(
        &self,
        _neighbor_mac: [u8; 6],
        _rkey: u32,
        _remote_offset: u64,
        _local_buf: &mut [u8],
    ) -> WkiResult<()> {
        Err(wki_abi::WkiError::InvalidArgument)
    }

    /// Write `local_buf` to `remote_offset` in the region named by `rkey`
    /// on `neighbor_mac`.
    fn rdma_write(
        &self,
        _neighbor_mac: [u8; 6],
        _rkey: u32,
        _remote_offset: u64,
        _local_buf: &[u8],
    ) -> WkiResult<()> {
        Err(wki_abi::WkiError::InvalidArgument)
    }

    /// Ring the peer's doorbell (used for IRQ-forwarding over a zone pool).
    fn doorbell(&self, _neighbor_mac: [u8; 6], _value: u32) -> WkiResult<()> {
        Err(wki_abi::WkiError::InvalidArgument)
    }
}
