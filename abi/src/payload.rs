//! Fixed-layout message payloads that follow a [`WireHeader`](crate::wire::WireHeader).
//!
//! Every payload is little-endian and hand-encoded/decoded (no `transmute`,
//! no `repr(packed)` reads) since several fields are not naturally aligned
//! once concatenated after the 32-byte header. Variable-length payloads
//! borrow their tail rather than copying it.

use crate::wire::WireError;

type Result<T> = core::result::Result<T, WireError>;

/// Magic value identifying a [`HelloPayload`] (`"WKI\0"`).
pub const HELLO_MAGIC: u32 = 0x574B_4900;

/// Minimal local `bitflags!`-style macro so this crate doesn't pull a second
/// copy of the `bitflags` derive machinery just for two small flag sets.
macro_rules! bitflags_like {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $variant:ident = $val:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $variant: $name = $name($val);)*
            pub const fn empty() -> Self { $name(0) }
            pub const fn bits(self) -> $ty { self.0 }
            pub const fn contains(self, other: Self) -> bool { (self.0 & other.0) == other.0 }
            pub const fn union(self, other: Self) -> Self { $name(self.0 | other.0) }
        }
    };
}

bitflags_like! {
    /// `HelloPayload::capabilities` bits.
    pub struct HelloCaps: u16 {
        const RDMA_SUPPORT = 0x0001;
        const ZONE_SUPPORT = 0x0002;
    }
}

fn require(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        Err(WireError::Truncated)
    } else {
        Ok(())
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}
fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
fn i32_at(buf: &[u8], off: usize) -> i32 {
    u32_at(buf, off) as i32
}
fn i16_at(buf: &[u8], off: usize) -> i16 {
    u16_at(buf, off) as i16
}

/// HELLO / HELLO_ACK body (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPayload {
    pub magic: u32,
    pub protocol_version: u16,
    pub node_id: u16,
    pub mac_addr: [u8; 6],
    pub capabilities: HelloCaps,
    pub heartbeat_interval_ms: u16,
    pub max_channels: u16,
    pub rdma_zone_bitmap: u32,
}

impl HelloPayload {
    pub const LEN: usize = 32;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::LEN);
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.protocol_version.to_le_bytes());
        out[6..8].copy_from_slice(&self.node_id.to_le_bytes());
        out[8..14].copy_from_slice(&self.mac_addr);
        out[14..16].copy_from_slice(&self.capabilities.bits().to_le_bytes());
        out[16..18].copy_from_slice(&self.heartbeat_interval_ms.to_le_bytes());
        out[18..20].copy_from_slice(&self.max_channels.to_le_bytes());
        out[20..24].copy_from_slice(&self.rdma_zone_bitmap.to_le_bytes());
        out[24..32].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[8..14]);
        Ok(Self {
            magic: u32_at(buf, 0),
            protocol_version: u16_at(buf, 4),
            node_id: u16_at(buf, 6),
            mac_addr: mac,
            capabilities: HelloCaps(u16_at(buf, 14)),
            heartbeat_interval_ms: u16_at(buf, 16),
            max_channels: u16_at(buf, 18),
            rdma_zone_bitmap: u32_at(buf, 20),
        })
    }
}

/// HEARTBEAT / HEARTBEAT_ACK body (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub send_timestamp: u64,
    pub sender_load: u16,
    pub sender_mem_free: u16,
}

impl HeartbeatPayload {
    pub const LEN: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::LEN);
        out[0..8].copy_from_slice(&self.send_timestamp.to_le_bytes());
        out[8..10].copy_from_slice(&self.sender_load.to_le_bytes());
        out[10..12].copy_from_slice(&self.sender_mem_free.to_le_bytes());
        out[12..16].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            send_timestamp: u64_at(buf, 0),
            sender_load: u16_at(buf, 8),
            sender_mem_free: u16_at(buf, 10),
        })
    }
}

/// One neighbor entry inside an [`LsaPayload`] (6 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaNeighborEntry {
    pub node_id: u16,
    pub link_cost: u16,
    pub transport_mtu: u16,
}

impl LsaNeighborEntry {
    pub const LEN: usize = 6;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.node_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.link_cost.to_le_bytes());
        out[4..6].copy_from_slice(&self.transport_mtu.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            node_id: u16_at(buf, 0),
            link_cost: u16_at(buf, 2),
            transport_mtu: u16_at(buf, 4),
        }
    }
}

/// LINK_STATE_ADVERT body: 10-byte fixed prefix followed by
/// `num_neighbors` [`LsaNeighborEntry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaPayload<'a> {
    pub origin_node: u16,
    pub lsa_seq: u32,
    pub rdma_zone_bitmap: u32,
    neighbors_raw: &'a [u8],
    num_neighbors: u16,
}

impl<'a> LsaPayload<'a> {
    pub const PREFIX_LEN: usize = 10;

    pub fn encoded_len(num_neighbors: u16) -> usize {
        Self::PREFIX_LEN + num_neighbors as usize * LsaNeighborEntry::LEN
    }

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let num_neighbors = u16_at(buf, 6);
        let tail_len = num_neighbors as usize * LsaNeighborEntry::LEN;
        require(buf, Self::PREFIX_LEN + tail_len)?;
        Ok(Self {
            origin_node: u16_at(buf, 0),
            lsa_seq: u32_at(buf, 2),
            num_neighbors,
            rdma_zone_bitmap: u32_at(buf, 8),
            neighbors_raw: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + tail_len],
        })
    }

    pub fn num_neighbors(&self) -> u16 {
        self.num_neighbors
    }

    pub fn neighbor(&self, idx: u16) -> Option<LsaNeighborEntry> {
        if idx >= self.num_neighbors {
            return None;
        }
        let off = idx as usize * LsaNeighborEntry::LEN;
        Some(LsaNeighborEntry::decode(
            &self.neighbors_raw[off..off + LsaNeighborEntry::LEN],
        ))
    }

    pub fn encode_prefix(
        out: &mut [u8],
        origin_node: u16,
        lsa_seq: u32,
        num_neighbors: u16,
        rdma_zone_bitmap: u32,
    ) {
        out[0..2].copy_from_slice(&origin_node.to_le_bytes());
        out[2..6].copy_from_slice(&lsa_seq.to_le_bytes());
        out[6..8].copy_from_slice(&num_neighbors.to_le_bytes());
        out[8..10].copy_from_slice(&rdma_zone_bitmap.to_le_bytes());
    }
}

/// FENCE_NOTIFY body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceNotifyPayload {
    pub fenced_node: u16,
    pub fencing_node: u16,
    pub reason: FenceReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FenceReason {
    HeartbeatTimeout = 0,
    Manual = 1,
}

impl FenceNotifyPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.fenced_node.to_le_bytes());
        out[2..4].copy_from_slice(&self.fencing_node.to_le_bytes());
        out[4..8].copy_from_slice(&(self.reason as u32).to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        let reason = match u32_at(buf, 4) {
            0 => FenceReason::HeartbeatTimeout,
            _ => FenceReason::Manual,
        };
        Ok(Self {
            fenced_node: u16_at(buf, 0),
            fencing_node: u16_at(buf, 2),
            reason,
        })
    }
}

/// RECONCILE_REQ / RECONCILE_ACK body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePayload {
    pub node_id: u16,
    pub num_resources: u16,
}

impl ReconcilePayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.node_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.num_resources.to_le_bytes());
        out[4..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            node_id: u16_at(buf, 0),
            num_resources: u16_at(buf, 2),
        })
    }
}

/// RESOURCE_ADVERT body: 8-byte fixed prefix + `name_len` bytes of name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAdvertPayload<'a> {
    pub node_id: u16,
    pub resource_type: u16,
    pub resource_id: u32,
    pub flags: u8,
    pub name: &'a [u8],
}

impl<'a> ResourceAdvertPayload<'a> {
    pub const PREFIX_LEN: usize = 8;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let name_len = buf[7] as usize;
        require(buf, Self::PREFIX_LEN + name_len)?;
        Ok(Self {
            node_id: u16_at(buf, 0),
            resource_type: u16_at(buf, 2),
            resource_id: u32_at(buf, 4),
            flags: buf[6],
            name: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + name_len],
        })
    }

    pub fn encode_prefix(out: &mut [u8], node_id: u16, resource_type: u16, resource_id: u32, flags: u8, name_len: u8) {
        out[0..2].copy_from_slice(&node_id.to_le_bytes());
        out[2..4].copy_from_slice(&resource_type.to_le_bytes());
        out[4..8].copy_from_slice(&resource_id.to_le_bytes());
        out[6] = flags;
        out[7] = name_len;
    }
}

/// ZONE_CREATE_REQ body (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneCreateReqPayload {
    pub zone_id: u32,
    pub size: u32,
    pub access_policy: u8,
    pub notify_mode: u8,
    pub zone_type_hint: u8,
}

impl ZoneCreateReqPayload {
    pub const LEN: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8] = self.access_policy;
        out[9] = self.notify_mode;
        out[10] = self.zone_type_hint;
        out[11..16].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            size: u32_at(buf, 4),
            access_policy: buf[8],
            notify_mode: buf[9],
            zone_type_hint: buf[10],
        })
    }
}

/// ZONE_CREATE_ACK body (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneCreateAckPayload {
    pub zone_id: u32,
    pub status: u8,
    pub phys_addr: u64,
    pub rkey: u32,
}

impl ZoneCreateAckPayload {
    pub const LEN: usize = 24;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4] = self.status;
        out[5..8].fill(0);
        out[8..16].copy_from_slice(&self.phys_addr.to_le_bytes());
        out[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        out[20..24].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            status: buf[4],
            phys_addr: u64_at(buf, 8),
            rkey: u32_at(buf, 16),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneCreateStatus {
    Accepted = 0,
    RejectedNoMem = 1,
    RejectedPolicy = 2,
}

/// ZONE_DESTROY body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneDestroyPayload {
    pub zone_id: u32,
}

impl ZoneDestroyPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
        })
    }
}

/// ZONE_NOTIFY body (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneNotifyPayload {
    pub zone_id: u32,
    pub offset: u32,
    pub length: u32,
    pub op_type: u8,
}

impl ZoneNotifyPayload {
    pub const LEN: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out[12] = self.op_type;
        out[13..16].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            offset: u32_at(buf, 4),
            length: u32_at(buf, 8),
            op_type: buf[12],
        })
    }
}

/// ZONE_NOTIFY_ACK body (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneNotifyAckPayload {
    pub zone_id: u32,
}

impl ZoneNotifyAckPayload {
    pub const LEN: usize = 4;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
        })
    }
}

/// ZONE_READ_REQ body (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneReadReqPayload {
    pub zone_id: u32,
    pub offset: u32,
    pub length: u32,
}

impl ZoneReadReqPayload {
    pub const LEN: usize = 12;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            offset: u32_at(buf, 4),
            length: u32_at(buf, 8),
        })
    }
}

/// Maximum payload bytes carried in one ZONE_READ_RESP/ZONE_WRITE_REQ chunk.
pub const ZONE_CHUNK_MAX: usize = 1024;

/// ZONE_READ_RESP / ZONE_WRITE_REQ body: 12-byte fixed prefix + `length`
/// bytes of data (`length <= ZONE_CHUNK_MAX`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneDataPayload<'a> {
    pub zone_id: u32,
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> ZoneDataPayload<'a> {
    pub const PREFIX_LEN: usize = 12;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let length = u32_at(buf, 8) as usize;
        if length > ZONE_CHUNK_MAX {
            return Err(WireError::Truncated);
        }
        require(buf, Self::PREFIX_LEN + length)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            offset: u32_at(buf, 4),
            data: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + length],
        })
    }

    pub fn encode_prefix(out: &mut [u8], zone_id: u32, offset: u32, length: u32) {
        out[0..4].copy_from_slice(&zone_id.to_le_bytes());
        out[4..8].copy_from_slice(&offset.to_le_bytes());
        out[8..12].copy_from_slice(&length.to_le_bytes());
    }
}

/// ZONE_WRITE_ACK body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneWriteAckPayload {
    pub zone_id: u32,
    pub status: i32,
}

impl ZoneWriteAckPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.zone_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.status.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            zone_id: u32_at(buf, 0),
            status: i32_at(buf, 4),
        })
    }
}

/// EVENT_SUBSCRIBE body (8 bytes). `0xFFFF` in `event_class`/`event_id`
/// means wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubscribePayload {
    pub event_class: u16,
    pub event_id: u16,
    pub delivery_mode: u8,
}

impl EventSubscribePayload {
    pub const LEN: usize = 8;
    pub const WILDCARD: u16 = 0xFFFF;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.event_class.to_le_bytes());
        out[2..4].copy_from_slice(&self.event_id.to_le_bytes());
        out[4] = self.delivery_mode;
        out[5..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            event_class: u16_at(buf, 0),
            event_id: u16_at(buf, 2),
            delivery_mode: buf[4],
        })
    }
}

/// EVENT_PUBLISH body: 8-byte fixed prefix + `data_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPublishPayload<'a> {
    pub event_class: u16,
    pub event_id: u16,
    pub origin_node: u16,
    pub data: &'a [u8],
}

impl<'a> EventPublishPayload<'a> {
    pub const PREFIX_LEN: usize = 8;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let data_len = u16_at(buf, 6) as usize;
        require(buf, Self::PREFIX_LEN + data_len)?;
        Ok(Self {
            event_class: u16_at(buf, 0),
            event_id: u16_at(buf, 2),
            origin_node: u16_at(buf, 4),
            data: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + data_len],
        })
    }

    pub fn encode_prefix(out: &mut [u8], event_class: u16, event_id: u16, origin_node: u16, data_len: u16) {
        out[0..2].copy_from_slice(&event_class.to_le_bytes());
        out[2..4].copy_from_slice(&event_id.to_le_bytes());
        out[4..6].copy_from_slice(&origin_node.to_le_bytes());
        out[6..8].copy_from_slice(&data_len.to_le_bytes());
    }
}

/// EVENT_ACK body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventAckPayload {
    pub event_class: u16,
    pub event_id: u16,
    pub origin_node: u16,
}

impl EventAckPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.event_class.to_le_bytes());
        out[2..4].copy_from_slice(&self.event_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.origin_node.to_le_bytes());
        out[6..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            event_class: u16_at(buf, 0),
            event_id: u16_at(buf, 2),
            origin_node: u16_at(buf, 4),
        })
    }
}

/// DEV_ATTACH_REQ body (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevAttachReqPayload {
    pub target_node: u16,
    pub resource_type: u16,
    pub resource_id: u32,
    pub attach_mode: u8,
    pub requested_channel: u16,
}

impl DevAttachReqPayload {
    pub const LEN: usize = 12;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.target_node.to_le_bytes());
        out[2..4].copy_from_slice(&self.resource_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.resource_id.to_le_bytes());
        out[8] = self.attach_mode;
        out[9] = 0;
        out[10..12].copy_from_slice(&self.requested_channel.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            target_node: u16_at(buf, 0),
            resource_type: u16_at(buf, 2),
            resource_id: u32_at(buf, 4),
            attach_mode: buf[8],
            requested_channel: u16_at(buf, 10),
        })
    }
}

/// DEV_ATTACH_ACK body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevAttachAckPayload {
    pub status: u8,
    pub assigned_channel: u16,
    pub max_op_size: u16,
}

impl DevAttachAckPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = self.status;
        out[1] = 0;
        out[2..4].copy_from_slice(&self.assigned_channel.to_le_bytes());
        out[4..6].copy_from_slice(&self.max_op_size.to_le_bytes());
        out[6..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            status: buf[0],
            assigned_channel: u16_at(buf, 2),
            max_op_size: u16_at(buf, 4),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DevAttachStatus {
    Ok = 0,
    NotFound = 1,
    NotRemotable = 2,
    Busy = 3,
    NoPassthrough = 4,
}

/// DEV_DETACH body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevDetachPayload {
    pub target_node: u16,
    pub resource_type: u16,
    pub resource_id: u32,
}

impl DevDetachPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.target_node.to_le_bytes());
        out[2..4].copy_from_slice(&self.resource_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.resource_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            target_node: u16_at(buf, 0),
            resource_type: u16_at(buf, 2),
            resource_id: u32_at(buf, 4),
        })
    }
}

/// DEV_OP_REQ body: 4-byte fixed prefix + `data_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevOpReqPayload<'a> {
    pub op_id: u16,
    pub data: &'a [u8],
}

impl<'a> DevOpReqPayload<'a> {
    pub const PREFIX_LEN: usize = 4;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let data_len = u16_at(buf, 2) as usize;
        require(buf, Self::PREFIX_LEN + data_len)?;
        Ok(Self {
            op_id: u16_at(buf, 0),
            data: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + data_len],
        })
    }

    pub fn encode_prefix(out: &mut [u8], op_id: u16, data_len: u16) {
        out[0..2].copy_from_slice(&op_id.to_le_bytes());
        out[2..4].copy_from_slice(&data_len.to_le_bytes());
    }
}

/// DEV_OP_RESP body: 8-byte fixed prefix + `data_len` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevOpRespPayload<'a> {
    pub op_id: u16,
    pub status: i16,
    pub data: &'a [u8],
}

impl<'a> DevOpRespPayload<'a> {
    pub const PREFIX_LEN: usize = 8;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let data_len = u16_at(buf, 4) as usize;
        require(buf, Self::PREFIX_LEN + data_len)?;
        Ok(Self {
            op_id: u16_at(buf, 0),
            status: i16_at(buf, 2),
            data: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + data_len],
        })
    }

    pub fn encode_prefix(out: &mut [u8], op_id: u16, status: i16, data_len: u16) {
        out[0..2].copy_from_slice(&op_id.to_le_bytes());
        out[2..4].copy_from_slice(&status.to_le_bytes());
        out[4..6].copy_from_slice(&data_len.to_le_bytes());
        out[6..8].fill(0);
    }
}

/// DEV_IRQ_FWD body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevIrqFwdPayload {
    pub device_id: u16,
    pub irq_vector: u16,
    pub irq_status: u32,
}

impl DevIrqFwdPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.device_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.irq_vector.to_le_bytes());
        out[4..8].copy_from_slice(&self.irq_status.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            device_id: u16_at(buf, 0),
            irq_vector: u16_at(buf, 2),
            irq_status: u32_at(buf, 4),
        })
    }
}

/// CHANNEL_OPEN body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenPayload {
    pub requested_channel_id: u16,
    pub priority: u8,
    pub initial_credits: u16,
}

impl ChannelOpenPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.requested_channel_id.to_le_bytes());
        out[2] = self.priority;
        out[3] = 0;
        out[4..6].copy_from_slice(&self.initial_credits.to_le_bytes());
        out[6..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            requested_channel_id: u16_at(buf, 0),
            priority: buf[2],
            initial_credits: u16_at(buf, 4),
        })
    }
}

/// CHANNEL_OPEN_ACK body (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenAckPayload {
    pub assigned_channel_id: u16,
    pub status: u8,
    pub initial_credits: u16,
}

impl ChannelOpenAckPayload {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.assigned_channel_id.to_le_bytes());
        out[2] = self.status;
        out[3] = 0;
        out[4..6].copy_from_slice(&self.initial_credits.to_le_bytes());
        out[6..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            assigned_channel_id: u16_at(buf, 0),
            status: buf[2],
            initial_credits: u16_at(buf, 4),
        })
    }
}

/// CHANNEL_CLOSE body (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosePayload {
    pub channel_id: u16,
}

impl ChannelClosePayload {
    pub const LEN: usize = 4;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.channel_id.to_le_bytes());
        out[2..4].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            channel_id: u16_at(buf, 0),
        })
    }
}

/// How a TASK_SUBMIT binary/path payload is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskDeliveryMode {
    Inline = 0,
    VfsRef = 1,
    ResourceRef = 2,
}

impl TaskDeliveryMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => TaskDeliveryMode::Inline,
            1 => TaskDeliveryMode::VfsRef,
            2 => TaskDeliveryMode::ResourceRef,
            _ => return None,
        })
    }
}

/// TASK_SUBMIT body: 8-byte fixed prefix, then a mode-dependent section,
/// then `args_len` bytes of args.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSubmitPayload<'a> {
    pub task_id: u32,
    pub delivery_mode: u8,
    pub args: &'a [u8],
    pub body: TaskSubmitBody<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSubmitBody<'a> {
    Inline { binary: &'a [u8] },
    VfsRef { path: &'a [u8] },
    ResourceRef { ref_node_id: u16, ref_resource_id: u32, path: &'a [u8] },
}

impl<'a> TaskSubmitPayload<'a> {
    pub const PREFIX_LEN: usize = 8;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let task_id = u32_at(buf, 0);
        let delivery_mode = buf[4];
        let args_len = u16_at(buf, 6) as usize;
        let mut off = Self::PREFIX_LEN;
        let body = match TaskDeliveryMode::from_u8(delivery_mode) {
            Some(TaskDeliveryMode::Inline) => {
                require(buf, off + 4)?;
                let binary_len = u32_at(buf, off) as usize;
                off += 4;
                require(buf, off + binary_len)?;
                let binary = &buf[off..off + binary_len];
                off += binary_len;
                TaskSubmitBody::Inline { binary }
            }
            Some(TaskDeliveryMode::VfsRef) => {
                require(buf, off + 2)?;
                let path_len = u16_at(buf, off) as usize;
                off += 2;
                require(buf, off + path_len)?;
                let path = &buf[off..off + path_len];
                off += path_len;
                TaskSubmitBody::VfsRef { path }
            }
            Some(TaskDeliveryMode::ResourceRef) => {
                require(buf, off + 8)?;
                let ref_node_id = u16_at(buf, off);
                let ref_resource_id = u32_at(buf, off + 2);
                let path_len = u16_at(buf, off + 6) as usize;
                off += 8;
                require(buf, off + path_len)?;
                let path = &buf[off..off + path_len];
                off += path_len;
                TaskSubmitBody::ResourceRef {
                    ref_node_id,
                    ref_resource_id,
                    path,
                }
            }
            None => return Err(WireError::Truncated),
        };
        require(buf, off + args_len)?;
        Ok(Self {
            task_id,
            delivery_mode,
            args: &buf[off..off + args_len],
            body,
        })
    }

    /// Encode the fixed prefix plus `TaskDeliveryMode::Inline`'s own
    /// 4-byte `binary_len` header. The caller copies `binary` then `args`
    /// immediately after the returned offset.
    pub fn encode_inline_prefix(out: &mut [u8], task_id: u32, binary_len: u32, args_len: u16) -> usize {
        out[0..4].copy_from_slice(&task_id.to_le_bytes());
        out[4] = TaskDeliveryMode::Inline as u8;
        out[5] = 0;
        out[6..8].copy_from_slice(&args_len.to_le_bytes());
        out[8..12].copy_from_slice(&binary_len.to_le_bytes());
        12
    }
}

/// TASK_ACCEPT / TASK_REJECT body (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskResponsePayload {
    pub task_id: u32,
    pub status: u8,
    pub remote_pid: u64,
}

impl TaskResponsePayload {
    pub const LEN: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.task_id.to_le_bytes());
        out[4] = self.status;
        out[5..8].fill(0);
        out[8..16].copy_from_slice(&self.remote_pid.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            task_id: u32_at(buf, 0),
            status: buf[4],
            remote_pid: u64_at(buf, 8),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskRejectReason {
    Accepted = 0,
    NoCapacity = 1,
    BinaryTooLarge = 2,
    PathNotFound = 3,
    PermissionDenied = 4,
}

/// TASK_COMPLETE body: 8-byte fixed prefix + `output_len` bytes (clamped to
/// [`TASK_OUTPUT_MAX`]).
pub const TASK_OUTPUT_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCompletePayload<'a> {
    pub task_id: u32,
    pub exit_status: i32,
    pub output: &'a [u8],
}

impl<'a> TaskCompletePayload<'a> {
    pub const PREFIX_LEN: usize = 10;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let output_len = u16_at(buf, 8) as usize;
        if output_len > TASK_OUTPUT_MAX {
            return Err(WireError::Truncated);
        }
        require(buf, Self::PREFIX_LEN + output_len)?;
        Ok(Self {
            task_id: u32_at(buf, 0),
            exit_status: i32_at(buf, 4),
            output: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + output_len],
        })
    }

    pub fn encode_prefix(out: &mut [u8], task_id: u32, exit_status: i32, output_len: u16) {
        out[0..4].copy_from_slice(&task_id.to_le_bytes());
        out[4..8].copy_from_slice(&exit_status.to_le_bytes());
        out[8..10].copy_from_slice(&output_len.to_le_bytes());
    }
}

/// TASK_CANCEL body (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCancelPayload {
    pub task_id: u32,
}

impl TaskCancelPayload {
    pub const LEN: usize = 4;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.task_id.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        require(buf, Self::LEN)?;
        Ok(Self {
            task_id: u32_at(buf, 0),
        })
    }
}

/// LOAD_REPORT body: 8-byte fixed prefix + `num_cpus` per-CPU load values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReportPayload<'a> {
    pub runnable_tasks: u16,
    pub avg_load_pct: u16,
    pub free_mem_pages: u16,
    per_cpu_raw: &'a [u8],
    num_cpus: u16,
}

impl<'a> LoadReportPayload<'a> {
    pub const PREFIX_LEN: usize = 8;

    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        require(buf, Self::PREFIX_LEN)?;
        let num_cpus = u16_at(buf, 0);
        let tail_len = num_cpus as usize * 2;
        require(buf, Self::PREFIX_LEN + tail_len)?;
        Ok(Self {
            runnable_tasks: u16_at(buf, 2),
            avg_load_pct: u16_at(buf, 4),
            free_mem_pages: u16_at(buf, 6),
            num_cpus,
            per_cpu_raw: &buf[Self::PREFIX_LEN..Self::PREFIX_LEN + tail_len],
        })
    }

    pub fn num_cpus(&self) -> u16 {
        self.num_cpus
    }

    pub fn per_cpu_load(&self, idx: u16) -> Option<u16> {
        if idx >= self.num_cpus {
            return None;
        }
        let off = idx as usize * 2;
        Some(u16_at(self.per_cpu_raw, off))
    }

    pub fn encode_prefix(out: &mut [u8], num_cpus: u16, runnable_tasks: u16, avg_load_pct: u16, free_mem_pages: u16) {
        out[0..2].copy_from_slice(&num_cpus.to_le_bytes());
        out[2..4].copy_from_slice(&runnable_tasks.to_le_bytes());
        out[4..6].copy_from_slice(&avg_load_pct.to_le_bytes());
        out[6..8].copy_from_slice(&free_mem_pages.to_le_bytes());
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let h = HelloPayload {
            magic: HELLO_MAGIC,
            protocol_version: 1,
            node_id: 0x1234,
            mac_addr: [1, 2, 3, 4, 5, 6],
            capabilities: HelloCaps::RDMA_SUPPORT.union(HelloCaps::ZONE_SUPPORT),
            heartbeat_interval_ms: 1000,
            max_channels: 256,
            rdma_zone_bitmap: 0xF0F0,
        };
        let mut buf = [0u8; HelloPayload::LEN];
        h.encode(&mut buf);
        let d = HelloPayload::decode(&buf).unwrap();
        assert_eq!(h, d);
        assert!(d.capabilities.contains(HelloCaps::RDMA_SUPPORT));
    }

    #[test]
    fn lsa_neighbor_walk() {
        let mut buf = [0u8; 22];
        LsaPayload::encode_prefix(&mut buf, 7, 99, 2, 0);
        LsaNeighborEntry {
            node_id: 1,
            link_cost: 10,
            transport_mtu: 1500,
        }
        .encode(&mut buf[10..16]);
        LsaNeighborEntry {
            node_id: 2,
            link_cost: 20,
            transport_mtu: 9000,
        }
        .encode(&mut buf[16..22]);
        let lsa = LsaPayload::decode(&buf).unwrap();
        assert_eq!(lsa.num_neighbors(), 2);
        assert_eq!(lsa.neighbor(0).unwrap().node_id, 1);
        assert_eq!(lsa.neighbor(1).unwrap().transport_mtu, 9000);
        assert!(lsa.neighbor(2).is_none());
    }

    #[test]
    fn zone_data_rejects_oversized_chunk() {
        let mut buf = [0u8; ZoneDataPayload::PREFIX_LEN];
        ZoneDataPayload::encode_prefix(&mut buf, 1, 0, (ZONE_CHUNK_MAX + 1) as u32);
        assert_eq!(ZoneDataPayload::decode(&buf), Err(WireError::Truncated));
    }

    #[test]
    fn task_submit_inline_decodes() {
        let mut buf = std::vec::Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.push(TaskDeliveryMode::Inline as u8);
        buf.push(0);
        buf.extend_from_slice(&2u16.to_le_bytes()); // args_len
        buf.extend_from_slice(&3u32.to_le_bytes()); // binary_len
        buf.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        buf.extend_from_slice(&[1, 2]); // args
        let submit = TaskSubmitPayload::decode(&buf).unwrap();
        assert_eq!(submit.task_id, 7);
        assert_eq!(submit.args, &[1, 2]);
        match submit.body {
            TaskSubmitBody::Inline { binary } => assert_eq!(binary, &[0xAA, 0xBB, 0xCC]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn load_report_per_cpu_walk() {
        let mut buf = [0u8; 12];
        LoadReportPayload::encode_prefix(&mut buf, 2, 5, 300, 4096);
        buf[8..10].copy_from_slice(&10u16.to_le_bytes());
        buf[10..12].copy_from_slice(&20u16.to_le_bytes());
        let lr = LoadReportPayload::decode(&buf).unwrap();
        assert_eq!(lr.num_cpus(), 2);
        assert_eq!(lr.per_cpu_load(1), Some(20));
        assert_eq!(lr.per_cpu_load(2), None);
    }
}
