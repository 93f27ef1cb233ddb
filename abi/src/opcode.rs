//! The message-type catalog, well-known channel ids, resource kinds, and the
//! device-op catalog used by resource remoting.

/// Top-level message types, carried in `WireHeader::msg_type`.
///
/// Grouped by subsystem: peer lifecycle (0x01-0x0F), routing (0x10-0x1F),
/// reliable transport acks (0x20-0x2F), zones (0x30-0x3F), event bus
/// (0x40-0x4F), resource remoting (0x50-0x5F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    HelloAck = 0x02,
    Heartbeat = 0x03,
    FenceNotify = 0x04,
    Goodbye = 0x05,

    LinkStateAdvert = 0x10,
    ReconcileReq = 0x11,
    ReconcileAck = 0x12,

    ChannelOpen = 0x20,
    ChannelOpenAck = 0x21,
    ChannelClose = 0x22,
    DataAck = 0x23,

    ZoneCreateReq = 0x30,
    ZoneCreateAck = 0x31,
    ZoneDestroy = 0x32,
    ZoneNotify = 0x33,
    ZoneNotifyAck = 0x34,
    ZoneReadReq = 0x35,
    ZoneReadResp = 0x36,
    ZoneWriteReq = 0x37,
    ZoneWriteAck = 0x38,

    EventSubscribe = 0x40,
    EventPublish = 0x41,
    EventAck = 0x42,

    ResourceAdvert = 0x50,
    DevAttachReq = 0x51,
    DevAttachAck = 0x52,
    DevDetach = 0x53,
    DevOpReq = 0x54,
    DevOpResp = 0x55,
    DevIrqFwd = 0x56,

    TaskSubmit = 0x60,
    TaskResponse = 0x61,
    TaskComplete = 0x62,
    TaskCancel = 0x63,
    LoadReport = 0x64,
}

impl MsgType {
    /// Decode a raw `msg_type` byte, returning `None` for an unrecognized
    /// value (the dispatcher drops such frames rather than treating this as
    /// fatal — an unknown peer may speak a newer protocol revision).
    pub fn from_u8(v: u8) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            0x01 => Hello,
            0x02 => HelloAck,
            0x03 => Heartbeat,
            0x04 => FenceNotify,
            0x05 => Goodbye,
            0x10 => LinkStateAdvert,
            0x11 => ReconcileReq,
            0x12 => ReconcileAck,
            0x20 => ChannelOpen,
            0x21 => ChannelOpenAck,
            0x22 => ChannelClose,
            0x23 => DataAck,
            0x30 => ZoneCreateReq,
            0x31 => ZoneCreateAck,
            0x32 => ZoneDestroy,
            0x33 => ZoneNotify,
            0x34 => ZoneNotifyAck,
            0x35 => ZoneReadReq,
            0x36 => ZoneReadResp,
            0x37 => ZoneWriteReq,
            0x38 => ZoneWriteAck,
            0x40 => EventSubscribe,
            0x41 => EventPublish,
            0x42 => EventAck,
            0x50 => ResourceAdvert,
            0x51 => DevAttachReq,
            0x52 => DevAttachAck,
            0x53 => DevDetach,
            0x54 => DevOpReq,
            0x55 => DevOpResp,
            0x56 => DevIrqFwd,
            0x60 => TaskSubmit,
            0x61 => TaskResponse,
            0x62 => TaskComplete,
            0x63 => TaskCancel,
            0x64 => LoadReport,
            _ => return None,
        })
    }
}

/// Well-known channel ids. Channel ids `>= DYNAMIC_BASE` are allocated
/// per-resource-binding at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChannelId {
    /// Peer lifecycle, routing, and zone control messages.
    Control = 0,
    /// Zone negotiation and membership traffic.
    ZoneMgmt = 1,
    /// Event bus publish/subscribe traffic.
    EventBus = 2,
    /// Resource advertisement and attach/detach negotiation.
    Resource = 3,
}

impl ChannelId {
    /// First id available for dynamic per-binding channel allocation.
    pub const DYNAMIC_BASE: u16 = 16;
}

/// The kind of device a resource binding proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceType {
    Block = 0,
    Char = 1,
    Net = 2,
    Vfs = 3,
    Compute = 4,
    Custom = 255,
}

impl ResourceType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ResourceType::Block,
            1 => ResourceType::Char,
            2 => ResourceType::Net,
            3 => ResourceType::Vfs,
            4 => ResourceType::Compute,
            255 => ResourceType::Custom,
            _ => return None,
        })
    }
}

/// Device operation ids carried in `DevOpReqPayload::op`, namespaced by
/// resource type so a single `u16` op space covers every proxied device
/// kind without collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DeviceOp {
    BlockRead = 0x0100,
    BlockWrite = 0x0101,
    BlockFlush = 0x0102,
    BlockInfo = 0x0103,

    CharRead = 0x0200,
    CharWrite = 0x0201,
    CharIoctl = 0x0202,

    NetSend = 0x0300,
    NetSetFilter = 0x0301,
    NetGetStats = 0x0302,

    VfsLookup = 0x0400,
    VfsRead = 0x0401,
    VfsWrite = 0x0402,
    VfsGetattr = 0x0403,
    VfsSetattr = 0x0404,
    VfsReaddir = 0x0405,
    VfsCreate = 0x0406,
    VfsUnlink = 0x0407,
}

impl DeviceOp {
    pub fn from_u16(v: u16) -> Option<Self> {
        use DeviceOp::*;
        Some(match v {
            0x0100 => BlockRead,
            0x0101 => BlockWrite,
            0x0102 => BlockFlush,
            0x0103 => BlockInfo,
            0x0200 => CharRead,
            0x0201 => CharWrite,
            0x0202 => CharIoctl,
            0x0300 => NetSend,
            0x0301 => NetSetFilter,
            0x0302 => NetGetStats,
            0x0400 => VfsLookup,
            0x0401 => VfsRead,
            0x0402 => VfsWrite,
            0x0403 => VfsGetattr,
            0x0404 => VfsSetattr,
            0x0405 => VfsReaddir,
            0x0406 => VfsCreate,
            0x0407 => VfsUnlink,
            _ => return None,
        })
    }
}

/// Well-known `event_class`/`event_id` values carried on `EVENT_PUBLISH`.
/// `wki-core` is the only publisher of the `SYSTEM` class today; other
/// classes (device, storage, zone) are left to the embedding kernel and
/// its drivers to define and publish through [`wki_eventbus::EventBus`].
pub const EVENT_CLASS_SYSTEM: u16 = 0x0001;
pub const EVENT_SYSTEM_NODE_JOIN: u16 = 0x0001;
pub const EVENT_SYSTEM_NODE_LEAVE: u16 = 0x0002;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_round_trips_known_values() {
        assert_eq!(MsgType::from_u8(0x01), Some(MsgType::Hello));
        assert_eq!(MsgType::from_u8(0x36), Some(MsgType::ZoneReadResp));
        assert_eq!(MsgType::from_u8(0x64), Some(MsgType::LoadReport));
        assert_eq!(MsgType::from_u8(0xAA), None);
    }

    #[test]
    fn device_op_round_trips_known_values() {
        assert_eq!(DeviceOp::from_u16(0x0401), Some(DeviceOp::VfsRead));
        assert_eq!(DeviceOp::from_u16(0xFFFF), None);
    }

    #[test]
    fn dynamic_channel_base_above_well_known() {
        assert!(ChannelId::DYNAMIC_BASE > ChannelId::Resource as u16);
    }
}
