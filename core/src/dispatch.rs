//! Frame ingress and subsystem dispatch (spec §4 end to end).
//!
//! One entry point, [`dispatch_frame`], is wired to every registered
//! transport's `set_rx_handler` callback. It decodes the 32-byte header,
//! validates the frame's integrity, asks [`wki_routing::Router`] whether the
//! frame is ours to keep or forward, and — for frames addressed here —
//! either handles a peer-lifecycle/routing message directly or feeds the
//! frame to the owning `(peer, channel_id)` [`wki_channel::Channel`] and
//! dispatches whatever comes out of its reorder buffer by `msg_type`.
//!
//! Every subsystem crate below does no wire I/O or logging of its own; this
//! module is the one place that owns both.

use alloc::vec::Vec;

use wki_abi::payload::*;
use wki_abi::wire::{HEADER_LEN, compute_checksum, validate_checksum};
use wki_abi::{
    ChannelId, DeviceOp, EVENT_CLASS_SYSTEM, EVENT_SYSTEM_NODE_JOIN, EVENT_SYSTEM_NODE_LEAVE, MsgType, NodeId, ResourceType, WireHeader,
    WkiError,
};
use wki_channel::{Priority, ReadyMessage};
use wki_devserver::OpOutcome;
use wki_lib::collab::{monotonic_clock, phys_allocator, task_scheduler};
use wki_lib::config::{
    CREDITS_CONTROL, CREDITS_DYNAMIC, CREDITS_EVENT_BUS, CREDITS_RESOURCE, CREDITS_ZONE_MGMT, HEARTBEAT_INTERVAL_DEFAULT_MS,
};
use wki_lib::{klog_debug, klog_info, klog_warn};
use wki_peer::{HelloOutcome, PeerEvent};
use wki_routing::ForwardDecision;
use wki_transport::Transport;

use crate::state::state;

fn mac_for(node: NodeId) -> Option<[u8; 6]> {
    state().peers.snapshot(node).map(|s| s.mac)
}

fn credits_for_channel(channel_id: u16) -> u16 {
    match channel_id {
        id if id == ChannelId::Control as u16 => CREDITS_CONTROL,
        id if id == ChannelId::ZoneMgmt as u16 => CREDITS_ZONE_MGMT,
        id if id == ChannelId::EventBus as u16 => CREDITS_EVENT_BUS,
        id if id == ChannelId::Resource as u16 => CREDITS_RESOURCE,
        _ => CREDITS_DYNAMIC,
    }
}

fn priority_for_channel(channel_id: u16) -> Priority {
    if channel_id == ChannelId::Control as u16 {
        Priority::Latency
    } else {
        Priority::Throughput
    }
}

/// Build and send a one-off, unreliable control-plane frame: HELLO,
/// HEARTBEAT, FENCE_NOTIFY, GOODBYE, and the routing/reconcile messages
/// never ride a [`wki_channel::Channel`] — they're exchanged before any
/// channel exists (HELLO) or are idempotent enough that per-seq reliability
/// buys nothing (a missed HEARTBEAT is just caught by the next one).
fn send_control_frame(transport: &dyn Transport, mac: [u8; 6], msg_type: MsgType, dst: NodeId, payload: &[u8]) {
    let my_node = state().my_node_id;
    let mut header = WireHeader::new(msg_type as u8, my_node.0, dst.0, ChannelId::Control as u16, 0, payload.len() as u16);
    header.checksum = compute_checksum(&header, payload);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.resize(HEADER_LEN, 0);
    header.encode(&mut frame);
    frame.extend_from_slice(payload);
    let _ = transport.tx(mac, &frame);
}

fn broadcast_control_frame(transport: &dyn Transport, msg_type: MsgType, payload: &[u8]) {
    let my_node = state().my_node_id;
    let mut header = WireHeader::new(msg_type as u8, my_node.0, NodeId::BROADCAST.0, ChannelId::Control as u16, 0, payload.len() as u16);
    header.checksum = compute_checksum(&header, payload);
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.resize(HEADER_LEN, 0);
    header.encode(&mut frame);
    frame.extend_from_slice(payload);
    let _ = transport.tx_broadcast(&frame);
}

/// The callback registered with `Transport::set_rx_handler`. A transport's
/// rx path only carries a bare `fn(&[u8])` (no closure capture, no `self`),
/// so this recovers the transport and a timestamp from the process-wide
/// singleton rather than having them passed in.
pub fn on_frame_received(frame: &[u8]) {
    let now_ns = monotonic_clock().map(|c| c.now_ns()).unwrap_or(0);
    dispatch_frame(state().transport, frame, now_ns);
}

/// Frame-ingress entry point, parameterized for use from [`crate::tick`] as
/// well (which already carries its own `now_ns`). `frame` is the whole wire
/// frame, 32-byte header included.
fn dispatch_frame(transport: &dyn Transport, frame: &[u8], now_ns: u64) {
    let Ok(mut header) = WireHeader::decode(frame) else {
        return;
    };
    if !validate_checksum(frame) {
        klog_warn!("wki: checksum mismatch from node {}", header.src_node);
        return;
    }
    match state().router.decide_forward(&mut header) {
        ForwardDecision::Drop => {}
        ForwardDecision::Forward { next_hop } => forward_frame(transport, &header, frame, next_hop),
        ForwardDecision::Deliver => deliver_frame(transport, &header, frame, now_ns),
    }
}

fn forward_frame(transport: &dyn Transport, header: &WireHeader, frame: &[u8], next_hop: NodeId) {
    let Some(mac) = mac_for(next_hop) else {
        klog_warn!("wki: no route to next hop {}, dropping", next_hop.0);
        return;
    };
    let mut out = frame.to_vec();
    header.encode(&mut out[..HEADER_LEN]);
    let _ = transport.tx(mac, &out);
}

fn deliver_frame(transport: &dyn Transport, header: &WireHeader, frame: &[u8], now_ns: u64) {
    let Some(msg_type) = MsgType::from_u8(header.msg_type) else {
        return;
    };
    let src = NodeId(header.src_node);
    let payload = &frame[HEADER_LEN..];

    match msg_type {
        MsgType::Hello | MsgType::HelloAck => handle_hello(transport, header, msg_type, payload, now_ns),
        MsgType::Heartbeat => handle_heartbeat(src, payload, now_ns),
        MsgType::FenceNotify => handle_fence_notify(payload),
        MsgType::Goodbye => handle_goodbye(transport, src, now_ns),
        MsgType::LinkStateAdvert => handle_lsa(transport, src, payload, now_ns),
        MsgType::ReconcileReq => handle_reconcile_req(transport, src, payload),
        MsgType::ReconcileAck => handle_reconcile_ack(src, payload),
        _ => deliver_channel_message(transport, header, src, msg_type, payload, now_ns),
    }
}

// ---------------------------------------------------------------------
// Peer lifecycle (spec §4.D)
// ---------------------------------------------------------------------

fn handle_hello(transport: &dyn Transport, header: &WireHeader, msg_type: MsgType, payload: &[u8], now_ns: u64) {
    let Ok(hello) = HelloPayload::decode(payload) else {
        return;
    };
    let sender_node = NodeId(header.src_node);
    let sender_mac = hello.mac_addr;
    let st = state();

    let outcome = st.peers.on_hello(now_ns, sender_node, sender_mac, &hello, st.my_mac, HEARTBEAT_INTERVAL_DEFAULT_MS);
    match outcome {
        HelloOutcome::Accepted { negotiated_heartbeat_ms, event } => {
            if msg_type == MsgType::Hello {
                send_hello_reply(transport, MsgType::HelloAck, sender_node, sender_mac, negotiated_heartbeat_ms);
            }
            if let Some(event) = event {
                handle_peer_event(transport, event, now_ns);
            }
            klog_info!("wki: peer {} connected, heartbeat {} ms", sender_node.0, negotiated_heartbeat_ms);
        }
        HelloOutcome::WeLoseCollision => klog_warn!("wki: node id collision with {}, regenerating", sender_node.0),
        HelloOutcome::TheyLoseCollision => klog_debug!("wki: node id collision with {}, they lose", sender_node.0),
        HelloOutcome::TableFull => klog_warn!("wki: peer table full, dropped HELLO from {}", sender_node.0),
    }
}

fn send_hello_reply(transport: &dyn Transport, msg_type: MsgType, dst: NodeId, mac: [u8; 6], heartbeat_interval_ms: u64) {
    let st = state();
    let hello = HelloPayload {
        magic: HELLO_MAGIC,
        protocol_version: wki_abi::wire::WKI_VERSION as u16,
        node_id: st.my_node_id.0,
        mac_addr: st.my_mac,
        capabilities: HelloCaps::RDMA_SUPPORT.union(HelloCaps::ZONE_SUPPORT),
        heartbeat_interval_ms: heartbeat_interval_ms as u16,
        max_channels: wki_lib::config::MAX_CHANNELS_PER_PEER as u16,
        rdma_zone_bitmap: 0,
    };
    let mut buf = [0u8; HelloPayload::LEN];
    hello.encode(&mut buf);
    send_control_frame(transport, mac, msg_type, dst, &buf);
}

/// React to a [`PeerEvent`] surfaced by `on_hello`/`tick`. Exposed to
/// [`crate::tick`], which surfaces its own batch of events every tick.
pub(crate) fn handle_tick_peer_event(transport: &dyn Transport, event: PeerEvent, now_ns: u64) {
    handle_peer_event(transport, event, now_ns);
}

fn handle_peer_event(transport: &dyn Transport, event: PeerEvent, now_ns: u64) {
    match event {
        PeerEvent::NodeJoin(node) | PeerEvent::PeerReconnected(node) => {
            refresh_local_lsa(transport, now_ns);
            send_reconcile_req(transport, node);
            publish_system_event(transport, EVENT_SYSTEM_NODE_JOIN, node, now_ns);
        }
        PeerEvent::ResendHello(node) => {
            if let Some(mac) = mac_for(node) {
                send_hello_reply(transport, MsgType::Hello, node, mac, HEARTBEAT_INTERVAL_DEFAULT_MS);
            } else {
                broadcast_hello(transport);
            }
        }
        PeerEvent::FenceDue(node, reason) => fence_node(transport, node, reason, now_ns),
        PeerEvent::HelloRetriesExhausted(node) => klog_warn!("wki: HELLO retries exhausted for {}", node.0),
    }
}

fn broadcast_hello(transport: &dyn Transport) {
    let st = state();
    let hello = HelloPayload {
        magic: HELLO_MAGIC,
        protocol_version: wki_abi::wire::WKI_VERSION as u16,
        node_id: st.my_node_id.0,
        mac_addr: st.my_mac,
        capabilities: HelloCaps::RDMA_SUPPORT.union(HelloCaps::ZONE_SUPPORT),
        heartbeat_interval_ms: HEARTBEAT_INTERVAL_DEFAULT_MS as u16,
        max_channels: wki_lib::config::MAX_CHANNELS_PER_PEER as u16,
        rdma_zone_bitmap: 0,
    };
    let mut buf = [0u8; HelloPayload::LEN];
    hello.encode(&mut buf);
    broadcast_control_frame(transport, MsgType::Hello, &buf);
}

fn handle_heartbeat(src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(hb) = HeartbeatPayload::decode(payload) else {
        return;
    };
    state().peers.on_heartbeat(now_ns, src, &hb);
}

fn handle_fence_notify(payload: &[u8]) {
    let Ok(notify) = FenceNotifyPayload::decode(payload) else {
        return;
    };
    let node = NodeId(notify.fenced_node);
    let reason = notify.reason;
    let outcome = state().peers.fence(node, reason);
    if !outcome.already_fenced {
        klog_info!("wki: peer {} fenced by {} (remote notify)", node.0, notify.fencing_node);
    }
}

fn handle_goodbye(transport: &dyn Transport, src: NodeId, now_ns: u64) {
    fence_node_silent(transport, src, FenceReason::Manual, now_ns);
}

fn fence_node(transport: &dyn Transport, node: NodeId, reason: FenceReason, now_ns: u64) {
    let outcome = state().peers.fence(node, reason);
    if outcome.already_fenced {
        return;
    }
    klog_info!("wki: fencing peer {}", node.0);
    if let Some(notify) = outcome.notify {
        let mut buf = [0u8; FenceNotifyPayload::LEN];
        notify.encode(&mut buf);
        broadcast_control_frame(transport, MsgType::FenceNotify, &buf);
    }
    state().router.invalidate(node);
    state().resources.invalidate_for_peer(node);
    publish_system_event(transport, EVENT_SYSTEM_NODE_LEAVE, node, now_ns);
}

/// Variant used when reacting to a peer-originated notification: no need to
/// re-broadcast (the originator already did), just apply it locally.
fn fence_node_silent(transport: &dyn Transport, node: NodeId, reason: FenceReason, now_ns: u64) {
    let outcome = state().peers.fence(node, reason);
    if !outcome.already_fenced {
        state().router.invalidate(node);
        state().resources.invalidate_for_peer(node);
        publish_system_event(transport, EVENT_SYSTEM_NODE_LEAVE, node, now_ns);
    }
}

// ---------------------------------------------------------------------
// Routing (spec §4.E)
// ---------------------------------------------------------------------

/// Link cost charged for every direct neighbor. Every WKI transport today
/// is a single shared broadcast medium (Ethernet or ivshmem doorbell), so
/// there's no per-link metric to distinguish — every hop costs the same.
const LINK_COST_UNIT: u16 = 1;

fn refresh_local_lsa(transport: &dyn Transport, now_ns: u64) {
    let now_ms = now_ns / 1_000_000;
    let mtu = transport.mtu().min(u16::MAX as usize) as u16;
    let neighbors: Vec<LsaNeighborEntry> = state()
        .peers
        .connected_snapshots()
        .into_iter()
        .map(|s| LsaNeighborEntry { node_id: s.node_id.0, link_cost: LINK_COST_UNIT, transport_mtu: mtu })
        .collect();
    let seq = state().router.install_local_lsa(now_ms, &neighbors, 0);
    send_lsa(transport, state().my_node_id, seq, 0, &neighbors);
}

fn send_lsa(transport: &dyn Transport, origin: NodeId, seq: u32, rdma_zone_bitmap: u32, neighbors: &[LsaNeighborEntry]) {
    let len = LsaPayload::encoded_len(neighbors.len() as u16);
    let mut buf = alloc::vec![0u8; len];
    LsaPayload::encode_prefix(&mut buf, origin.0, seq, neighbors.len() as u16, rdma_zone_bitmap);
    for (i, n) in neighbors.iter().enumerate() {
        let off = LsaPayload::PREFIX_LEN + i * LsaNeighborEntry::LEN;
        n.encode(&mut buf[off..off + LsaNeighborEntry::LEN]);
    }
    broadcast_control_frame(transport, MsgType::LinkStateAdvert, &buf);
}

fn handle_lsa(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(lsa) = LsaPayload::decode(payload) else {
        return;
    };
    let now_ms = now_ns / 1_000_000;
    let mut neighbors = Vec::with_capacity(lsa.num_neighbors() as usize);
    for i in 0..lsa.num_neighbors() {
        if let Some(n) = lsa.neighbor(i) {
            neighbors.push(n);
        }
    }
    let origin = NodeId(lsa.origin_node);
    let newer = state().router.on_lsa(now_ms, origin, lsa.lsa_seq, lsa.rdma_zone_bitmap, &neighbors);
    if newer {
        // Re-flood to every other connected neighbor. We don't track which
        // link a broadcast LSA arrived on (every transport is broadcast at
        // L2 already), so re-broadcasting it verbatim is enough: peers drop
        // self-originated/stale copies via the same `on_lsa` seq check.
        send_lsa(transport, origin, lsa.lsa_seq, lsa.rdma_zone_bitmap, &neighbors);
    }
    let _ = src;
}

fn send_reconcile_req(transport: &dyn Transport, dst: NodeId) {
    let Some(mac) = mac_for(dst) else { return };
    let payload = ReconcilePayload { node_id: state().my_node_id.0, num_resources: 0 };
    let mut buf = [0u8; ReconcilePayload::LEN];
    payload.encode(&mut buf);
    send_control_frame(transport, mac, MsgType::ReconcileReq, dst, &buf);
}

fn handle_reconcile_req(transport: &dyn Transport, src: NodeId, payload: &[u8]) {
    if ReconcilePayload::decode(payload).is_err() {
        return;
    }
    let Some(mac) = mac_for(src) else { return };
    let ads = state().resources.local_ads_snapshot();
    for ad in &ads {
        let mut buf = [0u8; ResourceAdvertPayload::PREFIX_LEN + wki_lib::config::MAX_RESOURCE_NAME_LEN];
        let name = ad.name();
        ResourceAdvertPayload::encode_prefix(&mut buf, ad.owner_node.0, ad.resource_type as u16, ad.resource_id, ad.flags, name.len() as u8);
        buf[ResourceAdvertPayload::PREFIX_LEN..ResourceAdvertPayload::PREFIX_LEN + name.len()].copy_from_slice(name);
        send_control_frame(transport, mac, MsgType::ResourceAdvert, src, &buf[..ResourceAdvertPayload::PREFIX_LEN + name.len()]);
    }
    let ack = ReconcilePayload { node_id: state().my_node_id.0, num_resources: ads.len() as u16 };
    let mut buf = [0u8; ReconcilePayload::LEN];
    ack.encode(&mut buf);
    send_control_frame(transport, mac, MsgType::ReconcileAck, src, &buf);
}

fn handle_reconcile_ack(src: NodeId, payload: &[u8]) {
    let Ok(ack) = ReconcilePayload::decode(payload) else {
        return;
    };
    klog_debug!("wki: reconcile with {} acked, {} resource(s) expected", src.0, ack.num_resources);
}

// ---------------------------------------------------------------------
// Reliable per-channel messages (spec §4.C and everything carried over it)
// ---------------------------------------------------------------------

fn deliver_channel_message(transport: &dyn Transport, header: &WireHeader, src: NodeId, msg_type: MsgType, payload: &[u8], now_ns: u64) {
    let channel_id = header.channel_id;
    let st = state();
    let Some(idx) = st.find_channel(src, channel_id).or_else(|| {
        // A peer may legitimately open a well-known channel implicitly by
        // just sending on it (the four well-known ids need no CHANNEL_OPEN
        // handshake); dynamic ids always go through ChannelOpen first.
        if channel_id < ChannelId::DYNAMIC_BASE {
            st.open_channel(src, channel_id, priority_for_channel(channel_id), credits_for_channel(channel_id));
            st.find_channel(src, channel_id)
        } else {
            None
        }
    }) else {
        return;
    };

    let Some(mac) = mac_for(src) else { return };
    let mut ready = Vec::new();
    let mut emit_ack = false;
    st.with_channel(idx, |channel| {
        let outcome = channel.on_receive(header, payload, now_ns);
        emit_ack = outcome.emit_ack_now;
        ready = outcome.ready;
    });
    if emit_ack {
        st.with_channel(idx, |channel| {
            let _ = channel.send_bare_ack(transport, mac, st.my_node_id, src, false, now_ns);
        });
    }
    let _ = msg_type;
    for msg in ready {
        dispatch_ready_message(transport, src, channel_id, msg, now_ns);
    }
}

fn channel_send(transport: &dyn Transport, dst: NodeId, channel_id: u16, msg_type: MsgType, payload: &[u8], now_ns: u64) -> Result<(), WkiError> {
    let st = state();
    let Some(mac) = mac_for(dst) else { return Err(WkiError::NoRoute) };
    let Some(idx) = st.find_channel(dst, channel_id) else { return Err(WkiError::NotFound) };
    st.with_channel(idx, |channel| channel.send(transport, mac, st.my_node_id, dst, msg_type, payload, false, now_ns))
        .unwrap_or(Err(WkiError::NotFound))
}

/// `channel_send`, exposed to [`crate::tick`] for the periodic LOAD_REPORT
/// broadcast (the only thing outside this module that originates a
/// channel-routed send rather than reacting to one).
pub(crate) fn channel_send_public(transport: &dyn Transport, dst: NodeId, channel_id: u16, msg_type: MsgType, payload: &[u8], now_ns: u64) -> Result<(), WkiError> {
    channel_send(transport, dst, channel_id, msg_type, payload, now_ns)
}

/// Resend one event-bus delivery that's past its ack deadline (spec §4.I).
pub(crate) fn retransmit_event_publish(transport: &dyn Transport, retransmit: wki_eventbus::PendingRetransmit, now_ns: u64) {
    let mut buf = alloc::vec![0u8; EventPublishPayload::PREFIX_LEN + retransmit.data.len()];
    EventPublishPayload::encode_prefix(&mut buf, retransmit.event_class, retransmit.event_id, retransmit.origin.0, retransmit.data.len() as u16);
    buf[EventPublishPayload::PREFIX_LEN..].copy_from_slice(&retransmit.data);
    let _ = channel_send(transport, retransmit.subscriber, ChannelId::EventBus as u16, MsgType::EventPublish, &buf, now_ns);
}

fn dispatch_ready_message(transport: &dyn Transport, src: NodeId, channel_id: u16, msg: ReadyMessage, now_ns: u64) {
    let payload = msg.payload.as_slice();
    match msg.msg_type {
        MsgType::DataAck => {}
        MsgType::ChannelOpen => handle_channel_open(transport, src, payload, now_ns),
        MsgType::ChannelOpenAck => handle_channel_open_ack(src, payload),
        MsgType::ChannelClose => handle_channel_close(src, payload),

        MsgType::ZoneCreateReq => handle_zone_create_req(transport, src, payload, now_ns),
        MsgType::ZoneCreateAck => handle_zone_create_ack(transport, src, payload),
        MsgType::ZoneDestroy => handle_zone_destroy(src, payload),
        MsgType::ZoneNotify => handle_zone_notify(transport, src, payload, now_ns),
        MsgType::ZoneNotifyAck => {}
        MsgType::ZoneReadReq => handle_zone_read_req(transport, src, payload, now_ns),
        MsgType::ZoneReadResp => {}
        MsgType::ZoneWriteReq => handle_zone_write_req(transport, src, payload, now_ns),
        MsgType::ZoneWriteAck => {}

        MsgType::EventSubscribe => handle_event_subscribe(transport, src, payload, now_ns),
        MsgType::EventPublish => handle_event_publish(transport, src, payload, now_ns),
        MsgType::EventAck => handle_event_ack(src, payload),

        MsgType::ResourceAdvert => handle_resource_advert(src, payload),
        MsgType::DevAttachReq => handle_dev_attach_req(transport, src, payload, now_ns),
        MsgType::DevAttachAck => handle_dev_attach_ack(src, payload),
        MsgType::DevDetach => handle_dev_detach(src, payload),
        MsgType::DevOpReq => handle_dev_op_req(transport, src, channel_id, payload, now_ns),
        MsgType::DevOpResp => {}
        MsgType::DevIrqFwd => handle_dev_irq_fwd(src, payload),

        MsgType::TaskSubmit => handle_task_submit(transport, src, payload, now_ns),
        MsgType::TaskResponse => handle_task_response(src, payload),
        MsgType::TaskComplete => handle_task_complete(src, payload),
        MsgType::TaskCancel => handle_task_cancel(transport, src, payload, now_ns),
        MsgType::LoadReport => handle_load_report(src, payload, now_ns),

        // Peer-lifecycle/routing types never reach here — they're consumed
        // directly in `deliver_frame` before a channel lookup happens.
        MsgType::Hello | MsgType::HelloAck | MsgType::Heartbeat | MsgType::FenceNotify | MsgType::Goodbye => {}
        MsgType::LinkStateAdvert | MsgType::ReconcileReq | MsgType::ReconcileAck => {}
    }
}

// ---------------------------------------------------------------------
// Dynamic channel open/close (spec §4.C.1)
// ---------------------------------------------------------------------

fn handle_channel_open(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = ChannelOpenPayload::decode(payload) else {
        return;
    };
    let priority = if req.priority == 0 { Priority::Latency } else { Priority::Throughput };
    let st = state();
    let opened = st.open_channel(src, req.requested_channel_id, priority, CREDITS_DYNAMIC);
    if opened {
        if let Some(idx) = st.find_channel(src, req.requested_channel_id) {
            st.with_channel(idx, |channel| channel.grant_initial_credits(req.initial_credits));
        }
    }
    let Some(mac) = mac_for(src) else { return };
    let ack = ChannelOpenAckPayload {
        assigned_channel_id: req.requested_channel_id,
        status: if opened { 0 } else { 1 },
        initial_credits: CREDITS_DYNAMIC,
    };
    let mut buf = [0u8; ChannelOpenAckPayload::LEN];
    ack.encode(&mut buf);
    send_control_frame(transport, mac, MsgType::ChannelOpenAck, src, &buf);
    let _ = now_ns;
}

fn handle_channel_open_ack(src: NodeId, payload: &[u8]) {
    let Ok(ack) = ChannelOpenAckPayload::decode(payload) else {
        return;
    };
    if ack.status != 0 {
        state().close_channel(src, ack.assigned_channel_id);
        return;
    }
    let st = state();
    if let Some(idx) = st.find_channel(src, ack.assigned_channel_id) {
        st.with_channel(idx, |channel| channel.grant_initial_credits(ack.initial_credits));
    }
}

fn handle_channel_close(src: NodeId, payload: &[u8]) {
    let Ok(req) = ChannelClosePayload::decode(payload) else {
        return;
    };
    state().close_channel(src, req.channel_id);
}

// ---------------------------------------------------------------------
// Zones (spec §4.J)
// ---------------------------------------------------------------------

fn handle_zone_create_req(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = ZoneCreateReqPayload::decode(payload) else {
        return;
    };
    let Some(phys) = phys_allocator() else { return };
    let ack = state().zones.handle_create_req(src, &req, transport, phys);
    let _ = channel_send_zone_mgmt(transport, src, MsgType::ZoneCreateAck, &encode_zone_create_ack(&ack), now_ns);
}

fn encode_zone_create_ack(ack: &ZoneCreateAckPayload) -> [u8; ZoneCreateAckPayload::LEN] {
    let mut buf = [0u8; ZoneCreateAckPayload::LEN];
    ack.encode(&mut buf);
    buf
}

fn handle_zone_create_ack(transport: &dyn Transport, src: NodeId, payload: &[u8]) {
    let Ok(ack) = ZoneCreateAckPayload::decode(payload) else {
        return;
    };
    let Some(phys) = phys_allocator() else { return };
    let _ = state().zones.on_create_ack(src, &ack, transport, phys);
}

fn handle_zone_destroy(src: NodeId, payload: &[u8]) {
    let Ok(req) = ZoneDestroyPayload::decode(payload) else {
        return;
    };
    state().zones.destroy(src, req.zone_id);
}

fn handle_zone_notify(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(notify) = ZoneNotifyPayload::decode(payload) else {
        return;
    };
    if let Some(reply) = state().zones.on_notify(src, &notify) {
        let mut buf = [0u8; ZoneNotifyPayload::LEN];
        reply.encode(&mut buf);
        let _ = channel_send_zone_mgmt(transport, src, MsgType::ZoneNotify, &buf, now_ns);
    }
    let ack = ZoneNotifyAckPayload { zone_id: notify.zone_id };
    let mut buf = [0u8; ZoneNotifyAckPayload::LEN];
    ack.encode(&mut buf);
    let _ = channel_send_zone_mgmt(transport, src, MsgType::ZoneNotifyAck, &buf, now_ns);
}

fn handle_zone_read_req(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = ZoneReadReqPayload::decode(payload) else {
        return;
    };
    let Some(phys) = phys_allocator() else { return };
    let mut data = alloc::vec![0u8; req.length as usize];
    let result = state().zones.handle_read(src, req.zone_id, req.offset, req.length, phys, &mut data);
    let (offset, data) = match result {
        Ok(n) => (req.offset, &data[..n]),
        Err(_) => (req.offset, &data[..0]),
    };
    let mut buf = alloc::vec![0u8; ZoneDataPayload::PREFIX_LEN + data.len()];
    ZoneDataPayload::encode_prefix(&mut buf, req.zone_id, offset, data.len() as u32);
    buf[ZoneDataPayload::PREFIX_LEN..].copy_from_slice(data);
    let _ = channel_send_zone_mgmt(transport, src, MsgType::ZoneReadResp, &buf, now_ns);
}

fn handle_zone_write_req(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = ZoneDataPayload::decode(payload) else {
        return;
    };
    let Some(phys) = phys_allocator() else { return };
    let result = state().zones.handle_write(src, req.zone_id, req.offset, req.data, phys);
    let status = match result {
        Ok(()) => 0,
        Err(e) => status_code(e),
    };
    let ack = ZoneWriteAckPayload { zone_id: req.zone_id, status };
    let mut buf = [0u8; ZoneWriteAckPayload::LEN];
    ack.encode(&mut buf);
    let _ = channel_send_zone_mgmt(transport, src, MsgType::ZoneWriteAck, &buf, now_ns);
}

fn channel_send_zone_mgmt(transport: &dyn Transport, dst: NodeId, msg_type: MsgType, payload: &[u8], now_ns: u64) -> Result<(), WkiError> {
    channel_send(transport, dst, ChannelId::ZoneMgmt as u16, msg_type, payload, now_ns)
}

fn status_code(e: WkiError) -> i32 {
    match e {
        WkiError::NotFound => -1,
        WkiError::Busy => -2,
        WkiError::InvalidArgument => -3,
        WkiError::TxFailed => -4,
        WkiError::NoMemory => -5,
        WkiError::ZoneNotFound => -6,
        WkiError::ZoneAccessDenied => -7,
        WkiError::ZoneInactive => -8,
        _ => -127,
    }
}

// ---------------------------------------------------------------------
// Event bus (spec §4.I)
// ---------------------------------------------------------------------

/// Publish a locally-originated `EVENT_CLASS_SYSTEM` event (NODE_JOIN/
/// NODE_LEAVE) to every current subscriber.
fn publish_system_event(transport: &dyn Transport, event_id: u16, node: NodeId, now_ns: u64) {
    let data = node.0.to_le_bytes();
    let my_node = state().my_node_id;
    for (subscriber, _mode) in state().eventbus.publish(EVENT_CLASS_SYSTEM, event_id, &data, now_ns) {
        if subscriber == my_node {
            continue;
        }
        let mut buf = alloc::vec![0u8; EventPublishPayload::PREFIX_LEN + data.len()];
        EventPublishPayload::encode_prefix(&mut buf, EVENT_CLASS_SYSTEM, event_id, my_node.0, data.len() as u16);
        buf[EventPublishPayload::PREFIX_LEN..].copy_from_slice(&data);
        let _ = channel_send(transport, subscriber, ChannelId::EventBus as u16, MsgType::EventPublish, &buf, now_ns);
    }
}

fn handle_event_subscribe(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = EventSubscribePayload::decode(payload) else {
        return;
    };
    let replay = state().eventbus.on_subscribe(src, &req);
    for entry in replay {
        let mut buf = alloc::vec![0u8; EventPublishPayload::PREFIX_LEN + entry.data.len()];
        EventPublishPayload::encode_prefix(&mut buf, entry.event_class, entry.event_id, entry.origin.0, entry.data.len() as u16);
        buf[EventPublishPayload::PREFIX_LEN..].copy_from_slice(&entry.data);
        let _ = channel_send(transport, src, ChannelId::EventBus as u16, MsgType::EventPublish, &buf, now_ns);
    }
}

fn handle_event_publish(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(publish) = EventPublishPayload::decode(payload) else {
        return;
    };
    let origin = NodeId(publish.origin_node);
    let ack = EventAckPayload { event_class: publish.event_class, event_id: publish.event_id, origin_node: origin.0 };
    let mut buf = [0u8; EventAckPayload::LEN];
    ack.encode(&mut buf);
    let _ = channel_send(transport, src, ChannelId::EventBus as u16, MsgType::EventAck, &buf, now_ns);

    for (subscriber, _mode) in state().eventbus.publish(publish.event_class, publish.event_id, publish.data, now_ns) {
        if subscriber == state().my_node_id {
            continue;
        }
        let mut fwd = alloc::vec![0u8; EventPublishPayload::PREFIX_LEN + publish.data.len()];
        EventPublishPayload::encode_prefix(&mut fwd, publish.event_class, publish.event_id, origin.0, publish.data.len() as u16);
        fwd[EventPublishPayload::PREFIX_LEN..].copy_from_slice(publish.data);
        let _ = channel_send(transport, subscriber, ChannelId::EventBus as u16, MsgType::EventPublish, &fwd, now_ns);
    }
}

fn handle_event_ack(src: NodeId, payload: &[u8]) {
    let Ok(ack) = EventAckPayload::decode(payload) else {
        return;
    };
    state().eventbus.on_ack(src, ack.event_class, ack.event_id, NodeId(ack.origin_node));
}

// ---------------------------------------------------------------------
// Resource remoting (spec §4.F-H)
// ---------------------------------------------------------------------

fn handle_resource_advert(src: NodeId, payload: &[u8]) {
    let Ok(advert) = ResourceAdvertPayload::decode(payload) else {
        return;
    };
    let Some(resource_type) = ResourceType::from_u8(advert.resource_type as u8) else {
        return;
    };
    state().resources.on_advert(src, resource_type, advert.resource_id, advert.name, advert.flags);
}

fn handle_dev_attach_req(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = DevAttachReqPayload::decode(payload) else {
        return;
    };
    let st = state();
    let max_op_size = transport.mtu().min(u16::MAX as usize) as u16;
    let outcome = st.devserver.handle_attach_req(src, &req, &st.resources, max_op_size);
    let (status, channel, max_op_size) = match outcome {
        wki_devserver::AttachOutcome::Ok { channel, max_op_size } => {
            st.open_channel(src, channel, Priority::Throughput, CREDITS_DYNAMIC);
            (0u8, channel, max_op_size)
        }
        wki_devserver::AttachOutcome::NotFound => (1, 0, 0),
        wki_devserver::AttachOutcome::NotRemotable => (2, 0, 0),
        wki_devserver::AttachOutcome::Busy => (3, 0, 0),
    };
    let Some(mac) = mac_for(src) else { return };
    let ack = DevAttachAckPayload { status, assigned_channel: channel, max_op_size };
    let mut buf = [0u8; DevAttachAckPayload::LEN];
    ack.encode(&mut buf);
    send_control_frame(transport, mac, MsgType::DevAttachAck, src, &buf);
    let _ = now_ns;
}

fn handle_dev_attach_ack(src: NodeId, payload: &[u8]) {
    let Ok(ack) = DevAttachAckPayload::decode(payload) else {
        return;
    };
    let st = state();
    let Some(resource_id) = st.devproxy.pending_for_target(src) else {
        return;
    };
    st.devproxy.on_attach_ack(src, resource_id, &ack);
}

fn handle_dev_detach(src: NodeId, payload: &[u8]) {
    let Ok(req) = DevDetachPayload::decode(payload) else {
        return;
    };
    state().devserver.handle_detach(src, req.resource_id as u16);
}

fn handle_dev_op_req(transport: &dyn Transport, src: NodeId, channel_id: u16, payload: &[u8], now_ns: u64) {
    let Ok(req) = DevOpReqPayload::decode(payload) else {
        return;
    };
    let Some(op) = DeviceOp::from_u16(req.op_id) else {
        return;
    };
    let st = state();
    let mut out = alloc::vec![0u8; wki_lib::config::ZONE_CHUNK_MAX.max(512)];
    let outcome: OpOutcome = st.devserver.handle_op_req(src, channel_id, op, req.data, &mut out);
    let mut resp = alloc::vec![0u8; DevOpRespPayload::PREFIX_LEN + outcome.data_len];
    DevOpRespPayload::encode_prefix(&mut resp, req.op_id, outcome.status, outcome.data_len as u16);
    resp[DevOpRespPayload::PREFIX_LEN..].copy_from_slice(&out[..outcome.data_len]);
    let _ = channel_send(transport, src, channel_id, MsgType::DevOpResp, &resp, now_ns);
}

fn handle_dev_irq_fwd(src: NodeId, payload: &[u8]) {
    let Ok(fwd) = DevIrqFwdPayload::decode(payload) else {
        return;
    };
    klog_debug!("wki: DEV_IRQ_FWD from {} device {} vector {}", src.0, fwd.device_id, fwd.irq_vector);
}

// ---------------------------------------------------------------------
// Remote compute (spec §4.K)
// ---------------------------------------------------------------------

fn handle_task_submit(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(submit) = TaskSubmitPayload::decode(payload) else {
        return;
    };
    let Some(scheduler) = task_scheduler() else { return };
    let (binary, args): (&[u8], &[u8]) = match submit.body {
        TaskSubmitBody::Inline { binary } => (binary, submit.args),
        _ => (&[], submit.args),
    };
    let resp = state().compute_server.handle_submit(src, submit.task_id, binary, args, scheduler);
    let Some(mac) = mac_for(src) else { return };
    let mut buf = [0u8; TaskResponsePayload::LEN];
    resp.encode(&mut buf);
    send_control_frame(transport, mac, MsgType::TaskResponse, src, &buf);
    let _ = now_ns;
}

fn handle_task_response(src: NodeId, payload: &[u8]) {
    let Ok(resp) = TaskResponsePayload::decode(payload) else {
        return;
    };
    state().compute_client.on_response(src, &resp);
}

fn handle_task_complete(src: NodeId, payload: &[u8]) {
    let Ok(complete) = TaskCompletePayload::decode(payload) else {
        return;
    };
    state().compute_client.on_complete(src, &complete);
}

fn handle_task_cancel(transport: &dyn Transport, src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(req) = TaskCancelPayload::decode(payload) else {
        return;
    };
    if let Some(killed) = state().compute_server.handle_cancel(src, req.task_id) {
        klog_debug!("wki: task {} (pid {}) cancelled by {}", killed.task_id, killed.remote_pid, src.0);
    }
    let _ = (transport, now_ns);
}

fn handle_load_report(src: NodeId, payload: &[u8], now_ns: u64) {
    let Ok(report) = LoadReportPayload::decode(payload) else {
        return;
    };
    state().load_cache.record(src, &report, now_ns / 1_000_000);
}

/// Entry point for the embedding kernel's process-exit path: a task placed
/// here on behalf of `origin` just exited, so `origin` needs a
/// `TASK_COMPLETE`. Unlike every other handler above this isn't
/// wire-triggered — the scheduler calls it directly when the remote-origin
/// process it's tracking terminates.
pub fn on_local_task_exit(origin: NodeId, task_id: u32, exit_status: i32, output: &[u8]) {
    let Some((task_id, exit_status, output)) = state().compute_server.handle_exit(origin, task_id, exit_status, output) else {
        return;
    };
    let Some(mac) = mac_for(origin) else { return };
    let mut buf = alloc::vec![0u8; TaskCompletePayload::PREFIX_LEN + output.len()];
    TaskCompletePayload::encode_prefix(&mut buf, task_id, exit_status, output.len() as u16);
    buf[TaskCompletePayload::PREFIX_LEN..].copy_from_slice(&output);
    send_control_frame(state().transport, mac, MsgType::TaskComplete, origin, &buf);
}

/// Scheduler placement hook (spec §4.K): called by the embedding kernel
/// when local placement of `task_id` is infeasible, instead of giving up.
/// Consults the load cache for a peer idle enough to be worth a round
/// trip and, if one exists, hands the task off via `TASK_SUBMIT`.
///
/// Returns the node the task was submitted to, so the caller can
/// transition the local task to dead and track completion through
/// `wki_compute::TaskClient::poll_submit`/`poll_wait`. Returns `None` if
/// no peer is idle enough or the local submit-table is full, in which
/// case the caller should fall back to local placement (or fail the task).
pub fn try_remote_placement(task_id: u32, binary: &[u8], args: &[u8], local_load_pct: u16, now_ns: u64) -> Option<NodeId> {
    let target = state().load_cache.least_loaded_node(local_load_pct, now_ns / 1_000_000)?;
    if !state().compute_client.begin_submit(target, task_id, now_ns) {
        return None;
    }
    let mac = mac_for(target)?;
    let prefix_len = 12;
    let mut buf = alloc::vec![0u8; prefix_len + binary.len() + args.len()];
    TaskSubmitPayload::encode_inline_prefix(&mut buf, task_id, binary.len() as u32, args.len() as u16);
    buf[prefix_len..prefix_len + binary.len()].copy_from_slice(binary);
    buf[prefix_len + binary.len()..].copy_from_slice(args);
    send_control_frame(state().transport, mac, MsgType::TaskSubmit, target, &buf);
    Some(target)
}
