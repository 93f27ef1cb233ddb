//! Periodic maintenance, run by the embedding kernel's timer IRQ every
//! [`wki_lib::config::TIMER_TICK_INTERVAL_MS`]: peer HELLO retry/heartbeat
//! timeout detection, LSDB aging, per-channel retransmit, event-bus
//! retransmit, and the periodic LOAD_REPORT broadcast.

use wki_abi::payload::LoadReportPayload;
use wki_abi::{ChannelId, MsgType, NodeId};
use wki_channel::TickOutcome;
use wki_lib::collab::task_scheduler;
use wki_lib::config::LOAD_REPORT_INTERVAL_MS;
use wki_lib::klog_debug;
use wki_peer::{FenceReason, PeerEvent};

use crate::dispatch;
use crate::state::state;

static LAST_LOAD_REPORT_NS: wki_lib::IrqMutex<u64> = wki_lib::IrqMutex::new(0);

/// Drive every time-based subsystem forward. Call once per timer tick with
/// the current monotonic timestamp.
pub fn timer_tick(now_ns: u64) {
    let st = state();
    let transport = st.transport;

    for event in st.peers.tick(now_ns) {
        dispatch::handle_tick_peer_event(transport, event, now_ns);
    }

    let now_ms = now_ns / 1_000_000;
    let dropped = st.router.age_lsdb(now_ms);
    for node in dropped {
        klog_debug!("wki: LSDB entry for {} aged out", node.0);
    }

    for retransmit in st.eventbus.tick(now_ns) {
        dispatch::retransmit_event_publish(transport, retransmit, now_ns);
    }

    tick_channels(now_ns);
    maybe_broadcast_load_report(now_ns);
}

fn tick_channels(now_ns: u64) {
    let st = state();
    let transport = st.transport;
    let mut to_fence: alloc::vec::Vec<NodeId> = alloc::vec::Vec::new();

    for (peer, channel_id) in st.open_channel_keys() {
        let Some(idx) = st.find_channel(peer, channel_id) else {
            continue;
        };
        let Some(mac) = st.peers.snapshot(peer).map(|s| s.mac) else {
            continue;
        };
        let outcome = st.with_channel(idx, |channel| channel.tick(transport, mac, now_ns));
        match outcome {
            Some(TickOutcome::RetransmitsExhausted) => {
                if !to_fence.contains(&peer) {
                    to_fence.push(peer);
                }
            }
            Some(_) => {
                st.with_channel(idx, |channel| channel.maybe_fast_retransmit(transport, mac, now_ns));
            }
            None => {}
        }
    }

    for peer in to_fence {
        klog_debug!("wki: channel retransmits exhausted for peer {}, fencing", peer.0);
        dispatch::handle_tick_peer_event(transport, PeerEvent::FenceDue(peer, FenceReason::HeartbeatTimeout), now_ns);
    }
}

fn maybe_broadcast_load_report(now_ns: u64) {
    let mut last = LAST_LOAD_REPORT_NS.lock();
    if now_ns.saturating_sub(*last) < LOAD_REPORT_INTERVAL_MS * 1_000_000 {
        return;
    }
    *last = now_ns;
    drop(last);

    let overloaded = task_scheduler().map(|s| s.try_remote_placement()).unwrap_or(false);
    let avg_load_pct: u16 = if overloaded { 100 } else { 0 };
    let mut buf = [0u8; LoadReportPayload::PREFIX_LEN];
    LoadReportPayload::encode_prefix(&mut buf, 0, 0, avg_load_pct, 0);

    let transport = state().transport;
    for peer in state().peers.connected_snapshots() {
        let _ = dispatch::channel_send_public(transport, peer.node_id, ChannelId::EventBus as u16, MsgType::LoadReport, &buf, now_ns);
    }
}
