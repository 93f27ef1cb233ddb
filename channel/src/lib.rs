//! Per-(peer, channel-id) reliable datagram engine (spec §4.C).
//!
//! A [`Channel`] is peer-agnostic: it knows nothing about peer state,
//! routing, or fencing. Callers (the `peer` crate, `core`'s dispatcher)
//! supply the transport and neighbor MAC for each send/tick and act on
//! [`TickOutcome::RetransmitsExhausted`] by fencing the owning peer.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use wki_abi::wire::{HEADER_LEN, HeaderFlags, compute_checksum};
use wki_abi::{MsgType, NodeId, WireHeader, WkiError, WkiResult, seq_before};
use wki_lib::config::{FAST_RETRANSMIT_DUP_ACKS, MAX_RETRANSMITS, RTO_DEFAULT_NS, RTO_MAX_NS, RTO_MIN_NS};
use wki_transport::Transport;

/// Channel scheduling class, affecting only whether a bare ACK is emitted
/// immediately on dispatch (§4.C.3) rather than piggybacked on the next
/// timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Latency,
    Throughput,
}

struct RetransmitEntry {
    seq: u32,
    frame: Vec<u8>,
    send_time_ns: u64,
    retries: u32,
}

struct ReorderEntry {
    seq: u32,
    msg_type: MsgType,
    payload: Vec<u8>,
}

/// One message ready for dispatch: either the just-arrived in-order frame,
/// or one drained from the reorder buffer as a result of it.
pub struct ReadyMessage {
    pub msg_type: MsgType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Result of feeding one incoming frame to [`Channel::on_receive`].
#[derive(Default)]
pub struct ReceiveOutcome {
    /// Messages now ready for dispatch, in seq order.
    pub ready: Vec<ReadyMessage>,
    /// `true` if a bare ACK (`MsgType::DataAck`) should be sent immediately
    /// rather than waiting for the next timer tick.
    pub emit_ack_now: bool,
}

/// Result of a periodic [`Channel::tick`] call.
pub enum TickOutcome {
    /// Nothing due.
    Idle,
    /// A retransmission was sent.
    Retransmitted,
    /// The retransmit queue head exceeded `MAX_RETRANSMITS`; the channel is
    /// now closed and the owning peer must be fenced.
    RetransmitsExhausted,
}

/// Per-(peer, channel-id) reliable delivery state.
pub struct Channel {
    pub channel_id: u16,
    pub peer_node: NodeId,
    pub priority: Priority,

    tx_seq: u32,
    tx_ack: u32,
    rx_seq: u32,
    rx_ack_pending: u32,
    ack_pending: bool,

    tx_credits: u16,
    rx_credits: u16,

    retransmit_queue: Vec<RetransmitEntry>,
    reorder_buffer: Vec<ReorderEntry>,
    dup_ack_count: u32,

    rto_ns: u64,
    srtt_ns: u64,
    rttvar_ns: u64,
    retransmit_deadline_ns: u64,

    closed: bool,
}

impl Channel {
    pub fn new(channel_id: u16, peer_node: NodeId, priority: Priority, initial_rx_credits: u16) -> Self {
        Self {
            channel_id,
            peer_node,
            priority,
            tx_seq: 0,
            tx_ack: 0,
            rx_seq: 0,
            rx_ack_pending: 0,
            ack_pending: false,
            tx_credits: 0,
            rx_credits: initial_rx_credits,
            retransmit_queue: Vec::new(),
            reorder_buffer: Vec::new(),
            dup_ack_count: 0,
            rto_ns: RTO_DEFAULT_NS,
            srtt_ns: 0,
            rttvar_ns: 0,
            retransmit_deadline_ns: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn tx_credits(&self) -> u16 {
        self.tx_credits
    }

    /// Highest contiguous sequence the peer has acknowledged (exclusive).
    pub fn tx_ack(&self) -> u32 {
        self.tx_ack
    }

    /// Grant additional send credits to the peer's view of this channel
    /// (called once at channel-open time with the per-class default).
    pub fn grant_initial_credits(&mut self, credits: u16) {
        self.tx_credits = credits;
    }

    /// §4.C send contract. Assembles a frame, hands it to `transport`, and
    /// enqueues a retransmit entry.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        neighbor_mac: [u8; 6],
        src_node: NodeId,
        dst_node: NodeId,
        msg_type: MsgType,
        payload: &[u8],
        direct: bool,
        now_ns: u64,
    ) -> WkiResult<()> {
        if self.closed {
            return Err(WkiError::NotFound);
        }
        if self.tx_credits == 0 {
            return Err(WkiError::NoCredits);
        }
        if payload.len() > transport.mtu().saturating_sub(HEADER_LEN) {
            return Err(WkiError::InvalidArgument);
        }

        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);

        let mut header = WireHeader::new(
            msg_type as u8,
            src_node.0,
            dst_node.0,
            self.channel_id,
            seq,
            payload.len() as u16,
        );
        if self.ack_pending {
            header.flags |= HeaderFlags::ACK_PRESENT;
            header.ack_num = self.rx_ack_pending;
            self.ack_pending = false;
        }
        header.credits = self.rx_credits.min(255) as u8;
        if !direct {
            header.checksum = compute_checksum(&header, payload);
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.resize(HEADER_LEN, 0);
        header.encode(&mut frame);
        frame.extend_from_slice(payload);

        transport.tx(neighbor_mac, &frame)?;

        self.tx_credits -= 1;
        self.retransmit_queue.push(RetransmitEntry {
            seq,
            frame,
            send_time_ns: now_ns,
            retries: 0,
        });
        if self.retransmit_deadline_ns == 0 {
            self.retransmit_deadline_ns = now_ns + self.rto_ns;
        }
        Ok(())
    }

    /// §4.C receive contract, step 1: drain ACKed retransmit entries and
    /// sample RTT/replenish credits.
    fn apply_ack(&mut self, header: &WireHeader, now_ns: u64) {
        if !header.flags.contains(HeaderFlags::ACK_PRESENT) {
            return;
        }
        self.tx_credits = self.tx_credits.saturating_add(header.credits as u16);
        let ack = header.ack_num;
        let mut sample_ns = None;
        let mut highest_acked = None;
        self.retransmit_queue.retain(|entry| {
            if seq_before(entry.seq, ack) {
                if entry.retries == 0 && sample_ns.is_none() {
                    sample_ns = Some(now_ns.saturating_sub(entry.send_time_ns));
                }
                highest_acked = Some(entry.seq);
                false
            } else {
                true
            }
        });
        if let Some(seq) = highest_acked {
            self.tx_ack = self.tx_ack.max(seq.wrapping_add(1));
        }
        if let Some(sample) = sample_ns {
            self.sample_rtt(sample);
        }
        self.retransmit_deadline_ns = if self.retransmit_queue.is_empty() {
            0
        } else {
            now_ns + self.rto_ns
        };
    }

    /// Jacobson/Karels RTO estimation, clamped to [`RTO_MIN_NS`, `RTO_MAX_NS`].
    fn sample_rtt(&mut self, sample_ns: u64) {
        if self.srtt_ns == 0 {
            self.srtt_ns = sample_ns;
            self.rttvar_ns = sample_ns / 2;
        } else {
            let diff = sample_ns.abs_diff(self.srtt_ns);
            self.rttvar_ns += diff.saturating_sub(self.rttvar_ns) / 4;
            self.srtt_ns = (self.srtt_ns * 7 + sample_ns) / 8;
        }
        let rto = self.srtt_ns + 4 * self.rttvar_ns;
        self.rto_ns = rto.clamp(RTO_MIN_NS, RTO_MAX_NS);
    }

    /// §4.C receive contract, steps 2-3. `header.channel_id` is assumed to
    /// already match this channel.
    pub fn on_receive(&mut self, header: &WireHeader, payload: &[u8], now_ns: u64) -> ReceiveOutcome {
        self.apply_ack(header, now_ns);

        let mut outcome = ReceiveOutcome::default();
        let seq = header.seq_num;
        let msg_type = match MsgType::from_u8(header.msg_type) {
            Some(m) => m,
            None => return outcome,
        };

        if seq == self.rx_seq {
            self.rx_seq = self.rx_seq.wrapping_add(1);
            self.ack_pending = true;
            self.rx_ack_pending = seq;
            self.dup_ack_count = 0;
            outcome.ready.push(ReadyMessage {
                msg_type,
                seq,
                payload: payload.to_vec(),
            });
            self.drain_reorder_buffer(&mut outcome);
        } else if seq_before(self.rx_seq, seq) {
            // seq > rx_seq: out of order.
            if !self.reorder_buffer.iter().any(|e| e.seq == seq) {
                self.reorder_buffer.push(ReorderEntry {
                    seq,
                    msg_type,
                    payload: payload.to_vec(),
                });
                self.reorder_buffer.sort_by_key(|e| e.seq);
            }
            self.ack_pending = true;
            self.dup_ack_count += 1;
        } else {
            // seq < rx_seq: duplicate.
            self.ack_pending = true;
        }

        if self.priority == Priority::Latency && (!outcome.ready.is_empty() || self.ack_pending) {
            outcome.emit_ack_now = true;
        }
        outcome
    }

    fn drain_reorder_buffer(&mut self, outcome: &mut ReceiveOutcome) {
        loop {
            let Some(pos) = self.reorder_buffer.iter().position(|e| e.seq == self.rx_seq) else {
                break;
            };
            let entry = self.reorder_buffer.remove(pos);
            self.rx_seq = self.rx_seq.wrapping_add(1);
            outcome.ready.push(ReadyMessage {
                msg_type: entry.msg_type,
                seq: entry.seq,
                payload: entry.payload,
            });
        }
    }

    /// Emit a bare, payload-less `DataAck` frame (latency-class immediate
    /// ACK, or any ACK-only piggyback carrier).
    #[allow(clippy::too_many_arguments)]
    pub fn send_bare_ack(
        &mut self,
        transport: &dyn Transport,
        neighbor_mac: [u8; 6],
        src_node: NodeId,
        dst_node: NodeId,
        direct: bool,
        now_ns: u64,
    ) -> WkiResult<()> {
        self.send(
            transport,
            neighbor_mac,
            src_node,
            dst_node,
            MsgType::DataAck,
            &[],
            direct,
            now_ns,
        )
    }

    /// §4.C fast retransmit: fires once `dup_ack_count` reaches the
    /// configured threshold, resending only the retransmit-queue head.
    pub fn maybe_fast_retransmit(
        &mut self,
        transport: &dyn Transport,
        neighbor_mac: [u8; 6],
        now_ns: u64,
    ) -> bool {
        if self.dup_ack_count < FAST_RETRANSMIT_DUP_ACKS {
            return false;
        }
        self.dup_ack_count = 0;
        if let Some(entry) = self.retransmit_queue.first_mut() {
            let _ = transport.tx(neighbor_mac, &entry.frame);
            entry.retries += 1;
            entry.send_time_ns = now_ns;
            return true;
        }
        false
    }

    /// §4.C retransmit timer. Returns [`TickOutcome::RetransmitsExhausted`]
    /// once the queue head exceeds `MAX_RETRANSMITS`.
    pub fn tick(&mut self, transport: &dyn Transport, neighbor_mac: [u8; 6], now_ns: u64) -> TickOutcome {
        if self.closed || self.retransmit_deadline_ns == 0 || now_ns < self.retransmit_deadline_ns {
            return TickOutcome::Idle;
        }
        let Some(entry) = self.retransmit_queue.first_mut() else {
            self.retransmit_deadline_ns = 0;
            return TickOutcome::Idle;
        };
        if entry.retries >= MAX_RETRANSMITS {
            self.close();
            return TickOutcome::RetransmitsExhausted;
        }
        let _ = transport.tx(neighbor_mac, &entry.frame);
        entry.retries += 1;
        entry.send_time_ns = now_ns;
        self.rto_ns = (self.rto_ns * 2).min(RTO_MAX_NS);
        self.retransmit_deadline_ns = now_ns + self.rto_ns;
        TickOutcome::Retransmitted
    }

    /// Close the channel; idempotent (spec §8 "closing an already-closed
    /// channel is a no-op").
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.retransmit_queue.clear();
        self.reorder_buffer.clear();
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        sent: AtomicUsize,
    }

    impl Transport for FakeTransport {
        fn mtu(&self) -> usize {
            1500
        }
        fn rdma_capable(&self) -> bool {
            false
        }
        fn tx(&self, _neighbor_mac: [u8; 6], _frame: &[u8]) -> WkiResult<()> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn tx_broadcast(&self, _frame: &[u8]) -> WkiResult<()> {
            Ok(())
        }
        fn set_rx_handler(&self, _handler: fn(&[u8])) {}
    }

    #[test]
    fn send_without_credits_fails() {
        let transport = FakeTransport { sent: AtomicUsize::new(0) };
        let mut ch = Channel::new(16, NodeId(2), Priority::Throughput, 0);
        let res = ch.send(&transport, [0; 6], NodeId(1), NodeId(2), MsgType::DevOpReq, b"x", true, 0);
        assert_eq!(res, Err(WkiError::NoCredits));
    }

    #[test]
    fn in_order_receive_advances_rx_seq() {
        let mut ch = Channel::new(16, NodeId(2), Priority::Throughput, 64);
        let header = WireHeader::new(MsgType::DevOpReq as u8, 2, 1, 16, 0, 3);
        let outcome = ch.on_receive(&header, b"abc", 0);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(ch.rx_seq, 1);
    }

    #[test]
    fn out_of_order_then_fill_drains_in_seq_order() {
        let mut ch = Channel::new(16, NodeId(2), Priority::Throughput, 64);
        let h1 = WireHeader::new(MsgType::DevOpReq as u8, 2, 1, 16, 1, 1);
        let out_of_order = ch.on_receive(&h1, b"b", 0);
        assert!(out_of_order.ready.is_empty());
        assert_eq!(ch.dup_ack_count, 1);

        let h0 = WireHeader::new(MsgType::DevOpReq as u8, 2, 1, 16, 0, 1);
        let drained = ch.on_receive(&h0, b"a", 0);
        assert_eq!(drained.ready.len(), 2);
        assert_eq!(drained.ready[0].payload, b"a");
        assert_eq!(drained.ready[1].payload, b"b");
        assert_eq!(ch.rx_seq, 2);
    }

    #[test]
    fn retransmit_exhaustion_closes_channel() {
        let transport = FakeTransport { sent: AtomicUsize::new(0) };
        let mut ch = Channel::new(16, NodeId(2), Priority::Throughput, 64);
        ch.grant_initial_credits(4);
        ch.send(&transport, [0; 6], NodeId(1), NodeId(2), MsgType::DevOpReq, b"x", true, 0).unwrap();

        let mut now = ch.retransmit_deadline_ns;
        let mut exhausted = false;
        for _ in 0..(MAX_RETRANSMITS + 1) {
            match ch.tick(&transport, [0; 6], now) {
                TickOutcome::Retransmitted => {}
                TickOutcome::RetransmitsExhausted => {
                    exhausted = true;
                    break;
                }
                TickOutcome::Idle => panic!("expected a due retransmit"),
            }
            now = ch.retransmit_deadline_ns;
        }
        assert!(exhausted);
        assert!(ch.is_closed());
    }

    #[test]
    fn closing_twice_is_a_no_op() {
        let mut ch = Channel::new(16, NodeId(2), Priority::Throughput, 64);
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }
}
