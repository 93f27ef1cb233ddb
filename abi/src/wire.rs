//! The 32-byte WKI wire header, CRC32, and RFC-1982 sequence arithmetic.
//!
//! One `WireHeader` precedes every message on every transport. Integers are
//! little-endian on the wire regardless of host endianness (the cluster is
//! assumed little-endian-homogeneous, so this is a formatting convention
//! rather than a portability requirement — see the crate's non-goals).

use bitflags::bitflags;

/// Protocol version carried in the high nibble of `version_flags`.
pub const WKI_VERSION: u8 = 1;

/// Size of [`WireHeader`] on the wire, in bytes.
pub const HEADER_LEN: usize = 32;

/// EtherType used when WKI frames ride directly on Ethernet.
pub const WKI_ETHERTYPE: u16 = 0x88B7;

/// Default TTL for a freshly originated (non-forwarded) frame.
pub const DEFAULT_TTL: u8 = 16;

bitflags! {
    /// Low nibble of `version_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// `ack_num` carries a valid piggybacked ACK.
        const ACK_PRESENT = 0x08;
        /// Request the latency-optimized path (bare ACK instead of waiting
        /// for the periodic timer).
        const PRIORITY    = 0x04;
        /// This frame is one op-level chunk of a larger logical message.
        const FRAGMENT    = 0x02;
    }
}

/// Errors decoding a raw byte buffer into a [`WireHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than [`HEADER_LEN`], or payload shorter than
    /// `payload_len` declared in the header.
    Truncated,
    /// Non-zero checksum field did not match the computed CRC32.
    ChecksumMismatch,
}

pub type WireResult<T> = Result<T, WireError>;

/// The fixed 32-byte header that precedes every WKI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u8,
    pub flags: HeaderFlags,
    pub msg_type: u8,
    pub src_node: u16,
    pub dst_node: u16,
    pub channel_id: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub payload_len: u16,
    pub credits: u8,
    pub hop_ttl: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum: u32,
    pub reserved: u32,
}

impl WireHeader {
    /// Build a header for a freshly originated frame; `checksum` is left at
    /// `0` (the caller fills it in via [`WireHeader::encode`] when a
    /// non-zero checksum is required for a forwarded frame).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        msg_type: u8,
        src_node: u16,
        dst_node: u16,
        channel_id: u16,
        seq_num: u32,
        payload_len: u16,
    ) -> Self {
        Self {
            version: WKI_VERSION,
            flags: HeaderFlags::empty(),
            msg_type,
            src_node,
            dst_node,
            channel_id,
            seq_num,
            ack_num: 0,
            payload_len,
            credits: 0,
            hop_ttl: DEFAULT_TTL,
            src_port: 0,
            dst_port: 0,
            checksum: 0,
            reserved: 0,
        }
    }

    /// Encode the header into the first [`HEADER_LEN`] bytes of `out`.
    ///
    /// `out` must be at least `HEADER_LEN` bytes; the checksum field is
    /// written verbatim from `self.checksum` — callers that want CRC
    /// protection compute it over header+payload (with the checksum field
    /// zeroed) beforehand via [`crc32`]/[`crc32_continue`] and set
    /// `self.checksum` before calling this.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_LEN);
        let vf = (WKI_VERSION << 4) | (self.flags.bits() & 0x0F);
        out[0] = vf;
        out[1] = self.msg_type;
        out[2..4].copy_from_slice(&self.src_node.to_le_bytes());
        out[4..6].copy_from_slice(&self.dst_node.to_le_bytes());
        out[6..8].copy_from_slice(&self.channel_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.seq_num.to_le_bytes());
        out[12..16].copy_from_slice(&self.ack_num.to_le_bytes());
        out[16..18].copy_from_slice(&self.payload_len.to_le_bytes());
        out[18] = self.credits;
        out[19] = self.hop_ttl;
        out[20..22].copy_from_slice(&self.src_port.to_le_bytes());
        out[22..24].copy_from_slice(&self.dst_port.to_le_bytes());
        out[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        out[28..32].copy_from_slice(&self.reserved.to_le_bytes());
    }

    /// Decode a header from `buf`. Does not validate the checksum (callers
    /// needing integrity checking should call [`validate_checksum`]
    /// separately once the payload is also available).
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let vf = buf[0];
        Ok(Self {
            version: vf >> 4,
            flags: HeaderFlags::from_bits_truncate(vf & 0x0F),
            msg_type: buf[1],
            src_node: u16::from_le_bytes([buf[2], buf[3]]),
            dst_node: u16::from_le_bytes([buf[4], buf[5]]),
            channel_id: u16::from_le_bytes([buf[6], buf[7]]),
            seq_num: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            ack_num: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            payload_len: u16::from_le_bytes([buf[16], buf[17]]),
            credits: buf[18],
            hop_ttl: buf[19],
            src_port: u16::from_le_bytes([buf[20], buf[21]]),
            dst_port: u16::from_le_bytes([buf[22], buf[23]]),
            checksum: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            reserved: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
        })
    }
}

/// Validate `frame`'s checksum. `checksum == 0` means "disabled" (the
/// direct single-hop sender relies on link FCS) and always validates.
/// Otherwise recompute CRC32 over header (with the checksum field zeroed)
/// + payload and compare.
pub fn validate_checksum(frame: &[u8]) -> bool {
    if frame.len() < HEADER_LEN {
        return false;
    }
    let stored = u32::from_le_bytes([frame[24], frame[25], frame[26], frame[27]]);
    if stored == 0 {
        return true;
    }
    let mut header_copy = [0u8; HEADER_LEN];
    header_copy.copy_from_slice(&frame[..HEADER_LEN]);
    header_copy[24..28].copy_from_slice(&0u32.to_le_bytes());
    let computed = crc32_continue(crc32(&header_copy), &frame[HEADER_LEN..]);
    computed == stored
}

/// Compute the checksum to store in the header for `header` (with its
/// checksum field treated as zero) followed by `payload`.
pub fn compute_checksum(header: &WireHeader, payload: &[u8]) -> u32 {
    let mut h = *header;
    h.checksum = 0;
    let mut buf = [0u8; HEADER_LEN];
    h.encode(&mut buf);
    crc32_continue(crc32(&buf), payload)
}

// ---------------------------------------------------------------------------
// CRC32 (polynomial 0xEDB88320, reflected, matching the standard zlib/PNG
// CRC used throughout the fabric's original implementation).
// ---------------------------------------------------------------------------

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_table();

/// CRC32 of a single buffer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_continue(0xFFFF_FFFF, data) ^ 0xFFFF_FFFF ^ 0xFFFF_FFFF
}

/// CRC32 continuation: feed `data` into an in-progress CRC32 computation
/// started with a previous call's result (or `0` for a fresh computation),
/// so a header and payload can be hashed as two separate segments.
pub fn crc32_continue(prev: u32, data: &[u8]) -> u32 {
    // `prev` is the caller-visible (already-finalized, i.e. XORed) CRC from
    // a prior segment, or `0` to start; un-finalize, fold in `data`, and
    // re-finalize so two-segment composition round-trips through the
    // public API either via `crc32(&header) -> crc32_continue(_, payload)`
    // or by chaining `crc32_continue` calls directly.
    let mut crc = prev ^ 0xFFFF_FFFF;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC_TABLE[idx] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

// ---------------------------------------------------------------------------
// RFC 1982 sequence-number arithmetic, modular over u32.
// ---------------------------------------------------------------------------

/// `true` if `a` precedes `b` in the modular sequence space.
#[inline]
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `true` if `a` follows `b` in the modular sequence space.
#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// `true` if `low <= seq < high` in the modular sequence space.
#[inline]
pub fn seq_between(seq: u32, low: u32, high: u32) -> bool {
    !seq_before(seq, low) && seq_before(seq, high)
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut h = WireHeader::new(0x01, 0x1234, 0x5678, 3, 42, 10);
        h.flags = HeaderFlags::ACK_PRESENT;
        h.ack_num = 41;
        h.credits = 64;
        h.checksum = 0xDEAD_BEEF;
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        let decoded = WireHeader::decode(&buf).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn crc_two_segment_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = crc32(data);
        let (a, b) = data.split_at(17);
        let split = crc32_continue(crc32(a), b);
        assert_eq!(whole, split);
    }

    #[test]
    fn crc_known_vector() {
        // Standard CRC-32/ISO-HDLC check value for the ASCII string
        // "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn zero_checksum_always_validates() {
        let h = WireHeader::new(0x03, 1, 2, 0, 0, 0);
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        assert!(validate_checksum(&buf));
    }

    #[test]
    fn nonzero_checksum_is_checked() {
        let mut h = WireHeader::new(0x03, 1, 2, 0, 0, 4);
        let payload = [1u8, 2, 3, 4];
        h.checksum = compute_checksum(&h, &payload);
        let mut buf = [0u8; HEADER_LEN + 4];
        h.encode(&mut buf[..HEADER_LEN]);
        buf[HEADER_LEN..].copy_from_slice(&payload);
        assert!(validate_checksum(&buf));
        buf[HEADER_LEN] ^= 0xFF;
        assert!(!validate_checksum(&buf));
    }

    #[test]
    fn sequence_arithmetic_handles_wraparound() {
        let near_max = u32::MAX - 2;
        assert!(seq_before(near_max, near_max.wrapping_add(5)));
        assert!(seq_after(near_max.wrapping_add(5), near_max));
        assert!(seq_between(
            near_max.wrapping_add(1),
            near_max,
            near_max.wrapping_add(5)
        ));
    }
}
