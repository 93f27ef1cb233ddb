//! Error kinds surfaced by the channel engine and subsystem dispatchers.
//!
//! Mirrors the VfsError/NetError style used elsewhere in the tree: a plain
//! `#[repr(u8)]` enum, no `thiserror`, no payload beyond the variant itself.
//! See the propagation policy in the crate-level design notes: errors at or
//! below the channel engine surface to the caller of `send`/the spin-wait;
//! errors above the dispatcher (bad message, unknown op) are silently
//! dropped rather than surfaced, since a broken peer is handled by fencing.

/// Errors that can occur anywhere in the WKI fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WkiError {
    /// Allocation failed (arena/pool exhausted or heap allocation failed).
    NoMemory,
    /// No route to the destination node in the routing table.
    NoRoute,
    /// The peer this operation targets has been fenced.
    PeerFenced,
    /// The channel has no send credits available right now.
    NoCredits,
    /// A synchronous wait exceeded its deadline.
    Timeout,
    /// A caller-supplied argument violates a documented precondition.
    InvalidArgument,
    /// The referenced peer, channel, resource, or binding does not exist.
    NotFound,
    /// The operation cannot proceed due to resource exhaustion (e.g. a full
    /// channel pool or FD table) but is not a permanent failure.
    Busy,
    /// The transport rejected an outbound frame.
    TxFailed,
    /// No zone exists with the given id.
    ZoneNotFound,
    /// A zone with the given id already exists.
    ZoneExists,
    /// The responder rejected the zone creation request.
    ZoneRejected,
    /// The access requested is not permitted by the zone's access policy.
    ZoneAccessDenied,
    /// The zone exists but has not completed negotiation (not `Active`).
    ZoneInactive,
}

impl core::fmt::Display for WkiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            WkiError::NoMemory => "no memory",
            WkiError::NoRoute => "no route",
            WkiError::PeerFenced => "peer fenced",
            WkiError::NoCredits => "no credits",
            WkiError::Timeout => "timeout",
            WkiError::InvalidArgument => "invalid argument",
            WkiError::NotFound => "not found",
            WkiError::Busy => "busy",
            WkiError::TxFailed => "tx failed",
            WkiError::ZoneNotFound => "zone not found",
            WkiError::ZoneExists => "zone exists",
            WkiError::ZoneRejected => "zone rejected",
            WkiError::ZoneAccessDenied => "zone access denied",
            WkiError::ZoneInactive => "zone inactive",
        };
        f.write_str(s)
    }
}
