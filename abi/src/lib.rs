//! Wire-level ABI shared by every WKI subsystem crate.
//!
//! This crate defines the byte-for-byte wire format (header, message
//! catalog, payload layouts), the node identity and sequence-number
//! arithmetic rules, and the common error type propagated out of the
//! channel engine and subsystem dispatchers. Nothing here touches a lock,
//! a socket, or a timer — those live in `wki-lib` and the subsystem crates.

#![no_std]

pub mod error;
pub mod node;
pub mod opcode;
pub mod payload;
pub mod wire;

pub use error::WkiError;
pub use node::NodeId;
pub use opcode::{ChannelId, DeviceOp, EVENT_CLASS_SYSTEM, EVENT_SYSTEM_NODE_JOIN, EVENT_SYSTEM_NODE_LEAVE, MsgType, ResourceType};
pub use wire::{WireHeader, WireResult, crc32, crc32_continue, seq_after, seq_before, seq_between};

/// Result alias used throughout the WKI crates.
pub type WkiResult<T> = Result<T, WkiError>;
