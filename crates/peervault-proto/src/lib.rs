//! # PeerVault Protocol
//!
//! The binary sync wire protocol spoken between peer sessions. Every
//! message is a single frame:
//!
//! ```text
//! | u8 type | u64 timestamp (big-endian, ms since epoch) | payload |
//! ```
//!
//! All multi-byte integers are big-endian. Large byte arrays carry a `u32`
//! length prefix; short strings and counts carry a `u16` prefix, with 0
//! meaning "absent" where a field is optional.
//!
//! The transport below this layer provides reliable, ordered delivery of
//! whole frames; nothing here handles retransmission or fragmentation
//! (snapshots are chunked explicitly via `SNAPSHOT_CHUNK`).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{deserialize, serialize};
pub use error::ProtocolError;
pub use message::{
    AnnounceReason, Envelope, ErrorCode, LeaveReason, Message, MessageType, PeerInfo,
    VersionExtension, VersionInfo, PROTOCOL_VERSION,
};

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Minimum frame size: type byte plus timestamp.
pub const MIN_FRAME_SIZE: usize = 9;
