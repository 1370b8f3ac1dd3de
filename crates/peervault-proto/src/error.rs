//! Protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header
    #[error("frame too short: {0} bytes")]
    Short(usize),

    /// Unrecognized message type byte
    #[error("unknown message type: 0x{0:02X}")]
    UnknownType(u8),

    /// A declared length runs past the end of the frame, or the payload is
    /// otherwise malformed
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),

    /// A string field was not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}
