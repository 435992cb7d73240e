//! Error types for frame parsing and encoding

use thiserror::Error;

/// Errors that can occur while building or parsing multiplexer frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// DLCI outside of the 6-bit address space (or 0 where a user channel is required)
    #[error("invalid DLCI: {0}")]
    InvalidDlci(u8),

    /// Control byte does not match any supported frame type
    #[error("unsupported frame type: 0x{0:02X}")]
    UnsupportedFrameType(u8),

    /// Length octet has its extension bit clear
    #[error("multi-byte length field is not supported (length octet 0x{0:02X})")]
    MultiByteLength(u8),

    /// Payload does not fit a single-byte length field or the target buffer
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Output buffer cannot hold the encoded frame
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Structurally invalid frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
