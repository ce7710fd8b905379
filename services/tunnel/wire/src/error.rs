//! Wire protocol error types.

use thiserror::Error;

/// Reasons a tunnel frame cannot be encoded or decoded
#[derive(Error, Debug)]
pub enum WireError {
    /// Fewer bytes than a fast header
    #[error("truncated fast header: {0} bytes")]
    Truncated(usize),

    /// Fast header carries a version this node does not speak
    #[error("unsupported wire version {0}")]
    Version(u8),

    /// Frame length above the decoder or encoder limit
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Length of the offending frame
        len: usize,
        /// Limit in effect
        max: usize,
    },

    /// Frame body too short for its own header fields
    #[error("malformed frame")]
    Malformed,

    /// Metadata block is oversized, cut short or not a CBOR map
    #[error("invalid metadata block")]
    Meta,

    /// `hdr_csum` metadata does not match the fast header
    #[error("header checksum mismatch")]
    HdrCsum,

    /// Reserved header bits or fields are set
    #[error("reserved header bits set")]
    Reserved,

    /// Frame type byte outside the tunnel frame set
    #[error("unknown frame type {0:#04x}")]
    Type(u8),

    /// Status code byte outside the known codes
    #[error("unknown status code {0}")]
    Code(u8),

    /// MESSAGE frame names a tunnel message this node does not know
    #[error("unknown tunnel message {0:?}")]
    UnknownMessage(String),
}
