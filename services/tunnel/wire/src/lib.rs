//! Wire protocol framing, encoding/decoding and typed control messages for the tunnel.
//!
//! This crate provides the low-level wire protocol shared by every tunnel
//! transport: length-prefixed frames with a fixed fast header, CBOR metadata,
//! and the typed tunnel coordination messages exchanged over a session.
//!
//! ## Features
//!
//! - **Fast Header Processing**: 24-byte fixed header carrying type, flags and ids
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CBOR Metadata**: Extensible metadata using canonical CBOR
//! - **Tunnel Messages**: `ListenerCreated` / `ExternalAddressDiscovered` keyed by wire name
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Fast Header (24B)    | type, flags, status, ids   |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | metadata (CBOR)            |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;

// Re-export main types
pub use codec::{get_meta_str, get_meta_u32, parse_meta, CodecError, FrameBuilder, MetaBuilder};
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use header::{crc32_fast_header, FastHeader, Flags, FrameType, StatusCode, FAST_HEADER_SIZE};
pub use message::{ListenerAddress, TunnelMessage, EXTERNAL_ADDRESS_WIRE_NAME, LISTENER_CREATED_WIRE_NAME};
