//! Message framing for the wire protocol.
//!
//! This module provides the complete frame structure including fast header,
//! metadata and payload handling.

use crate::header::{crc32_fast_header, FastHeader, Flags, FAST_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest frame a decoder accepts (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest metadata block (64 KiB)
pub(crate) const MAX_META_SIZE: usize = 64 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fast header (24 bytes)
    pub fast: FastHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(fast: FastHeader, meta_raw: Bytes, payload: Bytes) -> Self {
        Self {
            fast,
            meta_raw,
            payload,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + FAST_HEADER_SIZE + 4 + self.meta_raw.len() + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(crate::WireError::TooLarge {
                len: total_size,
                max: max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        buf.put_u32((total_size - 4) as u32);

        self.fast.encode(&mut buf);

        buf.put_u32(self.meta_raw.len() as u32);
        buf.put_slice(&self.meta_raw);

        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Validate a frame length prefix before reading the body
    pub fn check_frame_len(&self, frame_len: usize) -> Result<(), crate::WireError> {
        if frame_len > self.max_frame_size {
            return Err(crate::WireError::TooLarge {
                len: frame_len,
                max: self.max_frame_size,
            });
        }
        if frame_len < FAST_HEADER_SIZE + 4 {
            return Err(crate::WireError::Malformed);
        }
        Ok(())
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        self.check_frame_len(frame_len)?;

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let frame_buf = buf.split_to(frame_len).freeze();
        self.decode_body(frame_buf).map(Some)
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode_body(&self, mut frame_buf: Bytes) -> Result<Frame, crate::WireError> {
        let fast = FastHeader::decode(&mut frame_buf)?;

        if frame_buf.len() < 4 {
            return Err(crate::WireError::Malformed);
        }

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(crate::WireError::Meta);
        }

        let meta_raw = frame_buf.split_to(meta_len);

        if fast.flags.contains(Flags::HDR_CHECKSUM) {
            let meta = crate::codec::parse_meta(&meta_raw).map_err(|_| crate::WireError::Meta)?;
            let expected = crate::codec::get_meta_u32(&meta, "hdr_csum");
            if expected != Some(crc32_fast_header(&fast)) {
                return Err(crate::WireError::HdrCsum);
            }
        }

        Ok(Frame {
            fast,
            meta_raw,
            payload: frame_buf,
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
