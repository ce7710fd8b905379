//! Encoding and decoding for the wire protocol.
//!
//! This module provides the frame builder and CBOR metadata helpers.

use crate::frame::Frame;
use crate::header::{crc32_fast_header, FastHeader, Flags, StatusCode};
use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame builder for constructing wire frames
#[derive(Debug)]
pub struct FrameBuilder {
    fast: FastHeader,
    meta: MetaBuilder,
    payload: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(fast: FastHeader) -> Self {
        Self {
            fast,
            meta: MetaBuilder::new(),
            payload: Bytes::new(),
        }
    }

    /// Set the status code
    pub fn code(mut self, code: StatusCode) -> Self {
        self.fast.code = code;
        self
    }

    /// Set the correlation id
    pub fn corr_id(mut self, corr_id: u64) -> Self {
        self.fast.corr_id = corr_id;
        self
    }

    /// Add frame flags
    pub fn flags(mut self, flags: Flags) -> Self {
        self.fast.flags |= flags;
        self
    }

    /// Insert string metadata
    pub fn meta_insert_str(mut self, key: &str, value: &str) -> Self {
        self.meta = self.meta.insert_str(key, value);
        self
    }

    /// Insert u32 metadata
    pub fn meta_insert_u32(mut self, key: &str, value: u32) -> Self {
        self.meta = self.meta.insert_u32(key, value);
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build the frame
    pub fn build(mut self, max_frame: usize) -> Result<Bytes, CodecError> {
        if self.fast.flags.contains(Flags::HDR_CHECKSUM) {
            let checksum = crc32_fast_header(&self.fast);
            self.meta = self.meta.insert_u32("hdr_csum", checksum);
        }

        let meta_raw = self.meta.build()?;
        let frame = Frame::new(self.fast, meta_raw, self.payload);

        frame.encode(max_frame).map_err(CodecError::Wire)
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
    /// Payload encoding error
    #[error("payload encoding failed")]
    PayloadEncode,
    /// Payload decoding error
    #[error("payload decoding failed")]
    PayloadDecode,
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    if meta_raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u32> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
    use crate::header::FrameType;
    use bytes::BytesMut;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str("user", "bob")
            .insert_u32("port", 7000)
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_str(&parsed, "user"), Some("bob".to_string()));
        assert_eq!(get_meta_u32(&parsed, "port"), Some(7000));
        // Wrong type reads as absent
        assert_eq!(get_meta_u32(&parsed, "user"), None);
        assert_eq!(get_meta_str(&parsed, "missing"), None);
    }

    #[test]
    fn test_empty_meta_parses_to_empty_map() {
        assert!(parse_meta(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_frame_builder_with_checksum() {
        let frame_bytes = FrameBuilder::new(FastHeader::new(FrameType::Login, 7))
            .flags(Flags::HDR_CHECKSUM)
            .meta_insert_str("user", "bob")
            .payload(Bytes::from_static(b"hello"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(frame_bytes.as_ref());
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.fast.typ, FrameType::Login);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));

        // Corrupt the msg_id: the checksum must no longer match
        let mut corrupted = BytesMut::from(frame_bytes.as_ref());
        corrupted[4 + 8] ^= 0xFF;
        assert!(matches!(
            decoder.decode(&mut corrupted),
            Err(crate::WireError::HdrCsum)
        ));
    }
}
