//! Fast header processing for the wire protocol.
//!
//! This module defines the 24-byte fast header that lets a session loop
//! dispatch a frame without parsing its metadata or payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fast header size in bytes
pub const FAST_HEADER_SIZE: usize = 24;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Credential presentation from client to server
    Login = 0x01,
    /// Server verdict on a LOGIN, carries the session id on success
    LoginResult = 0x02,
    /// Liveness message
    Ping = 0x03,
    /// Liveness reply
    Pong = 0x04,
    /// Typed tunnel message, wire name in metadata
    Message = 0x05,
    /// Published IPC object list request/response
    ObjectList = 0x06,
    /// Session termination
    Bye = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Login),
            0x02 => Ok(FrameType::LoginResult),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x05 => Ok(FrameType::Message),
            0x06 => Ok(FrameType::ObjectList),
            0x07 => Ok(FrameType::Bye),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Frame is a response to a request carrying the same corr_id
        const RESPONSE = 1 << 0;
        /// Meta has "hdr_csum" u32; readers may validate
        const HDR_CHECKSUM = 1 << 1;
    }
}

/// Status codes for control frames
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// Retryable error
    Retryable = 1,
    /// Fatal error (authentication rejected, protocol violation)
    Fatal = 2,
    /// Service busy
    Busy = 3,
    /// Unsupported operation
    Unsupported = 4,
}

impl TryFrom<u8> for StatusCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Retryable),
            2 => Ok(StatusCode::Fatal),
            3 => Ok(StatusCode::Busy),
            4 => Ok(StatusCode::Unsupported),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Fast header structure (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastHeader {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame type
    pub typ: FrameType,
    /// Frame flags
    pub flags: Flags,
    /// Status code for control frames
    pub code: StatusCode,
    /// Reserved field (must be zero)
    pub reserved0: u8,
    /// Reserved field (must be zero)
    pub reserved1: u16,
    /// Monotonically increasing per sender
    pub msg_id: u64,
    /// Optional correlation ID (0 if none)
    pub corr_id: u64,
}

impl FastHeader {
    /// Create a new fast header with default values
    pub fn new(typ: FrameType, msg_id: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            code: StatusCode::Ok,
            reserved0: 0,
            reserved1: 0,
            msg_id,
            corr_id: 0,
        }
    }

    /// Encode the fast header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.code as u8);
        buf.put_u8(self.reserved0);
        buf.put_u16(self.reserved1);
        buf.put_u64(self.msg_id);
        buf.put_u64(self.corr_id);
    }

    /// Decode the fast header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FAST_HEADER_SIZE {
            return Err(crate::WireError::Truncated(buf.len()));
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::Reserved)?;
        let code = StatusCode::try_from(buf.get_u8())?;
        let reserved0 = buf.get_u8();
        let reserved1 = buf.get_u16();

        if reserved0 != 0 || reserved1 != 0 {
            return Err(crate::WireError::Reserved);
        }

        let msg_id = buf.get_u64();
        let corr_id = buf.get_u64();

        Ok(Self {
            ver,
            typ,
            flags,
            code,
            reserved0,
            reserved1,
            msg_id,
            corr_id,
        })
    }
}

/// Calculate CRC32 checksum over the encoded fast header
pub fn crc32_fast_header(fast: &FastHeader) -> u32 {
    let mut hasher = crc32fast::Hasher::new();

    let mut buf = BytesMut::with_capacity(FAST_HEADER_SIZE);
    fast.encode(&mut buf);
    hasher.update(&buf);

    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x01).unwrap(), FrameType::Login);
        assert_eq!(FrameType::try_from(0x07).unwrap(), FrameType::Bye);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_fast_header_encode_decode() {
        let mut header = FastHeader::new(FrameType::Message, 42);
        header.flags = Flags::RESPONSE;
        header.code = StatusCode::Fatal;
        header.corr_id = 123;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FAST_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FastHeader::decode(&mut bytes).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn test_decode_rejects_reserved_bits() {
        let header = FastHeader::new(FrameType::Ping, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[5] = 1;

        let mut bytes = buf.freeze();
        assert!(matches!(
            FastHeader::decode(&mut bytes),
            Err(crate::WireError::Reserved)
        ));
    }

    #[test]
    fn test_decode_rejects_version_and_short_input() {
        let header = FastHeader::new(FrameType::Ping, 3);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let mut short = buf.clone().freeze().slice(..10);
        assert!(matches!(
            FastHeader::decode(&mut short),
            Err(crate::WireError::Truncated(10))
        ));

        buf[0] = 2;
        let mut bytes = buf.freeze();
        assert!(matches!(
            FastHeader::decode(&mut bytes),
            Err(crate::WireError::Version(2))
        ));
    }
}
