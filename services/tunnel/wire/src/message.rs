//! Typed tunnel coordination messages.
//!
//! Both variants share the same field layout; consumers select the variant by
//! the wire name carried in the frame metadata (`name`). The payload is a CBOR
//! array in fixed order `[id, session_id, ip, port]`.

use crate::codec::{get_meta_str, parse_meta, CodecError, FrameBuilder};
use crate::frame::{Frame, DEFAULT_MAX_FRAME_SIZE};
use crate::header::{FastHeader, FrameType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire name of [`TunnelMessage::ListenerCreated`]
pub const LISTENER_CREATED_WIRE_NAME: &str = "CreatedServerListener";
/// Wire name of [`TunnelMessage::ExternalAddressDiscovered`]
pub const EXTERNAL_ADDRESS_WIRE_NAME: &str = "CreatedServerListener.GotExternalAddress";

/// Address of a tunnel listener as announced between endpoints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerAddress {
    /// Id assigned to the listener by the creating endpoint
    pub id: String,
    /// Session that owns the listener
    pub session_id: String,
    /// Bound (or externally visible) ip
    pub ip: String,
    /// Bound (or externally visible) port
    pub port: u16,
}

/// Tunnel control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    /// A listener was created and bound locally
    ListenerCreated(ListenerAddress),
    /// The externally visible address of a listener was discovered
    ExternalAddressDiscovered(ListenerAddress),
}

impl TunnelMessage {
    /// Build a `ListenerCreated` message
    pub fn listener_created(
        id: impl Into<String>,
        session_id: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        TunnelMessage::ListenerCreated(ListenerAddress {
            id: id.into(),
            session_id: session_id.into(),
            ip: ip.into(),
            port,
        })
    }

    /// Build an `ExternalAddressDiscovered` message
    pub fn external_address_discovered(
        id: impl Into<String>,
        session_id: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        TunnelMessage::ExternalAddressDiscovered(ListenerAddress {
            id: id.into(),
            session_id: session_id.into(),
            ip: ip.into(),
            port,
        })
    }

    /// Stable wire name identifying this variant
    pub fn wire_name(&self) -> &'static str {
        match self {
            TunnelMessage::ListenerCreated(_) => LISTENER_CREATED_WIRE_NAME,
            TunnelMessage::ExternalAddressDiscovered(_) => EXTERNAL_ADDRESS_WIRE_NAME,
        }
    }

    /// Whether `name` identifies a tunnel message
    pub fn is_known(name: &str) -> bool {
        name == LISTENER_CREATED_WIRE_NAME || name == EXTERNAL_ADDRESS_WIRE_NAME
    }

    /// Shared listener fields
    pub fn address(&self) -> &ListenerAddress {
        match self {
            TunnelMessage::ListenerCreated(addr) => addr,
            TunnelMessage::ExternalAddressDiscovered(addr) => addr,
        }
    }

    /// Encode the payload (fields only, without the wire name)
    pub fn encode_payload(&self) -> Result<Bytes, CodecError> {
        let addr = self.address();
        let fields = (&addr.id, &addr.session_id, &addr.ip, addr.port);

        let mut buf = Vec::new();
        ciborium::into_writer(&fields, &mut buf).map_err(|_| CodecError::PayloadEncode)?;
        Ok(Bytes::from(buf))
    }

    /// Decode a payload into the variant selected by `name`
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self, CodecError> {
        if !Self::is_known(name) {
            return Err(CodecError::Wire(crate::WireError::UnknownMessage(
                name.to_string(),
            )));
        }

        let (id, session_id, ip, port): (String, String, String, u16) =
            ciborium::from_reader(payload).map_err(|_| CodecError::PayloadDecode)?;
        let addr = ListenerAddress {
            id,
            session_id,
            ip,
            port,
        };

        Ok(if name == LISTENER_CREATED_WIRE_NAME {
            TunnelMessage::ListenerCreated(addr)
        } else {
            TunnelMessage::ExternalAddressDiscovered(addr)
        })
    }

    /// Build a MESSAGE frame carrying this message
    pub fn to_frame(&self, msg_id: u64) -> Result<Bytes, CodecError> {
        FrameBuilder::new(FastHeader::new(FrameType::Message, msg_id))
            .meta_insert_str("name", self.wire_name())
            .payload(self.encode_payload()?)
            .build(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Decode a MESSAGE frame
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        if frame.fast.typ != FrameType::Message {
            return Err(CodecError::Wire(crate::WireError::Type(frame.fast.typ as u8)));
        }
        let meta = parse_meta(&frame.meta_raw)?;
        let name = get_meta_str(&meta, "name").ok_or(CodecError::MetaDecode)?;
        Self::decode(&name, &frame.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDecoder;
    use bytes::BytesMut;

    #[test]
    fn test_listener_created_decodes_by_wire_name() {
        let msg = TunnelMessage::listener_created("L1", "S1", "10.0.0.1", 5000);
        let payload = msg.encode_payload().unwrap();

        let decoded = TunnelMessage::decode(msg.wire_name(), &payload).unwrap();
        assert_eq!(decoded, msg);
        let addr = decoded.address();
        assert_eq!(addr.id, "L1");
        assert_eq!(addr.session_id, "S1");
        assert_eq!(addr.ip, "10.0.0.1");
        assert_eq!(addr.port, 5000);
    }

    #[test]
    fn test_wire_name_selects_variant() {
        let msg = TunnelMessage::listener_created("L1", "S1", "1.2.3.4", 80);
        let payload = msg.encode_payload().unwrap();

        let external = TunnelMessage::decode(EXTERNAL_ADDRESS_WIRE_NAME, &payload).unwrap();
        assert!(matches!(external, TunnelMessage::ExternalAddressDiscovered(_)));
        assert_eq!(external.address(), msg.address());
        assert!(EXTERNAL_ADDRESS_WIRE_NAME.starts_with(LISTENER_CREATED_WIRE_NAME));
    }

    #[test]
    fn test_unknown_wire_name_rejected() {
        let payload = TunnelMessage::listener_created("a", "b", "c", 1)
            .encode_payload()
            .unwrap();
        assert!(TunnelMessage::decode("Nope", &payload).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = TunnelMessage::external_address_discovered("L9", "S2", "203.0.113.7", 61000);
        let bytes = msg.to_frame(11).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(bytes.as_ref());
        let frame = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.fast.msg_id, 11);
        assert_eq!(TunnelMessage::from_frame(&frame).unwrap(), msg);
    }
}
