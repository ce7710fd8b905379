//! Keepalive frames with RTT measurement.
//!
//! PING carries a monotonic timestamp as correlation id; the peer echoes it in
//! the PONG so the sender can compute the round trip time.

use bytes::Bytes;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};
use tunnel_wire::{CodecError, FastHeader, Flags, FrameBuilder, FrameType};

const MAX_KEEPALIVE_FRAME: usize = 64 * 1024;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Build a PING frame
pub fn build_ping(msg_id: u64, corr_id: u64) -> Result<Bytes, CodecError> {
    FrameBuilder::new(FastHeader::new(FrameType::Ping, msg_id))
        .corr_id(corr_id)
        .build(MAX_KEEPALIVE_FRAME)
}

/// Build the PONG answering a PING with `corr_id`
pub fn build_pong(msg_id: u64, corr_id: u64) -> Result<Bytes, CodecError> {
    FrameBuilder::new(FastHeader::new(FrameType::Pong, msg_id))
        .flags(Flags::RESPONSE)
        .corr_id(corr_id)
        .build(MAX_KEEPALIVE_FRAME)
}

/// Correlation id from monotonic time
pub fn now_corr_id() -> u64 {
    START.elapsed().as_nanos() as u64
}

/// Round trip time for a PONG echoing `corr_id`
pub fn calc_rtt_from_corr(corr_id: u64) -> Option<Duration> {
    let now = START.elapsed().as_nanos() as u64;
    now.checked_sub(corr_id).map(Duration::from_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tunnel_wire::FrameDecoder;

    #[test]
    fn test_ping_pong_frames() {
        let corr_id = 0x9876543210FEDCBA;

        let mut buf = BytesMut::from(build_ping(5, corr_id).unwrap().as_ref());
        let ping = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping.fast.typ, FrameType::Ping);
        assert_eq!(ping.fast.msg_id, 5);
        assert_eq!(ping.fast.corr_id, corr_id);

        let mut buf = BytesMut::from(build_pong(6, corr_id).unwrap().as_ref());
        let pong = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(pong.fast.typ, FrameType::Pong);
        assert!(pong.fast.flags.contains(Flags::RESPONSE));
        assert_eq!(pong.fast.corr_id, corr_id);
    }

    #[test]
    fn test_rtt_from_corr_id() {
        let sent = now_corr_id();
        std::thread::sleep(Duration::from_millis(10));

        let rtt = calc_rtt_from_corr(sent).unwrap();
        assert!(rtt >= Duration::from_millis(10));
        assert!(calc_rtt_from_corr(u64::MAX).is_none());
    }
}
