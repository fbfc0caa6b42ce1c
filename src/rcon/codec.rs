//! RCON packet framing
//!
//! Every packet on the wire is laid out as:
//!
//! ```text
//! i32 LE length | i32 LE request id | i32 LE type | body | 0x00 | 0x00
//! ```
//!
//! where `length` counts everything after itself.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::rcon::error::RconError;

/// Bytes of id + type + two trailing NULs
const PACKET_OVERHEAD: usize = 10;

/// Largest command body the server accepts from a client
pub const MAX_COMMAND_LEN: usize = 1446;

/// Upper bound on an incoming packet; responses are fragmented at 4096 bytes
const MAX_PACKET_LEN: usize = 64 * 1024;

/// Packet type field values
pub mod packet_type {
    /// Server response to a command
    pub const RESPONSE_VALUE: i32 = 0;
    /// Client command; also the server's login reply
    pub const EXEC_COMMAND: i32 = 2;
    pub const AUTH_RESPONSE: i32 = 2;
    /// Client login request carrying the password
    pub const AUTH: i32 = 3;
}

/// Request id the server answers a failed login with
pub const AUTH_FAILED_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    pub request_id: i32,
    pub kind: i32,
    pub body: String,
}

impl RconPacket {
    pub fn auth(request_id: i32, password: &str) -> Self {
        Self {
            request_id,
            kind: packet_type::AUTH,
            body: password.to_string(),
        }
    }

    pub fn command(request_id: i32, command: &str) -> Self {
        Self {
            request_id,
            kind: packet_type::EXEC_COMMAND,
            body: command.to_string(),
        }
    }
}

/// Length-prefixed RCON codec for use with `tokio_util::codec::Framed`
#[derive(Debug, Default)]
pub struct RconCodec;

impl Decoder for RconCodec {
    type Item = RconPacket;
    type Error = RconError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let length = usize::try_from(length)
            .map_err(|_| RconError::malformed(format!("negative length {length}")))?;

        if length < PACKET_OVERHEAD {
            return Err(RconError::malformed(format!("length {length} below minimum")));
        }
        if length > MAX_PACKET_LEN {
            return Err(RconError::PacketTooLarge {
                size: length,
                max: MAX_PACKET_LEN,
            });
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(length);
        let request_id = frame.get_i32_le();
        let kind = frame.get_i32_le();

        // Body is NUL-terminated and followed by one more NUL pad byte
        let body_bytes = &frame[..frame.len() - 2];
        let body_end = body_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(body_bytes.len());
        let body = String::from_utf8_lossy(&body_bytes[..body_end]).into_owned();

        trace!(
            "RconCodec: decoded packet id={} type={} ({} bytes)",
            request_id,
            kind,
            body.len()
        );

        Ok(Some(RconPacket {
            request_id,
            kind,
            body,
        }))
    }
}

impl Encoder<RconPacket> for RconCodec {
    type Error = RconError;

    fn encode(&mut self, item: RconPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.body.as_bytes();
        if body.len() > MAX_COMMAND_LEN {
            return Err(RconError::CommandTooLong {
                size: body.len(),
                max: MAX_COMMAND_LEN,
            });
        }

        let length = body.len() + PACKET_OVERHEAD;
        dst.reserve(4 + length);
        // Bounded by MAX_COMMAND_LEN above, so the cast cannot truncate
        dst.put_i32_le(length as i32);
        dst.put_i32_le(item.request_id);
        dst.put_i32_le(item.kind);
        dst.put_slice(body);
        dst.put_u8(0);
        dst.put_u8(0);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    fn encoded(packet: RconPacket) -> BytesMut {
        let mut buf = BytesMut::new();
        RconCodec.encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let buf = encoded(RconPacket::command(7, "list"));

        assert_eq!(&buf[0..4], &14i32.to_le_bytes());
        assert_eq!(&buf[4..8], &7i32.to_le_bytes());
        assert_eq!(&buf[8..12], &packet_type::EXEC_COMMAND.to_le_bytes());
        assert_eq!(&buf[12..16], b"list");
        assert_eq!(&buf[16..], &[0, 0]);
    }

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let full = encoded(RconPacket::command(1, "say hello"));
        let mut partial = BytesMut::from(&full[..full.len() - 3]);

        assert_eq!(RconCodec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 3..]);
        let packet = RconCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(packet.body, "say hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_two_packets_in_one_buffer() {
        let mut buf = encoded(RconPacket::command(1, "first"));
        buf.extend_from_slice(&encoded(RconPacket::command(2, "second")));

        let first = RconCodec.decode(&mut buf).unwrap().unwrap();
        let second = RconCodec.decode(&mut buf).unwrap().unwrap();

        assert_eq!((first.request_id, first.body.as_str()), (1, "first"));
        assert_eq!((second.request_id, second.body.as_str()), (2, "second"));
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(4);
        buf.put_i32_le(0);

        assert!(matches!(
            RconCodec.decode(&mut buf),
            Err(RconError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_packet() {
        let mut buf = BytesMut::new();
        buf.put_i32_le((MAX_PACKET_LEN + 1) as i32);

        assert!(matches!(
            RconCodec.decode(&mut buf),
            Err(RconError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_long_command() {
        let mut buf = BytesMut::new();
        let long = "x".repeat(MAX_COMMAND_LEN + 1);

        assert!(matches!(
            RconCodec.encode(RconPacket::command(1, &long), &mut buf),
            Err(RconError::CommandTooLong { .. })
        ));
        assert!(buf.is_empty());
    }
}
