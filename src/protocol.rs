//! Wire protocol for the gateway.
//!
//! Every message, in both directions, is one length-prefixed binary frame:
//!
//! ```text
//! [2 bytes: message-type id, big endian]
//! [2 bytes: body length N,  big endian]
//! [N bytes: opaque payload]
//! ```
//!
//! There is no magic number, checksum, or version field; framing relies
//! entirely on length correctness. A stream that desynchronizes (or declares
//! a body longer than the configured limit) cannot be recovered and is
//! closed by the connection layer.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default inbound body-length limit (bytes). The wire format caps bodies at
/// `u16::MAX`; the default limit is tighter because the length field is
/// peer-controlled and sizes the body allocation.
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message-type id, used to look up the registered handler.
    pub msg_id: u16,
    /// Declared length of the body that follows the header.
    pub body_len: u16,
}

impl MessageHeader {
    /// Decode a header from exactly `HEADER_LEN` bytes.
    ///
    /// Any four bytes form a structurally valid header; length sanity is
    /// enforced by the connection against its configured limit.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            msg_id: u16::from_be_bytes([buf[0], buf[1]]),
            body_len: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }

    /// Encode this header into its wire representation.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.msg_id.to_be_bytes();
        let len = self.body_len.to_be_bytes();
        [id[0], id[1], len[0], len[1]]
    }
}

/// Frame encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload does not fit the 2-byte length field.
    BodyTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BodyTooLarge { len, max } => {
                write!(f, "body length {len} exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode one complete frame (header followed by payload) into a single
/// contiguous buffer.
///
/// Keeping the frame contiguous is what lets the write path guarantee that a
/// message's bytes are never interleaved with another message on the wire.
pub fn encode_frame(msg_id: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::BodyTooLarge {
            len: payload.len(),
            max: u16::MAX as usize,
        });
    }

    let header = MessageHeader {
        msg_id,
        body_len: payload.len() as u16,
    };

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(&header.encode());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            msg_id: 1001,
            body_len: 513,
        };
        let decoded = MessageHeader::decode(&header.encode());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_wire_bytes_are_big_endian() {
        let header = MessageHeader {
            msg_id: 1,
            body_len: 11,
        };
        assert_eq!(header.encode(), [0x00, 0x01, 0x00, 0x0b]);

        let decoded = MessageHeader::decode(&[0x12, 0x34, 0xab, 0xcd]);
        assert_eq!(decoded.msg_id, 0x1234);
        assert_eq!(decoded.body_len, 0xabcd);
    }

    #[test]
    fn test_encode_frame_is_contiguous() {
        let frame = encode_frame(1, b"hello world").unwrap();
        assert_eq!(&frame[..], b"\x00\x01\x00\x0bhello world");
    }

    #[test]
    fn test_encode_empty_frame() {
        let frame = encode_frame(7, b"").unwrap();
        assert_eq!(&frame[..], [0x00, 0x07, 0x00, 0x00]);
        assert_eq!(frame.len(), HEADER_LEN);
    }

    #[test]
    fn test_encode_frame_rejects_oversize_payload() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        match encode_frame(1, &payload) {
            Err(FrameError::BodyTooLarge { len, max }) => {
                assert_eq!(len, u16::MAX as usize + 1);
                assert_eq!(max, u16::MAX as usize);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_encode_frame_at_limit() {
        let payload = vec![0x5a; u16::MAX as usize];
        let frame = encode_frame(1, &payload).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + u16::MAX as usize);
    }
}
