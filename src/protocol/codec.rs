//! Binary message codec and length-prefix framing.
//!
//! # Wire Format
//! ```text
//! [u32 big-endian length][length bytes of protobuf-encoded Message]
//! ```

use prost::Message as _;

use crate::protocol::message::Message;

/// Size of the length prefix preceding every payload.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Failure to turn payload bytes into a well-formed [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("unknown message type {0}")]
    UnknownType(i32),

    #[error("{kind} message is missing its {field} payload")]
    MissingPayload {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} message carries an unexpected {field} payload")]
    UnexpectedPayload {
        kind: &'static str,
        field: &'static str,
    },
}

/// Failure to produce or accept a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Serialize a message to its protobuf payload.
pub fn encode(message: &Message) -> Vec<u8> {
    message.encode_to_vec()
}

/// Parse and validate a protobuf payload.
///
/// A payload that parses but declares an unknown type, or lacks the payload
/// its type requires, is rejected rather than returned half-populated.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let message = <Message as prost::Message>::decode(bytes)?;
    message.validate()?;
    Ok(message)
}

/// Encode a message and prepend its length header.
pub fn frame(message: &Message, max_len: usize) -> Result<Vec<u8>, FrameError> {
    let payload = encode(message);
    check_len(payload.len(), max_len)?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Payload length announced by a header.
pub fn payload_len(header: [u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}

/// Reject lengths above `max_len` (and anything a u32 header cannot carry).
pub fn check_len(len: usize, max_len: usize) -> Result<(), FrameError> {
    let max = max_len.min(u32::MAX as usize);
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unframe(bytes: &[u8]) -> Message {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let len = payload_len(header);
        assert_eq!(bytes.len(), HEADER_LEN + len);
        decode(&bytes[HEADER_LEN..]).unwrap()
    }

    #[test]
    fn frame_round_trip_boundary_strings() {
        let long = "x".repeat(1 << 20);
        let cases = vec![
            Message::execute_code(0, ""),
            Message::execute_code(i64::MAX, "print('héllo, 世界 🎈')"),
            Message::execute_code(-3, long.clone()),
            Message::output(5, "", "", false),
            Message::output(7, "ünïcødé ✓", "трассировка", true),
            Message::output(8, long, "", true),
        ];

        for m in cases {
            let framed = frame(&m, DEFAULT_MAX_FRAME_LEN).unwrap();
            assert_eq!(unframe(&framed), m);
        }
    }

    #[test]
    fn header_is_big_endian_length() {
        let m = Message::output(1, "ab", "", true);
        let framed = frame(&m, DEFAULT_MAX_FRAME_LEN).unwrap();
        let expected = (encode(&m).len() as u32).to_be_bytes();
        assert_eq!(&framed[..HEADER_LEN], &expected);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
        // An empty payload parses to a message with no type at all.
        assert!(matches!(decode(&[]), Err(DecodeError::UnknownType(0))));
    }

    #[test]
    fn type_is_always_on_the_wire() {
        // Field 1 (type), varint wire type, value 1.
        let bytes = encode(&Message::execute_code(0, ""));
        assert_eq!(&bytes[..2], &[0x08, 0x01]);

        let mut untyped = Message::execute_code(4, "x");
        untyped.r#type = 0;
        assert!(matches!(decode(&encode(&untyped)), Err(DecodeError::UnknownType(0))));
    }

    #[test]
    fn missing_variant_is_a_decode_error() {
        let mut m = Message::output(1, "", "", true);
        m.output = None;
        let bytes = encode(&m);
        assert!(matches!(decode(&bytes), Err(DecodeError::MissingPayload { .. })));
    }

    #[test]
    fn oversize_frame_rejected() {
        let m = Message::execute_code(1, "0123456789");
        assert!(matches!(frame(&m, 4), Err(FrameError::TooLarge { .. })));
    }
}
