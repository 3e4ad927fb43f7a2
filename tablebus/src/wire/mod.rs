//! Wire message model and frame format.
//!
//! Every protocol message travels as one frame:
//! `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of the payload for integrity verification
//! - **payload**: JSON-encoded [`Message`]
//!
//! Framing is internal to this crate's connection object; the handshake and
//! dispatch layers only ever see [`Message`] values. A checksum mismatch or a
//! malformed length tears the connection down rather than attempting resync.

use serde::{Deserialize, Serialize};

/// Current protocol revision: full hello/identity exchange.
pub const PROTO_REV_CURRENT: u16 = 0x0300;

/// Legacy protocol revision: no hello exchange on the server side.
pub const PROTO_REV_LEGACY: u16 = 0x0200;

/// Frame header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (1MB).
///
/// Frames larger than this are rejected to prevent memory exhaustion.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// `ServerHello` flag bit marking a resumed session ("not new").
pub const FLAG_RESUMED_SESSION: u8 = 0x01;

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum from the payload.
        actual: u32,
    },

    /// Payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// The payload did not encode or decode as a valid message.
    #[error("codec error: {message}")]
    Codec {
        /// Details about the codec failure.
        message: String,
    },
}

/// A value carried by an entry assignment or update.
///
/// The value model is deliberately flat: what matters to this crate is only
/// the value's [`EntryType`], used to drop updates whose type disagrees with
/// the entry they target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    /// A boolean value.
    Boolean(bool),
    /// A double-precision float value.
    Double(f64),
    /// A string value.
    String(String),
    /// An opaque byte blob.
    Raw(Vec<u8>),
    /// An array of booleans.
    BooleanArray(Vec<bool>),
    /// An array of doubles.
    DoubleArray(Vec<f64>),
    /// An array of strings.
    StringArray(Vec<String>),
}

impl Value {
    /// The type tag of this value.
    pub fn entry_type(&self) -> EntryType {
        match self {
            Value::Boolean(_) => EntryType::Boolean,
            Value::Double(_) => EntryType::Double,
            Value::String(_) => EntryType::String,
            Value::Raw(_) => EntryType::Raw,
            Value::BooleanArray(_) => EntryType::BooleanArray,
            Value::DoubleArray(_) => EntryType::DoubleArray,
            Value::StringArray(_) => EntryType::StringArray,
        }
    }
}

/// Type tag of a key-value entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Boolean entry.
    Boolean,
    /// Double entry.
    Double,
    /// String entry.
    String,
    /// Raw byte blob entry.
    Raw,
    /// Boolean array entry.
    BooleanArray,
    /// Double array entry.
    DoubleArray,
    /// String array entry.
    StringArray,
}

/// A protocol message.
///
/// The handshake exchange uses the hello/done/unsupported kinds; entry
/// assignments and updates are the payload traffic; `KeepAlive` is a client
/// no-op that keeps idle connections from timing out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client no-op. Tolerated anywhere, including mid-handshake.
    KeepAlive,
    /// First message from a client: requested protocol revision and the
    /// client's identity string.
    ClientHello {
        /// Protocol revision the client wants to speak.
        proto_rev: u16,
        /// The client's configured identity string.
        self_id: String,
    },
    /// Server reply when the client requested a revision it cannot speak.
    ProtoUnsup {
        /// The highest revision the server supports.
        proto_rev: u16,
    },
    /// Server reply to a `ClientHello` (revision 0x0300 and later).
    ServerHello {
        /// Bit 0 ([`FLAG_RESUMED_SESSION`]) marks a resumed session.
        flags: u8,
        /// The server's configured identity string.
        self_id: String,
    },
    /// Sentinel ending the server's initial assignment batch.
    ServerHelloDone,
    /// Sentinel ending the client's initial assignment batch (revision
    /// 0x0300 and later).
    ClientHelloDone,
    /// Assignment of a value to a named entry.
    EntryAssign {
        /// Entry name.
        name: String,
        /// Entry id.
        id: u32,
        /// Sequence number for conflict resolution (owned by storage).
        seq_num: u32,
        /// Entry flags (persistence etc., owned by storage).
        flags: u8,
        /// The assigned value.
        value: Value,
    },
    /// Update of an already-assigned entry's value.
    EntryUpdate {
        /// Entry id.
        id: u32,
        /// Sequence number for conflict resolution (owned by storage).
        seq_num: u32,
        /// The new value.
        value: Value,
    },
}

impl Message {
    /// Short kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep_alive",
            Message::ClientHello { .. } => "client_hello",
            Message::ProtoUnsup { .. } => "proto_unsup",
            Message::ServerHello { .. } => "server_hello",
            Message::ServerHelloDone => "server_hello_done",
            Message::ClientHelloDone => "client_hello_done",
            Message::EntryAssign { .. } => "entry_assign",
            Message::EntryUpdate { .. } => "entry_update",
        }
    }
}

/// Encode a message into one wire frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the encoded payload exceeds
/// [`MAX_PAYLOAD_SIZE`], or `Codec` if serialization fails.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(msg).map_err(|e| WireError::Codec {
        message: e.to_string(),
    })?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let total = HEADER_SIZE + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_le_bytes());
    frame.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((message, consumed)))` when a complete frame is present,
/// `Ok(None)` when more data is needed.
///
/// # Errors
///
/// Returns `InvalidLength`, `FrameTooLarge`, `ChecksumMismatch`, or `Codec`
/// on malformed input; the caller is expected to tear the connection down.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    let payload_len = length as usize - HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge { size: payload_len });
    }
    if buf.len() < length as usize {
        return Ok(None);
    }

    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[HEADER_SIZE..length as usize];
    let actual = crc32c::crc32c(payload);
    if expected != actual {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }

    let msg: Message = serde_json::from_slice(payload).map_err(|e| WireError::Codec {
        message: e.to_string(),
    })?;
    Ok(Some((msg, length as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::ClientHello {
            proto_rev: PROTO_REV_CURRENT,
            self_id: "robot".to_string(),
        };

        let frame = encode_frame(&msg).expect("encode should succeed");
        let (decoded, consumed) = try_decode_frame(&frame)
            .expect("decode should succeed")
            .expect("frame should be complete");

        assert_eq!(decoded, msg);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let frame = encode_frame(&Message::KeepAlive).expect("encode should succeed");

        for cut in 0..frame.len() {
            let result = try_decode_frame(&frame[..cut]).expect("partial data is not an error");
            assert!(result.is_none(), "cut at {} should be incomplete", cut);
        }
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let first = Message::ServerHello {
            flags: FLAG_RESUMED_SESSION,
            self_id: "server".to_string(),
        };
        let second = Message::ServerHelloDone;

        let mut buf = encode_frame(&first).expect("encode should succeed");
        buf.extend(encode_frame(&second).expect("encode should succeed"));

        let (msg, consumed) = try_decode_frame(&buf)
            .expect("decode should succeed")
            .expect("first frame complete");
        assert_eq!(msg, first);

        let (msg, rest) = try_decode_frame(&buf[consumed..])
            .expect("decode should succeed")
            .expect("second frame complete");
        assert_eq!(msg, second);
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut frame = encode_frame(&Message::EntryUpdate {
            id: 7,
            seq_num: 3,
            value: Value::Double(1.5),
        })
        .expect("encode should succeed");

        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        match try_decode_frame(&frame) {
            Err(WireError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_undersized_length_field_rejected() {
        let mut frame = encode_frame(&Message::KeepAlive).expect("encode should succeed");
        frame[0..4].copy_from_slice(&3u32.to_le_bytes());

        match try_decode_frame(&frame) {
            Err(WireError::InvalidLength { length: 3 }) => {}
            other => panic!("expected invalid length, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_field_rejected() {
        let mut frame = encode_frame(&Message::KeepAlive).expect("encode should succeed");
        let huge = (HEADER_SIZE + MAX_PAYLOAD_SIZE + 1) as u32;
        frame[0..4].copy_from_slice(&huge.to_le_bytes());

        assert!(matches!(
            try_decode_frame(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_value_entry_types() {
        assert_eq!(Value::Boolean(true).entry_type(), EntryType::Boolean);
        assert_eq!(Value::Raw(vec![1, 2]).entry_type(), EntryType::Raw);
        assert_eq!(
            Value::StringArray(vec!["a".to_string()]).entry_type(),
            EntryType::StringArray
        );
    }
}
