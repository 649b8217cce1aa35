//! Wire format encoding and decoding.
//!
//! Every frame on every transport is a length prefix followed by one
//! encoded [`WireMessage`]:
//! ```text
//! ┌──────────┬──────┬──────────┬────────────┬──────────────┐
//! │ Length   │ Type │ Key len  │ Key region │ Value region │
//! │ 4 bytes  │ 1 b  │ 4 bytes  │ key len    │ remainder    │
//! │ uint32 LE│      │ uint32 LE│            │              │
//! └──────────┴──────┴──────────┴────────────┴──────────────┘
//! ```
//!
//! `Length` counts every byte after the prefix. All multi-byte integers are
//! Little Endian; peers built on other platforms depend on this.

use bytes::Bytes;

use crate::error::{IpcError, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed part of a message payload: type byte plus key length.
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Default maximum frame payload size (1 GB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1_073_741_824;

/// Message variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Routed publish: key = routing key, value = message body.
    PubSub = 0,
    /// Remote call: key = request header, value = request body.
    RemoteRequest = 1,
    /// Successful reply: key = correlation id, value = response body.
    RemoteResponse = 2,
    /// Failed reply: key = correlation id, value = diagnostic string.
    RemoteError = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::PubSub),
            1 => Ok(MessageType::RemoteRequest),
            2 => Ok(MessageType::RemoteResponse),
            3 => Ok(MessageType::RemoteError),
            other => Err(IpcError::Protocol(format!("unknown message type {}", other))),
        }
    }
}

/// A decoded message: a tag and two opaque encoded regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Variant tag.
    pub message_type: MessageType,
    /// Key region (routing key, request header, or correlation id).
    pub key: Bytes,
    /// Value region (body or diagnostic).
    pub value: Bytes,
}

impl WireMessage {
    /// Create a message from its parts.
    pub fn new(message_type: MessageType, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Encode this message as a complete frame (length prefix included).
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        encode_frame(self.message_type, &self.key, &self.value)
    }

    /// Decode a message from exactly one frame payload (prefix stripped).
    ///
    /// Regions are zero-copy slices of `payload`.
    pub fn decode(payload: Bytes) -> Result<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return Err(IpcError::Protocol(format!(
                "message of {} bytes is shorter than its {} byte header",
                payload.len(),
                MESSAGE_HEADER_SIZE
            )));
        }

        let message_type = MessageType::try_from(payload[0])?;
        let key_len = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;

        let key_end = MESSAGE_HEADER_SIZE
            .checked_add(key_len)
            .filter(|end| *end <= payload.len())
            .ok_or_else(|| {
                IpcError::Protocol(format!(
                    "key region of {} bytes overruns message of {} bytes",
                    key_len,
                    payload.len()
                ))
            })?;

        Ok(Self {
            message_type,
            key: payload.slice(MESSAGE_HEADER_SIZE..key_end),
            value: payload.slice(key_end..),
        })
    }
}

/// Encode a complete frame from a tag and two already-encoded regions.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload does not fit a 32-bit prefix.
pub fn encode_frame(message_type: MessageType, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    let payload_len = MESSAGE_HEADER_SIZE + key.len() + value.len();
    let length = u32::try_from(payload_len).map_err(|_| IpcError::FrameTooLarge {
        size: payload_len,
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload_len);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(message_type as u8);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(buf)
}

/// Read the length prefix without consuming anything.
///
/// Returns `None` if fewer than 4 bytes are available.
///
/// # Example
///
/// ```
/// use procbus::protocol::peek_length;
///
/// assert_eq!(peek_length(&[5, 0, 0, 0, 0xAA]), Some(5));
/// assert_eq!(peek_length(&[5, 0]), None);
/// ```
#[inline]
pub fn peek_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(frame: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&frame[LENGTH_PREFIX_SIZE..])
    }

    #[test]
    fn test_every_variant_survives_decode() {
        let variants = [
            MessageType::PubSub,
            MessageType::RemoteRequest,
            MessageType::RemoteResponse,
            MessageType::RemoteError,
        ];

        for message_type in variants {
            let frame = encode_frame(message_type, b"key", b"value").unwrap();
            let decoded = WireMessage::decode(payload_of(&frame)).unwrap();

            assert_eq!(decoded.message_type, message_type);
            assert_eq!(&decoded.key[..], b"key");
            assert_eq!(&decoded.value[..], b"value");
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let frame = encode_frame(MessageType::RemoteError, &[0xAA; 2], &[0xBB; 3]).unwrap();

        // Length: 1 + 4 + 2 + 3 = 10
        assert_eq!(&frame[0..4], &[10, 0, 0, 0]);
        // Type
        assert_eq!(frame[4], 3);
        // Key length: 2 in LE
        assert_eq!(&frame[5..9], &[2, 0, 0, 0]);
        assert_eq!(&frame[9..11], &[0xAA, 0xAA]);
        assert_eq!(&frame[11..], &[0xBB, 0xBB, 0xBB]);
    }

    #[test]
    fn test_prefix_counts_bytes_after_itself() {
        let frame = encode_frame(MessageType::PubSub, b"k", b"").unwrap();
        assert_eq!(
            peek_length(&frame).unwrap() as usize + LENGTH_PREFIX_SIZE,
            frame.len()
        );
    }

    #[test]
    fn test_empty_regions() {
        let frame = encode_frame(MessageType::PubSub, b"", b"").unwrap();
        let decoded = WireMessage::decode(payload_of(&frame)).unwrap();
        assert!(decoded.key.is_empty());
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn test_to_frame_matches_encode_frame() {
        let message = WireMessage::new(MessageType::RemoteResponse, &b"id"[..], &b"body"[..]);
        assert_eq!(
            message.to_frame().unwrap(),
            encode_frame(MessageType::RemoteResponse, b"id", b"body").unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let payload = Bytes::from_static(&[9, 0, 0, 0, 0]);
        let err = WireMessage::decode(payload).unwrap_err();
        assert!(err.to_string().contains("unknown message type 9"));
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        let err = WireMessage::decode(Bytes::from_static(&[0, 1])).unwrap_err();
        assert!(matches!(err, IpcError::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_key_overrun() {
        // Declares a 100 byte key but carries 2.
        let payload = Bytes::from_static(&[0, 100, 0, 0, 0, 1, 2]);
        let err = WireMessage::decode(payload).unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn test_peek_length_short_buffer() {
        assert_eq!(peek_length(&[1, 2, 3]), None);
        assert_eq!(peek_length(&[0x01, 0x02, 0x00, 0x00]), Some(0x0201));
    }
}
