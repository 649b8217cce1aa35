//! Typed message builders and region readers.
//!
//! [`MessageBuilder`] turns typed keys, bodies and headers into complete
//! frames using a [`Codec`], and reads the typed key regions back out.
//!
//! # Example
//!
//! ```
//! use procbus::codec::MsgPackCodec;
//! use procbus::protocol::{FrameBuffer, MessageBuilder, MessageType, WireMessage};
//!
//! let frame = MessageBuilder::<MsgPackCodec>::pub_sub(&7i32, &"ping").unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! let payload = buffer.push(&frame).unwrap().remove(0);
//! let message = WireMessage::decode(payload).unwrap();
//!
//! assert_eq!(message.message_type, MessageType::PubSub);
//! ```

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::wire_format::{encode_frame, MessageType};
use crate::codec::Codec;
use crate::error::Result;

/// Header carried in the key region of a RemoteRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Correlation id, unique among this worker's pending requests.
    pub id: i32,
    /// Type id of the request body; selects the remote handler.
    pub request_type: String,
    /// Type id of the expected response body.
    pub response_type: String,
}

/// Builds frames for each message variant with codec `C`.
pub struct MessageBuilder<C: Codec> {
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> MessageBuilder<C> {
    /// Build a PubSub frame.
    pub fn pub_sub<K, M>(key: &K, message: &M) -> Result<Vec<u8>>
    where
        K: Serialize + ?Sized,
        M: Serialize + ?Sized,
    {
        let key = C::encode(key)?;
        let value = C::encode(message)?;
        encode_frame(MessageType::PubSub, &key, &value)
    }

    /// Build a RemoteRequest frame.
    pub fn request<Req>(
        request_type: &str,
        response_type: &str,
        id: i32,
        request: &Req,
    ) -> Result<Vec<u8>>
    where
        Req: Serialize + ?Sized,
    {
        let header = RequestHeader {
            id,
            request_type: request_type.to_string(),
            response_type: response_type.to_string(),
        };
        let key = C::encode(&header)?;
        let value = C::encode(request)?;
        encode_frame(MessageType::RemoteRequest, &key, &value)
    }

    /// Build a RemoteResponse frame from a typed response.
    pub fn response<Res>(id: i32, response: &Res) -> Result<Vec<u8>>
    where
        Res: Serialize + ?Sized,
    {
        let body = C::encode(response)?;
        Self::response_encoded(id, &body)
    }

    /// Build a RemoteResponse frame from an already encoded body.
    pub fn response_encoded(id: i32, body: &[u8]) -> Result<Vec<u8>> {
        let key = C::encode(&id)?;
        encode_frame(MessageType::RemoteResponse, &key, body)
    }

    /// Build a RemoteError frame carrying a diagnostic string.
    pub fn error(id: i32, message: &str) -> Result<Vec<u8>> {
        let key = C::encode(&id)?;
        let value = C::encode(message)?;
        encode_frame(MessageType::RemoteError, &key, &value)
    }

    /// Read the correlation id from a RemoteResponse/RemoteError key region.
    pub fn read_id(key: &[u8]) -> Result<i32> {
        C::decode(key)
    }

    /// Read the header from a RemoteRequest key region.
    pub fn read_request_header(key: &[u8]) -> Result<RequestHeader> {
        C::decode(key)
    }

    /// Read the diagnostic string from a RemoteError value region.
    pub fn read_error(value: &[u8]) -> Result<String> {
        C::decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, MsgPackCodec};
    use crate::protocol::{FrameBuffer, WireMessage};

    type Builder = MessageBuilder<MsgPackCodec>;

    fn decode_single(frame: &[u8]) -> WireMessage {
        let mut buffer = FrameBuffer::new();
        let mut payloads = buffer.push(frame).unwrap();
        assert_eq!(payloads.len(), 1);
        WireMessage::decode(payloads.remove(0)).unwrap()
    }

    #[test]
    fn test_pub_sub_regions() {
        let message = decode_single(&Builder::pub_sub(&7i32, "ping").unwrap());

        assert_eq!(message.message_type, MessageType::PubSub);
        assert_eq!(MsgPackCodec::decode::<i32>(&message.key).unwrap(), 7);
        assert_eq!(
            MsgPackCodec::decode::<String>(&message.value).unwrap(),
            "ping"
        );
    }

    #[test]
    fn test_request_header_fields() {
        let frame = Builder::request("i32", "i64", 42, &21i32).unwrap();
        let message = decode_single(&frame);

        assert_eq!(message.message_type, MessageType::RemoteRequest);
        let header = Builder::read_request_header(&message.key).unwrap();
        assert_eq!(
            header,
            RequestHeader {
                id: 42,
                request_type: "i32".to_string(),
                response_type: "i64".to_string(),
            }
        );
        assert_eq!(MsgPackCodec::decode::<i32>(&message.value).unwrap(), 21);
    }

    #[test]
    fn test_response_and_error_carry_id() {
        let response = decode_single(&Builder::response(-5, &84i32).unwrap());
        assert_eq!(response.message_type, MessageType::RemoteResponse);
        assert_eq!(Builder::read_id(&response.key).unwrap(), -5);
        assert_eq!(MsgPackCodec::decode::<i32>(&response.value).unwrap(), 84);

        let error = decode_single(&Builder::error(9, "bad input").unwrap());
        assert_eq!(error.message_type, MessageType::RemoteError);
        assert_eq!(Builder::read_id(&error.key).unwrap(), 9);
        assert_eq!(Builder::read_error(&error.value).unwrap(), "bad input");
    }

    #[test]
    fn test_response_encoded_matches_typed() {
        let body = MsgPackCodec::encode(&"done").unwrap();
        assert_eq!(
            Builder::response_encoded(3, &body).unwrap(),
            Builder::response(3, "done").unwrap()
        );
    }

    #[test]
    fn test_json_codec_regions() {
        let frame = MessageBuilder::<JsonCodec>::pub_sub("topic", &[1, 2, 3]).unwrap();
        let message = decode_single(&frame);

        assert_eq!(&message.key[..], br#""topic""#);
        assert_eq!(&message.value[..], b"[1,2,3]");
    }
}
