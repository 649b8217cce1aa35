//! Codec module - the serializer hook for keys, bodies and headers.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (default)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker types with associated functions rather than trait
//! objects. Workers and handler registries take the codec as a type
//! parameter, so both peers must agree on it at compile time.
//!
//! # Example
//!
//! ```
//! use procbus::codec::{Codec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serializer used for every encoded region of a wire message.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value to bytes.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Decode bytes to a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}
