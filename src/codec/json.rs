//! JSON codec using `serde_json`.
//!
//! Larger on the wire than MsgPack but readable in packet captures.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// JSON codec for structured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    #[inline]
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    #[inline]
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
