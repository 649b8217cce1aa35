//! Protocol module - wire format, message builders, and stream reassembly.
//!
//! This module implements the binary protocol shared by every transport:
//! - 4-byte little-endian length prefix and the tagged [`WireMessage`]
//! - Typed frame builders for the four message variants
//! - Frame buffer for reassembling frames from partial stream reads

mod frame_buffer;
mod message;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use message::{MessageBuilder, RequestHeader};
pub use wire_format::{
    encode_frame, peek_length, MessageType, WireMessage, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE, MESSAGE_HEADER_SIZE,
};
