//! Frame buffer for reassembling frames from a byte stream.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need at least 4 bytes
//! - `WaitingForPayload`: Prefix parsed, need N more payload bytes
//!
//! A single read may carry part of a frame or several frames; leftover
//! bytes stay buffered for the next push rather than being read again.
//!
//! # Example
//!
//! ```
//! use procbus::protocol::{encode_frame, FrameBuffer, MessageType};
//!
//! let frame = encode_frame(MessageType::PubSub, b"k", b"v").unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&frame[..3]).unwrap().is_empty());
//! let payloads = buffer.push(&frame[3..]).unwrap();
//! assert_eq!(payloads.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{peek_length, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
use crate::error::{IpcError, Result};

/// Initial buffer capacity; grows when a declared length exceeds it.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 4 byte length prefix.
    WaitingForPrefix,
    /// Prefix parsed, waiting for `remaining` payload bytes.
    WaitingForPayload { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frame payloads.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max payload size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForPrefix,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// Payloads are returned in arrival order with the length prefix stripped.
    /// If data is fragmented, partial data is buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` if a prefix declares more than the maximum.
    /// The stream cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }

        Ok(payloads)
    }

    /// Try to extract a single payload from the buffer.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` if the declared length is too large
    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some(length) = peek_length(&self.buffer) else {
                        return Ok(None);
                    };

                    if length > self.max_frame_size {
                        return Err(IpcError::FrameTooLarge {
                            size: length as usize,
                            max: self.max_frame_size as usize,
                        });
                    }

                    let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                    let remaining = length as usize;

                    if remaining > self.buffer.len() {
                        self.buffer.reserve(remaining - self.buffer.len());
                    }

                    self.state = State::WaitingForPayload { remaining };
                }

                State::WaitingForPayload { remaining } => {
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForPrefix;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    ///
    /// Called when a stream is replaced by a new connection.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
