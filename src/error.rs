//! Error types for procbus.

use thiserror::Error;

/// Main error type for all procbus operations.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Any I/O failure on a pipe or socket.
    ///
    /// Transports do not distinguish further; retry policy lives in the workers.
    #[error("connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed frame or message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A datagram whose length prefix does not match its actual size.
    #[error("datagram length mismatch: prefix declares {declared} bytes, datagram carries {actual}")]
    DatagramLengthMismatch {
        /// Payload length declared by the prefix.
        declared: u32,
        /// Payload bytes actually present after the prefix.
        actual: usize,
    },

    /// A frame exceeds the configured maximum size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No remote handler registered for the type-id pair.
    #[error("no handler registered for {request_type} -> {response_type}")]
    HandlerNotFound {
        /// Request type id.
        request_type: String,
        /// Response type id.
        response_type: String,
    },

    /// The remote handler failed; carries the peer's diagnostic string.
    #[error("remote execution failed: {0}")]
    RemoteExecution(String),

    /// The connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker has been disposed.
    #[error("worker disposed")]
    Disposed,
}

impl IpcError {
    /// Whether this error is a cancellation outcome rather than a failure.
    ///
    /// Loops never report cancellations to the unhandled error handler.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, IpcError::Cancelled | IpcError::Disposed)
    }
}

/// Result type alias using IpcError.
pub type Result<T> = std::result::Result<T, IpcError>;
