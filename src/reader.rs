//! Inbound reader loops.
//!
//! [`read_stream`] reassembles frames from a byte stream; [`read_datagrams`]
//! treats every datagram as exactly one frame. Both decode each payload
//! and hand it to a [`Dispatch`] target. A message that fails to decode or
//! dispatch is reported and skipped; the loop keeps going.
//!
//! Loops return a [`ReadOutcome`] and leave reconnect policy to the worker.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::config::{ErrorSink, WorkerOptions};
use crate::error::{IpcError, Result};
use crate::protocol::{peek_length, FrameBuffer, WireMessage, LENGTH_PREFIX_SIZE};
use crate::transport::{DatagramPeer, DatagramSocket};

/// Pause after a failed datagram receive.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Target for decoded inbound messages.
///
/// Called inline from the reader loop; implementations must not block.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, message: WireMessage) -> Result<()>;
}

/// Why a reader loop returned.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// The worker's cancellation signal fired.
    Cancelled,
    /// The peer closed the stream (0-byte read).
    PeerClosed,
    /// Transport I/O failed. Not reported; treated like a disconnect.
    Broken(IpcError),
    /// A protocol violation was reported to the error sink.
    Violation,
}

fn dispatch_payload<D: Dispatch + ?Sized>(dispatcher: &D, payload: Bytes, errors: &ErrorSink) {
    let outcome = WireMessage::decode(payload).and_then(|message| dispatcher.dispatch(message));
    if let Err(error) = outcome {
        errors.report("inbound message", &error);
    }
}

/// Read frames from a byte stream until close, failure, or cancellation.
pub(crate) async fn read_stream<R, D>(
    reader: &mut R,
    dispatcher: &D,
    options: &WorkerOptions,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    D: Dispatch + ?Sized,
{
    let errors = &options.unhandled_error_handler;
    let mut frames = FrameBuffer::with_max_frame_size(options.max_frame_size);
    let mut buf = vec![0u8; options.read_buffer_size.max(LENGTH_PREFIX_SIZE)];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => return ReadOutcome::PeerClosed,
            Ok(n) => n,
            Err(e) => return ReadOutcome::Broken(e.into()),
        };

        let payloads = match frames.push(&buf[..n]) {
            Ok(payloads) => payloads,
            Err(error) => {
                // The stream cannot be resynchronized past a bad prefix.
                errors.report("stream reassembly", &error);
                return ReadOutcome::Violation;
            }
        };

        for payload in payloads {
            dispatch_payload(dispatcher, payload, errors);
        }
    }
}

/// Validate that a datagram holds exactly one frame and return its payload.
fn datagram_payload(datagram: &[u8]) -> Result<Bytes> {
    let declared = peek_length(datagram).ok_or_else(|| {
        IpcError::Protocol(format!(
            "datagram of {} bytes is shorter than the length prefix",
            datagram.len()
        ))
    })?;

    let actual = datagram.len() - LENGTH_PREFIX_SIZE;
    if declared as usize != actual {
        return Err(IpcError::DatagramLengthMismatch { declared, actual });
    }
    Ok(Bytes::copy_from_slice(&datagram[LENGTH_PREFIX_SIZE..]))
}

/// Read datagrams until a protocol violation or cancellation.
///
/// With `last_source` set, the source of every valid datagram is recorded
/// so replies can be routed back to it.
pub(crate) async fn read_datagrams<D>(
    socket: &DatagramSocket,
    dispatcher: &D,
    max_datagram_size: usize,
    last_source: Option<&Mutex<Option<DatagramPeer>>>,
    errors: &ErrorSink,
    cancel: &CancellationToken,
) -> ReadOutcome
where
    D: Dispatch + ?Sized,
{
    let mut buf = vec![0u8; max_datagram_size.max(LENGTH_PREFIX_SIZE)];

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ReadOutcome::Cancelled,
            received = socket.recv_from(&mut buf) => received,
        };

        let (n, peer) = match received {
            Ok(received) => received,
            Err(error) => {
                tracing::debug!(%error, "datagram receive failed");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                }
            }
        };

        let payload = match datagram_payload(&buf[..n]) {
            Ok(payload) => payload,
            Err(error) => {
                errors.report("datagram framing", &error);
                return ReadOutcome::Violation;
            }
        };

        if let (Some(slot), Some(peer)) = (last_source, peer) {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        }

        dispatch_payload(dispatcher, payload, errors);
    }
}
