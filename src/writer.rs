//! Outbound writer: an unbounded frame queue drained by a dedicated task.
//!
//! Producers (publishers, requesters, remote handlers replying) enqueue
//! complete frames without blocking. A single writer task drains the queue
//! and writes frames in FIFO order, batching whatever is ready into one
//! vectored write.
//!
//! # Architecture
//!
//! ```text
//! publish ───┐
//! request ───┼─► OutboundQueue (unbounded mpsc) ─► writer task ─► FrameSink
//! replies ───┘
//! ```
//!
//! The receiver lives behind an async mutex so that at most one writer
//! task drains it at a time. Server-role workers spawn a fresh writer per
//! accepted connection; frames enqueued while no peer is attached wait in
//! the queue for the next one. Replies are the exception: they are tagged
//! with the connection that carried the request, and a writer for any
//! other connection drops them.
//!
//! A write failure stops the writer quietly. It never reports to the
//! error sink; the reader notices the broken connection.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};
use crate::transport::{DatagramPeer, DatagramSocket};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Destination the writer task drains frames into.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write every frame of the batch, in order.
    async fn write_frames(&mut self, batch: &[Bytes]) -> Result<()>;
}

/// A frame waiting for the writer.
#[derive(Debug, Clone)]
pub(crate) struct QueuedFrame {
    pub(crate) bytes: Bytes,
    /// Connection the frame is bound to; `None` goes to whichever peer is next.
    pub(crate) connection: Option<u64>,
}

/// Unbounded FIFO of encoded frames awaiting the writer.
///
/// Cheaply cloneable; every clone feeds the same queue.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<QueuedFrame>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueuedFrame>>>,
    pending: Arc<AtomicUsize>,
    warned: Arc<AtomicBool>,
    warning_threshold: usize,
}

impl OutboundQueue {
    /// Create an empty queue that warns once its depth passes `warning_threshold`.
    pub fn new(warning_threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            warned: Arc::new(AtomicBool::new(false)),
            warning_threshold,
        }
    }

    /// Enqueue a complete frame for whichever peer is connected. Never blocks.
    pub fn enqueue(&self, frame: Bytes) -> Result<()> {
        self.push(QueuedFrame {
            bytes: frame,
            connection: None,
        })
    }

    /// Enqueue a frame only the writer for `connection` may send.
    ///
    /// Used for replies: a response must never reach a later peer whose
    /// request ids happen to collide.
    pub fn enqueue_for(&self, frame: Bytes, connection: u64) -> Result<()> {
        self.push(QueuedFrame {
            bytes: frame,
            connection: Some(connection),
        })
    }

    fn push(&self, frame: QueuedFrame) -> Result<()> {
        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;

        if self.tx.send(frame).is_err() {
            self.pending.fetch_sub(1, Ordering::Release);
            return Err(IpcError::ConnectionClosed);
        }

        if depth > self.warning_threshold && !self.warned.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                depth,
                threshold = self.warning_threshold,
                "outbound queue is growing faster than the writer drains it"
            );
        }
        Ok(())
    }

    /// Frames enqueued but not yet taken by a writer.
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Spawn a writer task for `connection`, draining this queue into `sink`
    /// until `cancel` fires or a write fails.
    pub fn spawn_writer<S: FrameSink>(
        &self,
        sink: S,
        connection: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(writer_loop(self.clone(), sink, connection, cancel))
    }

    #[cfg(test)]
    pub(crate) async fn receiver_for_tests(
        &self,
    ) -> tokio::sync::OwnedMutexGuard<mpsc::UnboundedReceiver<QueuedFrame>> {
        self.rx.clone().lock_owned().await
    }

    fn mark_drained(&self, count: usize) {
        let remaining = self
            .pending
            .fetch_sub(count, Ordering::AcqRel)
            .saturating_sub(count);
        if remaining <= self.warning_threshold / 2 {
            self.warned.store(false, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("pending", &self.pending_frames())
            .field("warning_threshold", &self.warning_threshold)
            .finish()
    }
}

/// Main writer loop - receives frames and writes them to the sink.
async fn writer_loop<S: FrameSink>(
    queue: OutboundQueue,
    mut sink: S,
    connection: u64,
    cancel: CancellationToken,
) {
    let mut rx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        guard = queue.rx.clone().lock_owned() => guard,
    };
    tracing::trace!(connection, "writer started");

    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        // Wait for first frame
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Collect additional ready frames (non-blocking)
        let mut taken = 1;
        admit(&mut batch, first, connection);
        while taken < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    taken += 1;
                    admit(&mut batch, frame, connection);
                }
                Err(_) => break,
            }
        }
        queue.mark_drained(taken);
        if batch.is_empty() {
            continue;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = sink.write_frames(&batch) => outcome,
        };
        batch.clear();

        if let Err(error) = outcome {
            tracing::debug!(%error, "writer stopped after write failure");
            return;
        }
    }
    tracing::trace!(connection, "writer stopped");
}

/// Add a frame to the batch unless it belongs to another connection.
fn admit(batch: &mut Vec<Bytes>, frame: QueuedFrame, connection: u64) {
    match frame.connection {
        Some(owner) if owner != connection => {
            tracing::trace!(owner, connection, "dropping reply for a previous connection");
        }
        _ => batch.push(frame.bytes),
    }
}

/// Sink writing frames to a byte stream with vectored writes.
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a stream write half.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frames(&mut self, batch: &[Bytes]) -> Result<()> {
        write_batch(&mut self.writer, batch).await
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Uses write_vectored even for a single frame so the common case is one
/// syscall plus a flush.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )
            .into());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data remaining after `skip_bytes`.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut frame_start = 0;

    for frame in batch {
        let frame_end = frame_start + frame.len();
        if skip_bytes < frame_end && !frame.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(frame_start);
            slices.push(IoSlice::new(&frame[start_in_frame..]));
        }
        frame_start = frame_end;
    }

    slices
}

/// Where a datagram sink sends frames.
#[derive(Debug, Clone)]
pub enum DatagramRoute {
    /// The socket is connected; use plain sends.
    Connected,
    /// Reply to the most recent datagram source, once one is known.
    LastSource(Arc<Mutex<Option<DatagramPeer>>>),
}

/// Sink writing one datagram per frame.
#[derive(Debug)]
pub struct DatagramSink {
    socket: Arc<DatagramSocket>,
    route: DatagramRoute,
}

impl DatagramSink {
    /// Create a sink over a shared socket.
    pub fn new(socket: Arc<DatagramSocket>, route: DatagramRoute) -> Self {
        Self { socket, route }
    }
}

#[async_trait]
impl FrameSink for DatagramSink {
    async fn write_frames(&mut self, batch: &[Bytes]) -> Result<()> {
        for frame in batch {
            let sent = match &self.route {
                DatagramRoute::Connected => self.socket.send(frame).await,
                DatagramRoute::LastSource(peer) => {
                    let target = peer.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    match target {
                        Some(target) => self.socket.send_to(frame, &target).await,
                        None => {
                            tracing::warn!(len = frame.len(), "no datagram peer yet, dropping frame");
                            continue;
                        }
                    }
                }
            };

            match sent {
                Ok(()) => {}
                // An ICMP unreachable surfaces on the next send; the datagram is lost.
                Err(IpcError::ConnectionFailed(e))
                    if e.kind() == std::io::ErrorKind::ConnectionRefused =>
                {
                    tracing::debug!(error = %e, "datagram peer unreachable, frame dropped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
