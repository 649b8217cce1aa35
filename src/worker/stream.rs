//! Worker over a connection-oriented transport (TCP, Unix stream, named pipe).
//!
//! # Roles
//!
//! - Client (`host_as_server = false`): the first `start`, `publish` or
//!   `request` connects; concurrent callers wait for that connect and
//!   share its success. When the peer closes, the worker is closed for good.
//! - Server (`host_as_server = true`): listens and serves one peer at a
//!   time. When a peer disconnects the worker accepts the next one; frames
//!   enqueued meanwhile are delivered to it. Replies to the departed peer's
//!   requests are dropped, and handlers still serving it are aborted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use procbus::broker::InMemoryBroker;
//! use procbus::codec::MsgPackCodec;
//! use procbus::config::{Endpoint, TcpOptions};
//! use procbus::handler::{HandlerError, HandlerRegistry};
//! use procbus::worker::TcpWorker;
//!
//! # async fn demo() -> procbus::Result<()> {
//! let mut handlers = HandlerRegistry::<MsgPackCodec>::new();
//! handlers.register(|n: i32| async move { Ok::<_, HandlerError>(n * 2) });
//!
//! let server = TcpWorker::new(
//!     TcpOptions::new(Endpoint::inet("127.0.0.1", 5050)).host_as_server(true),
//!     Arc::new(handlers),
//!     Arc::new(InMemoryBroker::new()),
//! );
//! server.start().await?;
//!
//! let client = TcpWorker::new(
//!     TcpOptions::new(Endpoint::inet("127.0.0.1", 5050)),
//!     Arc::new(HandlerRegistry::<MsgPackCodec>::new()),
//!     Arc::new(InMemoryBroker::new()),
//! );
//! let doubled: i32 = client.request::<i32, i32>(&42).await?;
//! assert_eq!(doubled, 84);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::LocalBroker;
use crate::codec::{Codec, MsgPackCodec};
use crate::config::{PipeOptions, TcpOptions, WorkerOptions};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::lifecycle::{ConnectionState, StartGate};
use crate::reader::{read_stream, ReadOutcome};
use crate::transport::{Connection, PipeTransport, StreamTransport, TcpTransport};
use crate::writer::StreamSink;

use super::{worker_api, WorkerCore};

/// Pause before retrying a failed accept.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Worker over TCP or a Unix domain stream socket.
pub type TcpWorker<C = MsgPackCodec> = StreamWorker<TcpTransport, C>;

/// Worker over a named pipe.
pub type PipeWorker<C = MsgPackCodec> = StreamWorker<PipeTransport, C>;

/// Worker over any [`StreamTransport`].
pub struct StreamWorker<T: StreamTransport, C: Codec = MsgPackCodec> {
    core: Arc<WorkerCore<C>>,
    transport: Arc<T>,
    gate: StartGate,
}

impl<C: Codec> StreamWorker<TcpTransport, C> {
    /// Create a TCP worker. Nothing is connected or bound until first use.
    pub fn new(
        options: TcpOptions,
        handlers: Arc<HandlerRegistry<C>>,
        broker: Arc<dyn LocalBroker>,
    ) -> Self {
        let transport = TcpTransport::new(&options);
        Self::with_transport(transport, options.worker, handlers, broker)
    }
}

impl<C: Codec> StreamWorker<PipeTransport, C> {
    /// Create a named pipe worker. Nothing is connected or bound until first use.
    ///
    /// Fails if the pipe name cannot be used on this platform.
    pub fn new(
        options: PipeOptions,
        handlers: Arc<HandlerRegistry<C>>,
        broker: Arc<dyn LocalBroker>,
    ) -> Result<Self> {
        let transport = PipeTransport::new(&options)?;
        Ok(Self::with_transport(
            transport,
            options.worker,
            handlers,
            broker,
        ))
    }
}

impl<T: StreamTransport, C: Codec> StreamWorker<T, C> {
    /// Create a worker over a custom transport.
    pub fn with_transport(
        transport: T,
        options: WorkerOptions,
        handlers: Arc<HandlerRegistry<C>>,
        broker: Arc<dyn LocalBroker>,
    ) -> Self {
        Self {
            core: Arc::new(WorkerCore::new(options, handlers, broker, None)),
            transport: Arc::new(transport),
            gate: StartGate::new(),
        }
    }

    worker_api!();

    /// Run the one-time bootstrap if nobody has yet.
    ///
    /// Every caller waits for the connect (client) or bind (server). A
    /// failure leaves the gate open, so each waiting caller and any later
    /// call retries and gets its own error.
    async fn ensure_started(&self) -> Result<()> {
        if self.gate.is_started() {
            return Ok(());
        }
        self.gate.run(|| self.bootstrap()).await
    }

    async fn bootstrap(&self) -> Result<()> {
        self.core.state.set(ConnectionState::Connecting);
        let started = if self.core.is_server() {
            self.start_server().await
        } else {
            self.start_client().await
        };

        if let Err(error) = &started {
            tracing::debug!(endpoint = %self.transport.describe(), %error, "worker failed to start");
            self.core.state.set(ConnectionState::Unconnected);
        }
        started
    }

    async fn start_client(&self) -> Result<()> {
        let connection = self.transport.connect().await?;
        tracing::debug!(peer = %connection.peer, "connected");
        self.core.state.set(ConnectionState::Connected);

        tokio::spawn(run_client(self.core.clone(), connection));
        Ok(())
    }

    async fn start_server(&self) -> Result<()> {
        let listener = self.transport.listen().await?;
        tracing::debug!(endpoint = %self.transport.describe(), "accepting peers");

        tokio::spawn(serve(
            self.core.clone(),
            self.transport.clone(),
            listener,
        ));
        Ok(())
    }
}

/// Client role: one connection, closed for good when the reader ends.
async fn run_client<C: Codec>(core: Arc<WorkerCore<C>>, connection: Connection) {
    let Connection {
        mut reader, writer, ..
    } = connection;

    let scope = core.current_connection();
    let writer_task = core
        .queue
        .spawn_writer(StreamSink::new(writer), scope.id, scope.cancel.clone());

    let outcome = read_stream(&mut reader, &*core, &core.options, &core.cancel).await;

    scope.cancel.cancel();
    let _ = writer_task.await;
    core.connection_lost(&outcome, true);
}

/// Server role: accept, serve until the peer leaves, accept again.
async fn serve<T: StreamTransport, C: Codec>(
    core: Arc<WorkerCore<C>>,
    transport: Arc<T>,
    mut listener: T::Listener,
) {
    loop {
        core.state.set(ConnectionState::Connecting);

        let accepted = tokio::select! {
            biased;
            _ = core.cancel.cancelled() => break,
            accepted = transport.accept(&mut listener) => accepted,
        };

        let Connection {
            mut reader,
            writer,
            peer,
        } = match accepted {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(%error, "accept failed, retrying");
                tokio::select! {
                    biased;
                    _ = core.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                }
            }
        };

        let scope = core.begin_connection();
        tracing::debug!(%peer, connection = scope.id, "peer connected");
        core.state.set(ConnectionState::Connected);

        let writer_task = core
            .queue
            .spawn_writer(StreamSink::new(writer), scope.id, scope.cancel.clone());

        let outcome = read_stream(&mut reader, &*core, &core.options, &core.cancel).await;

        // Ends the writer and any handler still serving this peer.
        scope.cancel.cancel();
        let _ = writer_task.await;

        if matches!(outcome, ReadOutcome::Cancelled) {
            break;
        }
        core.connection_lost(&outcome, false);
        tracing::debug!(%peer, "awaiting reconnect");
    }

    tracing::debug!(endpoint = %transport.describe(), "stopped accepting peers");
}

impl<T: StreamTransport, C: Codec> Drop for StreamWorker<T, C> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl<T: StreamTransport, C: Codec> fmt::Debug for StreamWorker<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWorker")
            .field("endpoint", &self.transport.describe())
            .field("server", &self.core.is_server())
            .field("state", &self.core.state.get())
            .field("pending_frames", &self.core.queue.pending_frames())
            .finish()
    }
}
