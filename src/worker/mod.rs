//! Workers: one endpoint's writer, reader, correlator and dispatch.
//!
//! - [`StreamWorker`] drives connection-oriented transports
//!   ([`TcpWorker`], [`PipeWorker`])
//! - [`UdpWorker`] drives datagram sockets
//!
//! Both share [`WorkerCore`], which owns the outbound queue, the request
//! correlator and the dispatch of inbound messages.

mod stream;
mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::broker::LocalBroker;
use crate::codec::Codec;
use crate::config::WorkerOptions;
use crate::correlator::RequestCorrelator;
use crate::error::{IpcError, Result};
use crate::handler::{Handler, HandlerRegistry};
use crate::lifecycle::{ConnectionState, StateCell};
use crate::protocol::{MessageBuilder, MessageType, RequestHeader, WireMessage};
use crate::reader::{Dispatch, ReadOutcome};
use crate::writer::OutboundQueue;

pub use stream::{PipeWorker, StreamWorker, TcpWorker};
pub use udp::UdpWorker;

/// Diagnostic sent back when a remote handler panics.
const HANDLER_PANICKED: &str = "remote handler panicked";

/// The connection inbound requests currently arrive on.
///
/// Handlers run under `cancel` and tag their replies with `id`, so a reply
/// never outlives its connection or reaches the next peer.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionScope {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
}

/// State shared by a worker and its background loops.
pub(crate) struct WorkerCore<C: Codec> {
    pub(crate) options: WorkerOptions,
    pub(crate) queue: OutboundQueue,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: StateCell,
    correlator: RequestCorrelator,
    handlers: Arc<HandlerRegistry<C>>,
    broker: Arc<dyn LocalBroker>,
    max_frame_len: Option<usize>,
    scope: Mutex<ConnectionScope>,
    disposed: AtomicBool,
    terminal: AtomicBool,
}

impl<C: Codec> WorkerCore<C> {
    pub(crate) fn new(
        options: WorkerOptions,
        handlers: Arc<HandlerRegistry<C>>,
        broker: Arc<dyn LocalBroker>,
        max_frame_len: Option<usize>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let scope = ConnectionScope {
            id: 0,
            cancel: cancel.child_token(),
        };
        Self {
            queue: OutboundQueue::new(options.queue_warning_threshold),
            options,
            scope: Mutex::new(scope),
            cancel,
            state: StateCell::new(),
            correlator: RequestCorrelator::new(),
            handlers,
            broker,
            max_frame_len,
            disposed: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_server(&self) -> bool {
        self.options.host_as_server
    }

    /// Fail fast once disposed, or once a client-role stream has closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(IpcError::Disposed);
        }
        if self.terminal.load(Ordering::Acquire) {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(())
    }

    /// Enqueue a complete frame for the writer.
    pub(crate) fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        let frame = check_frame_len(frame, self.max_frame_len)?;
        self.queue.enqueue(frame)
    }

    /// Open a new connection scope, cancelling the previous one.
    ///
    /// Handlers still running for the previous peer are aborted and any
    /// reply they already queued is dropped by the new writer.
    pub(crate) fn begin_connection(&self) -> ConnectionScope {
        let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        scope.cancel.cancel();
        *scope = ConnectionScope {
            id: scope.id.wrapping_add(1),
            cancel: self.cancel.child_token(),
        };
        scope.clone()
    }

    /// Scope of the connection currently attached.
    pub(crate) fn current_connection(&self) -> ConnectionScope {
        self.scope
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn publish<K, M>(&self, key: &K, message: &M) -> Result<()>
    where
        K: Serialize + ?Sized,
        M: Serialize + ?Sized,
    {
        self.enqueue(MessageBuilder::<C>::pub_sub(key, message)?)
    }

    /// Register, send and await one request. Returns the encoded response body.
    pub(crate) async fn request<Req>(
        &self,
        request_type: &str,
        response_type: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Bytes>
    where
        Req: Serialize + ?Sized,
    {
        let pending = self.correlator.register();
        // Registered after a concurrent dispose drained the map.
        if self.disposed.load(Ordering::SeqCst) {
            return Err(IpcError::Disposed);
        }

        let frame = MessageBuilder::<C>::request(request_type, response_type, pending.id(), request)?;
        self.enqueue(frame)?;
        tracing::trace!(id = pending.id(), request_type, response_type, "request sent");

        pending.wait(cancel).await
    }

    /// Handle the end of a reader loop.
    ///
    /// Pending requests can no longer be answered over the lost connection,
    /// so they fail with `ConnectionClosed`. With `terminal` set (client-role
    /// stream close, datagram framing violation) later calls fail too.
    pub(crate) fn connection_lost(&self, outcome: &ReadOutcome, terminal: bool) {
        match outcome {
            ReadOutcome::Cancelled => return,
            ReadOutcome::PeerClosed => tracing::debug!("peer closed the connection"),
            ReadOutcome::Broken(error) => tracing::debug!(%error, "connection failed"),
            ReadOutcome::Violation => tracing::debug!("reader stopped after protocol violation"),
        }

        self.current_connection().cancel.cancel();
        if terminal {
            self.terminal.store(true, Ordering::Release);
        }
        self.state.set(ConnectionState::Closed);

        let failed = self.correlator.fail_all(|| IpcError::ConnectionClosed);
        if failed > 0 {
            tracing::debug!(failed, "failed pending requests after connection loss");
        }
    }

    pub(crate) fn report(&self, context: &str, error: &IpcError) {
        self.options.unhandled_error_handler.report(context, error);
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    /// Cancel every loop and pending request. Returns false if already disposed.
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let cancelled = self.correlator.fail_all(|| IpcError::Cancelled);
        self.state.set(ConnectionState::Closed);
        tracing::debug!(cancelled, "worker disposed");
        true
    }

    fn invoke_remote(&self, header: RequestHeader, body: Bytes) {
        let id = header.id;
        let scope = self.current_connection();
        let Some(handler) = self
            .handlers
            .resolve(&header.request_type, &header.response_type)
        else {
            let error = IpcError::HandlerNotFound {
                request_type: header.request_type,
                response_type: header.response_type,
            };
            tracing::warn!(id, %error, "no remote handler");
            let reply = MessageBuilder::<C>::error(id, &error.to_string())
                .and_then(|frame| check_frame_len(frame, self.max_frame_len))
                .and_then(|frame| self.queue.enqueue_for(frame, scope.id));
            if let Err(error) = reply {
                tracing::debug!(id, %error, "could not enqueue reply");
                self.report("remote reply", &error);
            }
            return;
        };

        tokio::spawn(run_handler::<C>(
            handler,
            id,
            body,
            self.queue.clone(),
            self.max_frame_len,
            self.options.unhandled_error_handler.clone(),
            scope,
        ));
    }
}

fn check_frame_len(frame: Vec<u8>, max_frame_len: Option<usize>) -> Result<Bytes> {
    match max_frame_len {
        Some(max) if frame.len() > max => Err(IpcError::FrameTooLarge {
            size: frame.len(),
            max,
        }),
        _ => Ok(Bytes::from(frame)),
    }
}

/// Run one remote handler and enqueue its Response or Error frame.
///
/// The handler runs in its own task so a panic becomes an Error frame. It
/// is aborted when its connection ends.
async fn run_handler<C: Codec>(
    handler: Arc<dyn Handler>,
    id: i32,
    body: Bytes,
    queue: OutboundQueue,
    max_frame_len: Option<usize>,
    errors: crate::config::ErrorSink,
    scope: ConnectionScope,
) {
    let mut call = tokio::spawn(async move { handler.call(body).await });

    let joined = tokio::select! {
        biased;
        _ = scope.cancel.cancelled() => {
            tracing::debug!(id, connection = scope.id, "peer gone, remote handler aborted");
            call.abort();
            return;
        }
        joined = &mut call => joined,
    };

    let frame = match joined {
        Ok(Ok(response)) => MessageBuilder::<C>::response_encoded(id, &response),
        Ok(Err(error)) => {
            tracing::debug!(id, %error, "remote handler failed");
            MessageBuilder::<C>::error(id, &error.to_string())
        }
        Err(join_error) => {
            tracing::error!(id, error = %join_error, "remote handler panicked");
            MessageBuilder::<C>::error(id, HANDLER_PANICKED)
        }
    };

    let enqueued = match frame.and_then(|frame| check_frame_len(frame, max_frame_len)) {
        Ok(frame) => queue.enqueue_for(frame, scope.id),
        Err(error) => {
            // Let the caller know instead of leaving it waiting.
            errors.report("remote reply", &error);
            MessageBuilder::<C>::error(id, &error.to_string())
                .and_then(|frame| queue.enqueue_for(Bytes::from(frame), scope.id))
        }
    };

    if let Err(error) = enqueued {
        errors.report("remote reply", &error);
    }
}

impl<C: Codec> Dispatch for WorkerCore<C> {
    fn dispatch(&self, message: WireMessage) -> Result<()> {
        match message.message_type {
            MessageType::PubSub => {
                self.broker.publish(message.key, message.value, &self.cancel);
            }
            MessageType::RemoteRequest => {
                let header = MessageBuilder::<C>::read_request_header(&message.key)?;
                self.invoke_remote(header, message.value);
            }
            MessageType::RemoteResponse => {
                let id = MessageBuilder::<C>::read_id(&message.key)?;
                self.correlator.resolve(id, Ok(message.value));
            }
            MessageType::RemoteError => {
                let id = MessageBuilder::<C>::read_id(&message.key)?;
                let diagnostic = MessageBuilder::<C>::read_error(&message.value)
                    .unwrap_or_else(|e| format!("undecodable remote error: {}", e));
                self.correlator
                    .resolve(id, Err(IpcError::RemoteExecution(diagnostic)));
            }
        }
        Ok(())
    }
}

/// Public worker surface shared by every worker kind.
///
/// Expects `self.core: Arc<WorkerCore<C>>` and
/// `async fn ensure_started(&self) -> Result<()>`.
macro_rules! worker_api {
    () => {
        /// Start the worker now instead of on first use.
        ///
        /// Server role: bind and begin accepting. Client role: connect.
        /// Concurrent callers wait for the same attempt and share its
        /// outcome. A failed attempt is retried by the next call.
        pub async fn start(&self) -> $crate::error::Result<()> {
            self.core.ensure_open()?;
            self.ensure_started().await
        }

        /// Publish a message to the peer's local broker under `key`.
        pub async fn publish<K, M>(&self, key: &K, message: &M) -> $crate::error::Result<()>
        where
            K: serde::Serialize + ?Sized,
            M: serde::Serialize + ?Sized,
        {
            self.core.ensure_open()?;
            self.ensure_started().await?;
            self.core.publish(key, message)
        }

        /// Send a request keyed by the Rust type names of `Req` and `Res`.
        ///
        /// Type names come from [`std::any::type_name`], whose output is not
        /// guaranteed stable across compiler versions. Peers built
        /// separately should agree on ids through
        /// [`request_named`](Self::request_named).
        pub async fn request<Req, Res>(&self, request: &Req) -> $crate::error::Result<Res>
        where
            Req: serde::Serialize + ?Sized,
            Res: serde::de::DeserializeOwned,
        {
            self.request_with_cancel(request, &tokio_util::sync::CancellationToken::new())
                .await
        }

        /// Like [`request`](Self::request), abandoning the wait when `cancel` fires.
        pub async fn request_with_cancel<Req, Res>(
            &self,
            request: &Req,
            cancel: &tokio_util::sync::CancellationToken,
        ) -> $crate::error::Result<Res>
        where
            Req: serde::Serialize + ?Sized,
            Res: serde::de::DeserializeOwned,
        {
            self.request_named(
                $crate::handler::type_key::<Req>(),
                $crate::handler::type_key::<Res>(),
                request,
                cancel,
            )
            .await
        }

        /// Send a request under explicit type ids.
        ///
        /// Resolves to the decoded response, `RemoteExecution` carrying the
        /// peer's diagnostic, or `Cancelled`.
        pub async fn request_named<Req, Res>(
            &self,
            request_type: &str,
            response_type: &str,
            request: &Req,
            cancel: &tokio_util::sync::CancellationToken,
        ) -> $crate::error::Result<Res>
        where
            Req: serde::Serialize + ?Sized,
            Res: serde::de::DeserializeOwned,
        {
            self.core.ensure_open()?;
            self.ensure_started().await?;
            let body = self
                .core
                .request(request_type, response_type, request, cancel)
                .await?;
            C::decode(&body)
        }

        /// Current connection state.
        pub fn connection_state(&self) -> $crate::lifecycle::ConnectionState {
            self.core.state.get()
        }

        /// Frames waiting for the writer.
        pub fn pending_frames(&self) -> usize {
            self.core.queue.pending_frames()
        }

        /// Requests awaiting a response.
        pub fn pending_requests(&self) -> usize {
            self.core.pending_requests()
        }

        /// Whether this worker listens (server role) rather than connects.
        pub fn is_server(&self) -> bool {
            self.core.is_server()
        }

        /// Stop every loop and cancel pending requests.
        ///
        /// Idempotent. Later calls to `publish` and `request` fail with `Disposed`.
        pub fn dispose(&self) {
            self.core.dispose();
        }
    };
}

pub(crate) use worker_api;
