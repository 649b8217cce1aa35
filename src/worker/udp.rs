//! Worker over UDP or Unix domain datagram sockets.
//!
//! Every frame travels as exactly one datagram, so the largest frame a
//! worker sends is bounded by `max_datagram_size`. A datagram whose length
//! prefix disagrees with its size is reported once and ends the reader;
//! the worker is then closed and later calls fail with `ConnectionClosed`.
//!
//! A server-role worker replies to the source of the most recent valid
//! datagram. Until one arrives, outbound frames are dropped with a warning.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::broker::LocalBroker;
use crate::codec::{Codec, MsgPackCodec};
use crate::config::{Endpoint, UdpOptions};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::lifecycle::{ConnectionState, StartGate};
use crate::reader::read_datagrams;
use crate::transport::{DatagramPeer, DatagramSocket};
use crate::writer::{DatagramRoute, DatagramSink};

use super::{worker_api, WorkerCore};

/// Datagram worker.
pub struct UdpWorker<C: Codec = MsgPackCodec> {
    core: Arc<WorkerCore<C>>,
    endpoint: Endpoint,
    max_datagram_size: usize,
    last_source: Arc<Mutex<Option<DatagramPeer>>>,
    gate: StartGate,
}

impl<C: Codec> UdpWorker<C> {
    /// Create a datagram worker. The socket is bound on first use.
    pub fn new(
        options: UdpOptions,
        handlers: Arc<HandlerRegistry<C>>,
        broker: Arc<dyn LocalBroker>,
    ) -> Self {
        let UdpOptions {
            endpoint,
            max_datagram_size,
            worker,
        } = options;

        Self {
            core: Arc::new(WorkerCore::new(
                worker,
                handlers,
                broker,
                Some(max_datagram_size),
            )),
            endpoint,
            max_datagram_size,
            last_source: Arc::new(Mutex::new(None)),
            gate: StartGate::new(),
        }
    }

    worker_api!();

    /// Source of the last valid datagram (server role).
    pub fn last_peer(&self) -> Option<DatagramPeer> {
        self.last_source
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn ensure_started(&self) -> Result<()> {
        if self.gate.is_started() {
            return Ok(());
        }
        self.gate.run(|| self.bootstrap()).await
    }

    async fn bootstrap(&self) -> Result<()> {
        self.core.state.set(ConnectionState::Connecting);
        let socket = if self.core.is_server() {
            DatagramSocket::bind(&self.endpoint).await
        } else {
            DatagramSocket::connect(&self.endpoint).await
        };

        let socket = match socket {
            Ok(socket) => Arc::new(socket),
            Err(error) => {
                tracing::debug!(endpoint = %self.endpoint, %error, "datagram worker failed to start");
                self.core.state.set(ConnectionState::Unconnected);
                return Err(error);
            }
        };
        tracing::debug!(
            local = %socket.local_description(),
            endpoint = %self.endpoint,
            server = self.core.is_server(),
            "datagram worker started"
        );

        let route = if self.core.is_server() {
            DatagramRoute::LastSource(self.last_source.clone())
        } else {
            DatagramRoute::Connected
        };
        let scope = self.core.current_connection();
        let writer_task = self.core.queue.spawn_writer(
            DatagramSink::new(socket.clone(), route),
            scope.id,
            scope.cancel.clone(),
        );

        let core = self.core.clone();
        let last_source = self.core.is_server().then(|| self.last_source.clone());
        let max_datagram_size = self.max_datagram_size;
        tokio::spawn(async move {
            let outcome = read_datagrams(
                &socket,
                &*core,
                max_datagram_size,
                last_source.as_deref(),
                &core.options.unhandled_error_handler,
                &core.cancel,
            )
            .await;

            scope.cancel.cancel();
            let _ = writer_task.await;
            // Nothing reads replies any more; later calls fail fast.
            core.connection_lost(&outcome, true);
        });

        self.core.state.set(ConnectionState::Connected);
        Ok(())
    }
}

impl<C: Codec> Drop for UdpWorker<C> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}

impl<C: Codec> fmt::Debug for UdpWorker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpWorker")
            .field("endpoint", &self.endpoint)
            .field("server", &self.core.is_server())
            .field("state", &self.core.state.get())
            .field("max_datagram_size", &self.max_datagram_size)
            .finish()
    }
}
