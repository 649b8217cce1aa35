//! TCP and Unix domain stream transport.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::{Connection, StreamTransport};
use crate::config::{Endpoint, TcpOptions};
use crate::error::Result;

#[cfg(unix)]
use super::{remove_stale_socket, SocketFileGuard};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

const LISTEN_BACKLOG: u32 = 1024;

/// Stream transport over TCP, or a Unix domain socket for `Endpoint::Unix`.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    endpoint: Endpoint,
    send_buffer_size: Option<u32>,
    receive_buffer_size: Option<u32>,
}

/// Listening socket of a [`TcpTransport`].
#[derive(Debug)]
pub enum StreamListener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain listener; the socket file is removed on drop.
    #[cfg(unix)]
    Unix(UnixListener, SocketFileGuard),
}

impl TcpTransport {
    /// Create a transport from TCP options.
    pub fn new(options: &TcpOptions) -> Self {
        Self {
            endpoint: options.endpoint.clone(),
            send_buffer_size: options.send_buffer_size,
            receive_buffer_size: options.receive_buffer_size,
        }
    }

    fn socket_for(&self, addr: &SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(socket)
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<Connection> {
        let mut last_error = None;

        for addr in tokio::net::lookup_host((host, port)).await? {
            let attempt = async {
                let stream = self.socket_for(&addr)?.connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok::<_, io::Error>(stream)
            };
            match attempt.await {
                Ok(stream) => return Ok(tcp_connection(stream, addr)),
                Err(e) => {
                    tracing::trace!(%addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{}:{} resolved to no addresses", host, port),
                )
            })
            .into())
    }

    async fn listen_tcp(&self, host: &str, port: u16) -> Result<StreamListener> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{}:{} resolved to no addresses", host, port),
                )
            })?;

        let socket = self.socket_for(&addr)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        tracing::debug!(addr = %listener.local_addr()?, "listening for tcp peers");
        Ok(StreamListener::Tcp(listener))
    }
}

fn tcp_connection(stream: TcpStream, peer: SocketAddr) -> Connection {
    let (reader, writer) = stream.into_split();
    Connection::new(reader, writer, peer.to_string())
}

#[async_trait]
impl StreamTransport for TcpTransport {
    type Listener = StreamListener;

    async fn connect(&self) -> Result<Connection> {
        match &self.endpoint {
            Endpoint::Inet { host, port } => self.connect_tcp(host, *port).await,
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let (reader, writer) = UnixStream::connect(path).await?.into_split();
                Ok(Connection::new(reader, writer, path.display().to_string()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(super::unsupported("unix domain sockets")),
        }
    }

    async fn listen(&self) -> Result<StreamListener> {
        match &self.endpoint {
            Endpoint::Inet { host, port } => self.listen_tcp(host, *port).await,
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                tracing::debug!(path = %path.display(), "listening for unix stream peers");
                Ok(StreamListener::Unix(listener, SocketFileGuard::new(path)))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(super::unsupported("unix domain sockets")),
        }
    }

    async fn accept(&self, listener: &mut StreamListener) -> Result<Connection> {
        match listener {
            StreamListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(tcp_connection(stream, peer))
            }
            #[cfg(unix)]
            StreamListener::Unix(listener, guard) => {
                let (stream, _addr) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(Connection::new(
                    reader,
                    writer,
                    guard.path().display().to_string(),
                ))
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
