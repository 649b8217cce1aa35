//! UDP and Unix domain datagram sockets.
//!
//! A server-role socket binds the configured endpoint and learns its peer
//! from incoming datagrams. A client-role socket binds an ephemeral
//! address (a generated socket file for Unix domain) and connects to the
//! endpoint, so replies come back to it.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::config::Endpoint;
use crate::error::Result;

#[cfg(unix)]
use super::{generate_socket_path, remove_stale_socket, SocketFileGuard};
#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixDatagram;

/// Source address of a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramPeer {
    /// UDP source.
    Inet(SocketAddr),
    /// Unix domain source bound to a path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for DatagramPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatagramPeer::Inet(addr) => write!(f, "{}", addr),
            #[cfg(unix)]
            DatagramPeer::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

enum Socket {
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixDatagram),
}

/// Datagram socket for either address family.
pub struct DatagramSocket {
    socket: Socket,
    #[cfg(unix)]
    _guard: Option<SocketFileGuard>,
}

impl DatagramSocket {
    /// Bind the endpoint for the server role.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Inet { host, port } => {
                let addr = resolve(host, *port).await?;
                let socket = UdpSocket::bind(addr).await?;
                tracing::debug!(addr = %socket.local_addr()?, "udp socket bound");
                Ok(Self::udp(socket))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                remove_stale_socket(path)?;
                let socket = UnixDatagram::bind(path)?;
                tracing::debug!(path = %path.display(), "unix datagram socket bound");
                Ok(Self {
                    socket: Socket::Unix(socket),
                    _guard: Some(SocketFileGuard::new(path)),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(super::unsupported("unix domain sockets")),
        }
    }

    /// Bind an ephemeral local address and connect to the endpoint.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Inet { host, port } => {
                let addr = resolve(host, *port).await?;
                let local: SocketAddr = if addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Ok(Self::udp(socket))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let local = generate_socket_path("procbus-dgram");
                remove_stale_socket(&local)?;
                let socket = UnixDatagram::bind(&local)?;
                let guard = SocketFileGuard::new(local);
                socket.connect(path)?;
                Ok(Self {
                    socket: Socket::Unix(socket),
                    _guard: Some(guard),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(super::unsupported("unix domain sockets")),
        }
    }

    fn udp(socket: UdpSocket) -> Self {
        Self {
            socket: Socket::Udp(socket),
            #[cfg(unix)]
            _guard: None,
        }
    }

    /// Receive one datagram. The peer is `None` for unbound Unix senders.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<DatagramPeer>)> {
        match &self.socket {
            Socket::Udp(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                Ok((n, Some(DatagramPeer::Inet(addr))))
            }
            #[cfg(unix)]
            Socket::Unix(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                let peer = addr.as_pathname().map(|p| DatagramPeer::Unix(p.to_path_buf()));
                Ok((n, peer))
            }
        }
    }

    /// Send one datagram to the connected peer.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        let sent = match &self.socket {
            Socket::Udp(socket) => socket.send(buf).await?,
            #[cfg(unix)]
            Socket::Unix(socket) => socket.send(buf).await?,
        };
        check_whole(sent, buf.len())
    }

    /// Send one datagram to an explicit peer.
    pub async fn send_to(&self, buf: &[u8], peer: &DatagramPeer) -> Result<()> {
        let sent = match (&self.socket, peer) {
            (Socket::Udp(socket), DatagramPeer::Inet(addr)) => socket.send_to(buf, addr).await?,
            #[cfg(unix)]
            (Socket::Unix(socket), DatagramPeer::Unix(path)) => socket.send_to(buf, path).await?,
            #[cfg(unix)]
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("peer {} does not match the socket family", peer),
                )
                .into())
            }
        };
        check_whole(sent, buf.len())
    }

    /// Local address description for logs.
    pub fn local_description(&self) -> String {
        match &self.socket {
            Socket::Udp(socket) => socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "udp:?".to_string()),
            #[cfg(unix)]
            Socket::Unix(socket) => socket
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| format!("unix:{}", p.display())))
                .unwrap_or_else(|| "unix:?".to_string()),
        }
    }
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("local", &self.local_description())
            .finish()
    }
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{}:{} resolved to no addresses", host, port),
            )
        })
}

fn check_whole(sent: usize, expected: usize) -> Result<()> {
    if sent == expected {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::WriteZero,
        format!("datagram truncated: sent {} of {} bytes", sent, expected),
    )
    .into())
}
