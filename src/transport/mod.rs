//! Transport module - platform-specific pipe/socket handling.
//!
//! Provides abstraction over:
//! - TCP sockets and Unix domain stream sockets ([`TcpTransport`])
//! - Named Pipes on Windows, Unix domain sockets elsewhere ([`PipeTransport`])
//! - UDP sockets and Unix domain datagram sockets ([`DatagramSocket`])
//!
//! Stream transports hand the worker a [`Connection`]: boxed read and
//! write halves that the reader and writer loops own independently.

mod datagram;
mod pipe;
mod stream;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{IpcError, Result};

pub use datagram::{DatagramPeer, DatagramSocket};
pub use pipe::{PipeListener, PipeTransport};
pub use stream::{StreamListener, TcpTransport};

/// Boxed read half of a connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established stream connection.
pub struct Connection {
    /// Read half, owned by the reader loop.
    pub reader: BoxedReader,
    /// Write half, owned by the writer loop.
    pub writer: BoxedWriter,
    /// Peer description for logs.
    pub peer: String,
}

impl Connection {
    /// Build a connection from already split halves.
    pub fn new<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }

    /// Split a duplex stream into a connection.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, peer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// A connection-oriented transport.
///
/// Client-role workers call [`connect`](StreamTransport::connect) once.
/// Server-role workers call [`listen`](StreamTransport::listen) once and
/// then [`accept`](StreamTransport::accept) for every new peer.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Listening state kept between accepts.
    type Listener: Send + 'static;

    /// Connect out to the configured endpoint.
    async fn connect(&self) -> Result<Connection>;

    /// Start listening on the configured endpoint.
    async fn listen(&self) -> Result<Self::Listener>;

    /// Wait for the next peer.
    async fn accept(&self, listener: &mut Self::Listener) -> Result<Connection>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

pub(crate) fn unsupported(what: &str) -> IpcError {
    IpcError::ConnectionFailed(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported on this platform", what),
    ))
}

/// Guard that removes a socket file on drop.
#[derive(Debug)]
pub struct SocketFileGuard {
    path: PathBuf,
}

impl SocketFileGuard {
    /// Take ownership of a bound socket path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Remove a leftover socket file before binding.
pub(crate) fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Generate a unique socket path in the temp directory.
///
/// Format: `{temp}/{prefix}-{pid}-{random}.sock`
pub fn generate_socket_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    std::env::temp_dir().join(format!("{}-{}-{:x}.sock", prefix, pid, rand_u64()))
}

/// Simple random u64 using system time, process ID and a counter.
fn rand_u64() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let pid = std::process::id() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ seq.rotate_left(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_socket_path_format() {
        let path = generate_socket_path("procbus-test");
        let name = path.file_name().unwrap().to_str().unwrap();
        let pid = std::process::id().to_string();

        assert!(name.starts_with("procbus-test-"));
        assert!(name.ends_with(".sock"));
        assert!(name.contains(&pid), "Path should contain PID");
        assert!(path.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_generate_socket_path_uniqueness() {
        let paths: Vec<PathBuf> = (0..10).map(|_| generate_socket_path("u")).collect();

        for (i, p1) in paths.iter().enumerate() {
            for p2 in &paths[i + 1..] {
                assert_ne!(p1, p2, "Paths should be unique");
            }
        }
    }

    #[test]
    fn test_socket_file_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guarded.sock");
        std::fs::write(&path, b"").unwrap();

        let guard = SocketFileGuard::new(&path);
        assert_eq!(guard.path(), path.as_path());
        drop(guard);

        assert!(!path.exists());
    }

    #[test]
    fn test_remove_stale_socket_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_stale_socket(&dir.path().join("missing.sock")).unwrap();
    }

    #[tokio::test]
    async fn test_connection_from_duplex() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(a, "duplex");
        assert_eq!(conn.peer, "duplex");

        conn.writer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        b.write_all(b"yo").await.unwrap();
        conn.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");
    }
}
