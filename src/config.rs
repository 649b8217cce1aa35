//! Worker and transport configuration.
//!
//! Every option struct deserializes from JSON (missing fields take their
//! defaults) and offers fluent setters:
//!
//! ```
//! use procbus::config::{Endpoint, TcpOptions};
//!
//! let options = TcpOptions::new(Endpoint::inet("127.0.0.1", 5050))
//!     .host_as_server(true)
//!     .send_buffer_size(256 * 1024);
//!
//! let parsed: TcpOptions = serde_json::from_str(
//!     r#"{ "endpoint": { "kind": "inet", "host": "127.0.0.1", "port": 5050 },
//!          "host_as_server": true }"#,
//! ).unwrap();
//! assert_eq!(parsed.endpoint, options.endpoint);
//! assert!(parsed.worker.host_as_server);
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Default read buffer size for stream transports (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default queue depth past which a capacity warning is logged.
pub const DEFAULT_QUEUE_WARNING_THRESHOLD: usize = 4096;

/// Default maximum datagram size (64KB).
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Callback invoked with a context string for every non-fatal loop error.
pub type UnhandledErrorHandler = Arc<dyn Fn(&str, &IpcError) + Send + Sync>;

/// Sink for errors the receive and write loops cannot return to a caller.
#[derive(Clone)]
pub struct ErrorSink {
    handler: UnhandledErrorHandler,
}

impl ErrorSink {
    /// Create a sink from a callback.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &IpcError) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Report an error. Cancellations are never reported.
    pub fn report(&self, context: &str, error: &IpcError) {
        if error.is_cancellation() {
            return;
        }
        (self.handler)(context, error);
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(|context, error| {
            tracing::error!(context, %error, "unhandled transport error");
        })
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink").finish_non_exhaustive()
    }
}

/// Options shared by every worker kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Listen and accept (server role) instead of connecting out.
    pub host_as_server: bool,
    /// Largest frame payload a stream reader will reassemble.
    pub max_frame_size: u32,
    /// Size of each read from a stream transport.
    pub read_buffer_size: usize,
    /// Outbound queue depth that triggers a capacity warning.
    ///
    /// The queue itself is unbounded.
    pub queue_warning_threshold: usize,
    /// Sink for non-fatal loop errors.
    #[serde(skip)]
    pub unhandled_error_handler: ErrorSink,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            host_as_server: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            queue_warning_threshold: DEFAULT_QUEUE_WARNING_THRESHOLD,
            unhandled_error_handler: ErrorSink::default(),
        }
    }
}

/// Network or filesystem address of a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    /// Host name or IP address plus port.
    Inet {
        /// Host name or IP literal.
        host: String,
        /// Port number.
        port: u16,
    },
    /// Unix domain socket path.
    Unix {
        /// Socket file path.
        path: PathBuf,
    },
}

impl Endpoint {
    /// Create an IP endpoint.
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Inet {
            host: host.into(),
            port,
        }
    }

    /// Create a Unix domain socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

macro_rules! worker_setters {
    () => {
        /// Listen and accept instead of connecting out.
        pub fn host_as_server(mut self, host_as_server: bool) -> Self {
            self.worker.host_as_server = host_as_server;
            self
        }

        /// Set the sink for non-fatal loop errors.
        pub fn unhandled_error_handler<F>(mut self, handler: F) -> Self
        where
            F: Fn(&str, &IpcError) + Send + Sync + 'static,
        {
            self.worker.unhandled_error_handler = ErrorSink::new(handler);
            self
        }

        /// Set the largest frame payload a reader will accept.
        pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
            self.worker.max_frame_size = max_frame_size;
            self
        }

        /// Set the queue depth that triggers a capacity warning.
        pub fn queue_warning_threshold(mut self, threshold: usize) -> Self {
            self.worker.queue_warning_threshold = threshold;
            self
        }
    };
}

/// Options for a TCP (or Unix domain stream) worker.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpOptions {
    /// Address to connect to or listen on.
    pub endpoint: Endpoint,
    /// Socket send buffer size (`SO_SNDBUF`).
    #[serde(default)]
    pub send_buffer_size: Option<u32>,
    /// Socket receive buffer size (`SO_RCVBUF`).
    #[serde(default)]
    pub receive_buffer_size: Option<u32>,
    /// Shared worker options.
    #[serde(default, flatten)]
    pub worker: WorkerOptions,
}

impl TcpOptions {
    /// Create options for an endpoint with default settings.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            send_buffer_size: None,
            receive_buffer_size: None,
            worker: WorkerOptions::default(),
        }
    }

    /// Set the socket send buffer size.
    pub fn send_buffer_size(mut self, size: u32) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Set the socket receive buffer size.
    pub fn receive_buffer_size(mut self, size: u32) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Set the size of each stream read.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.worker.read_buffer_size = size;
        self
    }

    worker_setters!();
}

/// Options for a UDP (or Unix domain datagram) worker.
#[derive(Debug, Clone, Deserialize)]
pub struct UdpOptions {
    /// Address to send to or bind.
    pub endpoint: Endpoint,
    /// Receive buffer size and largest frame that may be sent.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Shared worker options.
    #[serde(default, flatten)]
    pub worker: WorkerOptions,
}

fn default_max_datagram_size() -> usize {
    DEFAULT_MAX_DATAGRAM_SIZE
}

impl UdpOptions {
    /// Create options for an endpoint with default settings.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            worker: WorkerOptions::default(),
        }
    }

    /// Set the maximum datagram size.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    worker_setters!();
}

/// Options for a named pipe worker.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeOptions {
    /// Pipe name (Windows) or socket name/path (Unix).
    pub pipe_name: String,
    /// Remote machine for the client role (Windows only, `.` is local).
    #[serde(default)]
    pub server_name: Option<String>,
    /// Shared worker options.
    #[serde(default, flatten)]
    pub worker: WorkerOptions,
}

impl PipeOptions {
    /// Create options for a pipe name with default settings.
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            server_name: None,
            worker: WorkerOptions::default(),
        }
    }

    /// Set the remote server name for the client role.
    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Set the size of each pipe read.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.worker.read_buffer_size = size;
        self
    }

    worker_setters!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_worker_defaults() {
        let options = WorkerOptions::default();
        assert!(!options.host_as_server);
        assert_eq!(options.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(options.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_udp_options_from_json_defaults() {
        let options: UdpOptions = serde_json::from_str(
            r#"{ "endpoint": { "kind": "unix", "path": "/tmp/bus.sock" } }"#,
        )
        .unwrap();

        assert_eq!(options.endpoint, Endpoint::unix("/tmp/bus.sock"));
        assert_eq!(options.max_datagram_size, DEFAULT_MAX_DATAGRAM_SIZE);
        assert!(!options.worker.host_as_server);
    }

    #[test]
    fn test_pipe_options_from_json() {
        let options: PipeOptions = serde_json::from_str(
            r#"{ "pipe_name": "bus", "server_name": ".", "max_frame_size": 1024 }"#,
        )
        .unwrap();

        assert_eq!(options.pipe_name, "bus");
        assert_eq!(options.server_name.as_deref(), Some("."));
        assert_eq!(options.worker.max_frame_size, 1024);
    }

    #[test]
    fn test_fluent_setters() {
        let options = TcpOptions::new(Endpoint::inet("localhost", 1))
            .host_as_server(true)
            .send_buffer_size(10)
            .receive_buffer_size(20)
            .max_frame_size(30);

        assert!(options.worker.host_as_server);
        assert_eq!(options.send_buffer_size, Some(10));
        assert_eq!(options.receive_buffer_size, Some(20));
        assert_eq!(options.worker.max_frame_size, 30);
    }

    #[test]
    fn test_error_sink_skips_cancellation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = ErrorSink::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.report("loop", &IpcError::Cancelled);
        sink.report("loop", &IpcError::ConnectionClosed);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::inet("127.0.0.1", 80).to_string(), "127.0.0.1:80");
        assert_eq!(Endpoint::unix("/tmp/x").to_string(), "unix:/tmp/x");
    }
}
