//! Platform-specific named pipe transport.
//!
//! - Unix: Unix Domain Socket at `{temp}/{pipe_name}.sock` (absolute names used as-is)
//! - Windows: Named Pipe at `\\{server}\pipe\{pipe_name}`
//!
//! # Example
//!
//! ```no_run
//! use procbus::config::PipeOptions;
//! use procbus::transport::{PipeTransport, StreamTransport};
//!
//! # async fn demo() -> procbus::Result<()> {
//! let transport = PipeTransport::new(&PipeOptions::new("bus"))?;
//! let mut listener = transport.listen().await?;
//! let connection = transport.accept(&mut listener).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use super::{Connection, StreamTransport};
use crate::config::PipeOptions;
use crate::error::Result;

/// Pipe transport.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    inner: platform::PipeEndpoint,
}

impl PipeTransport {
    /// Resolve the pipe name and server name into a platform endpoint.
    pub fn new(options: &PipeOptions) -> Result<Self> {
        let inner = platform::PipeEndpoint::new(&options.pipe_name, options.server_name.as_deref())?;
        Ok(Self { inner })
    }
}

fn is_local_server(server_name: Option<&str>) -> bool {
    matches!(server_name, None | Some(".") | Some("localhost"))
}

#[async_trait]
impl StreamTransport for PipeTransport {
    type Listener = platform::PipeListener;

    async fn connect(&self) -> Result<Connection> {
        self.inner.connect().await
    }

    async fn listen(&self) -> Result<platform::PipeListener> {
        self.inner.listen()
    }

    async fn accept(&self, listener: &mut platform::PipeListener) -> Result<Connection> {
        listener.accept().await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod platform {
    use std::path::{Path, PathBuf};

    use tokio::net::{UnixListener, UnixStream};

    use super::is_local_server;
    use crate::error::Result;
    use crate::transport::{remove_stale_socket, unsupported, Connection, SocketFileGuard};

    #[derive(Debug, Clone)]
    pub(super) struct PipeEndpoint {
        path: PathBuf,
    }

    /// Unix Domain Socket listener standing in for a named pipe.
    #[derive(Debug)]
    pub struct PipeListener {
        listener: UnixListener,
        guard: SocketFileGuard,
    }

    impl PipeEndpoint {
        pub(super) fn new(pipe_name: &str, server_name: Option<&str>) -> Result<Self> {
            if !is_local_server(server_name) {
                return Err(unsupported("remote pipe servers"));
            }

            let name = Path::new(pipe_name);
            let path = if name.is_absolute() {
                name.to_path_buf()
            } else {
                std::env::temp_dir().join(format!("{}.sock", pipe_name))
            };
            Ok(Self { path })
        }

        pub(super) async fn connect(&self) -> Result<Connection> {
            let (reader, writer) = UnixStream::connect(&self.path).await?.into_split();
            Ok(Connection::new(reader, writer, self.describe()))
        }

        /// Removes any existing socket file at the path before binding.
        pub(super) fn listen(&self) -> Result<PipeListener> {
            remove_stale_socket(&self.path)?;
            let listener = UnixListener::bind(&self.path)?;
            tracing::debug!(path = %self.path.display(), "pipe listening");

            Ok(PipeListener {
                listener,
                guard: SocketFileGuard::new(&self.path),
            })
        }

        pub(super) fn describe(&self) -> String {
            format!("pipe:{}", self.path.display())
        }
    }

    impl PipeListener {
        pub(super) async fn accept(&mut self) -> Result<Connection> {
            let (stream, _addr) = self.listener.accept().await?;
            let (reader, writer) = stream.into_split();
            Ok(Connection::new(
                reader,
                writer,
                format!("pipe:{}", self.guard.path().display()),
            ))
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod platform {
    use std::time::Duration;

    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    use super::is_local_server;
    use crate::error::Result;
    use crate::transport::Connection;

    /// `ERROR_PIPE_BUSY`: every server instance is taken.
    const ERROR_PIPE_BUSY: i32 = 231;

    const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

    #[derive(Debug, Clone)]
    pub(super) struct PipeEndpoint {
        local_path: String,
        client_path: String,
    }

    /// Windows Named Pipe listener.
    ///
    /// Holds the next unconnected server instance so clients never see the
    /// pipe missing between accepts.
    #[derive(Debug)]
    pub struct PipeListener {
        path: String,
        next: Option<NamedPipeServer>,
    }

    impl PipeEndpoint {
        pub(super) fn new(pipe_name: &str, server_name: Option<&str>) -> Result<Self> {
            let server = if is_local_server(server_name) {
                "."
            } else {
                server_name.unwrap_or(".")
            };
            Ok(Self {
                local_path: format!(r"\\.\pipe\{}", pipe_name),
                client_path: format!(r"\\{}\pipe\{}", server, pipe_name),
            })
        }

        pub(super) async fn connect(&self) -> Result<Connection> {
            let client = loop {
                match ClientOptions::new().open(&self.client_path) {
                    Ok(client) => break client,
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                        tokio::time::sleep(BUSY_RETRY_DELAY).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            Ok(Connection::from_stream(client, self.client_path.clone()))
        }

        pub(super) fn listen(&self) -> Result<PipeListener> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.local_path)?;
            tracing::debug!(path = %self.local_path, "pipe listening");

            Ok(PipeListener {
                path: self.local_path.clone(),
                next: Some(first),
            })
        }

        pub(super) fn describe(&self) -> String {
            format!("pipe:{}", self.client_path)
        }
    }

    impl PipeListener {
        pub(super) async fn accept(&mut self) -> Result<Connection> {
            let server = match self.next.take() {
                Some(server) => server,
                None => ServerOptions::new()
                    .first_pipe_instance(false)
                    .create(&self.path)?,
            };

            server.connect().await?;

            // Fresh instance for the next peer.
            self.next = Some(
                ServerOptions::new()
                    .first_pipe_instance(false)
                    .create(&self.path)?,
            );

            Ok(Connection::from_stream(server, self.path.clone()))
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use crate::error::Result;
    use crate::transport::{unsupported, Connection};

    #[derive(Debug, Clone)]
    pub(super) struct PipeEndpoint;

    /// Placeholder listener on platforms without pipes.
    #[derive(Debug)]
    pub struct PipeListener;

    impl PipeEndpoint {
        pub(super) fn new(_pipe_name: &str, _server_name: Option<&str>) -> Result<Self> {
            Err(unsupported("named pipes"))
        }

        pub(super) async fn connect(&self) -> Result<Connection> {
            Err(unsupported("named pipes"))
        }

        pub(super) fn listen(&self) -> Result<PipeListener> {
            Err(unsupported("named pipes"))
        }

        pub(super) fn describe(&self) -> String {
            "pipe:unsupported".to_string()
        }
    }

    impl PipeListener {
        pub(super) async fn accept(&mut self) -> Result<Connection> {
            Err(unsupported("named pipes"))
        }
    }
}

pub use platform::PipeListener;
