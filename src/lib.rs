//! # procbus
//!
//! Interprocess publish/subscribe and request/response over named pipes,
//! TCP and UDP.
//!
//! Two peers each run a worker on the same endpoint, one of them in the
//! server role. Either side can then:
//!
//! - **publish** a keyed message, delivered to the peer's local broker
//! - **request** a typed response, answered by a handler registered on the peer
//!
//! ## Architecture
//!
//! - **Wire format**: `[len: u32 LE][type: u8][key_len: u32 LE][key][value]`,
//!   with keys and values encoded by a pluggable [`Codec`]
//! - **Outbound**: an unbounded FIFO queue drained by one writer task per connection
//! - **Inbound**: a reader task that reassembles frames (streams) or validates
//!   datagrams, then dispatches by message type
//! - **Correlation**: each request carries an `i32` id; responses and errors
//!   resolve the matching waiter
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use procbus::{Endpoint, HandlerError, HandlerRegistry, InMemoryBroker, TcpOptions, TcpWorker};
//!
//! #[tokio::main]
//! async fn main() -> procbus::Result<()> {
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.register(|name: String| async move {
//!         Ok::<_, HandlerError>(format!("hello, {}", name))
//!     });
//!
//!     let server: TcpWorker = TcpWorker::new(
//!         TcpOptions::new(Endpoint::inet("127.0.0.1", 5050)).host_as_server(true),
//!         Arc::new(handlers),
//!         Arc::new(InMemoryBroker::new()),
//!     );
//!     server.start().await?;
//!
//!     let client: TcpWorker = TcpWorker::new(
//!         TcpOptions::new(Endpoint::inet("127.0.0.1", 5050)),
//!         Arc::new(HandlerRegistry::new()),
//!         Arc::new(InMemoryBroker::new()),
//!     );
//!     let greeting: String = client.request::<String, String>(&"bus".to_string()).await?;
//!     println!("{}", greeting);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod transport;
pub mod worker;
pub mod writer;

mod reader;

pub use broker::{InMemoryBroker, LocalBroker, Subscription};
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use config::{Endpoint, ErrorSink, PipeOptions, TcpOptions, UdpOptions, WorkerOptions};
pub use error::{IpcError, Result};
pub use handler::{HandlerError, HandlerRegistry};
pub use lifecycle::ConnectionState;
pub use tokio_util::sync::CancellationToken;
pub use worker::{PipeWorker, StreamWorker, TcpWorker, UdpWorker};
