//! Handler module - remote request handling.
//!
//! Provides [`HandlerRegistry`], an explicit per-worker map from
//! `(request_type, response_type)` pairs to typed async closures.
//!
//! # Example
//!
//! ```
//! use procbus::codec::MsgPackCodec;
//! use procbus::handler::{HandlerError, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::<MsgPackCodec>::new();
//!
//! // Keyed by Rust type names; callers use `request::<i32, i32>`
//! registry.register(|n: i32| async move { Ok::<_, HandlerError>(n * 2) });
//!
//! // Failures travel back to the caller as a RemoteError
//! registry.register_named("Validate", "Unit", |input: String| async move {
//!     if input.is_empty() {
//!         return Err::<(), HandlerError>("bad input".into());
//!     }
//!     Ok(())
//! });
//! ```

mod registry;

pub use registry::{
    type_key, BoxFuture, Handler, HandlerError, HandlerRegistry, HandlerResult, TypedHandler,
};
