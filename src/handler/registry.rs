//! Handler registry for dispatching remote requests by type-id pair.
//!
//! The registry maps `(request_type, response_type)` strings to handlers.
//! It is built once before the worker starts and shared read-only
//! afterwards, so dispatch is a map lookup plus one virtual call.
//!
//! # Example
//!
//! ```
//! use procbus::codec::MsgPackCodec;
//! use procbus::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::<MsgPackCodec>::new();
//!
//! registry.register(|n: i32| async move { Ok::<_, procbus::handler::HandlerError>(n * 2) });
//! registry.register_named("echo", "echo", |s: String| async move {
//!     Ok::<_, procbus::handler::HandlerError>(s)
//! });
//!
//! assert!(registry.resolve("echo", "echo").is_some());
//! assert_eq!(registry.len(), 2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;

/// Error a handler returns; its display string travels to the caller.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a handler call: the encoded response body.
pub type HandlerResult = std::result::Result<Vec<u8>, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type id used on the wire for `T` when none is given explicitly.
///
/// This is [`std::any::type_name`], which may change between compiler
/// versions. Only rely on it when both peers come from the same build.
pub fn type_key<T: ?Sized>() -> &'static str {
    std::any::type_name::<T>()
}

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with the encoded body bytes.
    fn call(&self, request: Bytes) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the request and encodes the response with `C`.
pub struct TypedHandler<C, F, Req, Res, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (C, Res, Fut)>,
}

impl<C, F, Req, Res, Fut> TypedHandler<C, F, Req, Res, Fut>
where
    C: Codec,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<Res, HandlerError>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<C, F, Req, Res, Fut> Handler for TypedHandler<C, F, Req, Res, Fut>
where
    C: Codec,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Fut: Future<Output = std::result::Result<Res, HandlerError>> + Send + 'static,
{
    fn call(&self, request: Bytes) -> BoxFuture<'static, HandlerResult> {
        let parsed: Req = match C::decode(&request) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let response = fut.await?;
            Ok(C::encode(&response)?)
        })
    }
}

/// Registry mapping type-id pairs to handlers.
pub struct HandlerRegistry<C: Codec> {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> HandlerRegistry<C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            _codec: PhantomData,
        }
    }

    /// Register a handler keyed by the Rust type names of `Req` and `Res`.
    ///
    /// Pairs with `request::<Req, Res>` on the calling worker. The ids are
    /// [`type_key`] strings, so a peer compiled by a different toolchain may
    /// not match them; use [`register_named`](Self::register_named) there.
    pub fn register<F, Req, Res, Fut>(&mut self, handler: F)
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<Res, HandlerError>> + Send + 'static,
    {
        self.register_named(type_key::<Req>(), type_key::<Res>(), handler);
    }

    /// Register a handler under explicit type ids.
    ///
    /// Registering the same pair twice replaces the earlier handler.
    pub fn register_named<F, Req, Res, Fut>(
        &mut self,
        request_type: &str,
        response_type: &str,
        handler: F,
    ) where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        Fut: Future<Output = std::result::Result<Res, HandlerError>> + Send + 'static,
    {
        let typed = TypedHandler::<C, _, _, _, _>::new(handler);
        let key = (request_type.to_string(), response_type.to_string());
        if self.handlers.insert(key, Arc::new(typed)).is_some() {
            tracing::warn!(request_type, response_type, "replaced remote handler");
        }
    }

    /// Look up the handler for an exact type-id pair.
    pub fn resolve(&self, request_type: &str, response_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(request_type.to_string(), response_type.to_string()))
            .cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: Codec> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
