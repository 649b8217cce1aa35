//! Local broker collaborator.
//!
//! Decoded PubSub frames are handed to a [`LocalBroker`], which fans them
//! out to in-process subscribers. [`InMemoryBroker`] is the bundled
//! implementation; subscribers are keyed by the encoded key bytes, so the
//! publisher and subscriber must use the same codec.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::Result;

/// Fire-and-forget entry point for decoded PubSub messages.
///
/// Called from the reader loop; implementations must not block.
pub trait LocalBroker: Send + Sync + 'static {
    /// Deliver one message. `key` and `message` are still codec-encoded.
    fn publish(&self, key: Bytes, message: Bytes, cancel: &CancellationToken);
}

type Subscriber = Arc<dyn Fn(&Bytes) + Send + Sync>;
type SubscriberMap = HashMap<Bytes, Vec<(u64, Subscriber)>>;

struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<SubscriberMap>,
}

impl Inner {
    fn remove(&self, key: &Bytes, id: u64) {
        let mut map = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = map.get_mut(key) {
            list.retain(|(entry, _)| *entry != id);
            if list.is_empty() {
                map.remove(key);
            }
        }
    }
}

/// In-process fan-out broker.
///
/// Subscribers run inline on the publishing task, in subscription order.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the raw message bytes published under an encoded key.
    pub fn subscribe_raw<F>(&self, key: Bytes, handler: F) -> Subscription
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            broker: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Subscribe to typed messages published under `key`.
    ///
    /// Messages that fail to decode as `M` are logged and skipped.
    pub fn subscribe<C, K, M, F>(&self, key: &K, handler: F) -> Result<Subscription>
    where
        C: Codec,
        K: Serialize + ?Sized,
        M: DeserializeOwned + 'static,
        F: Fn(M) + Send + Sync + 'static,
    {
        let key = Bytes::from(C::encode(key)?);
        Ok(self.subscribe_raw(key, move |message| match C::decode::<M>(message) {
            Ok(message) => handler(message),
            Err(error) => tracing::warn!(%error, "dropping undecodable pubsub message"),
        }))
    }

    /// Number of live subscribers for an encoded key.
    pub fn subscriber_count(&self, key: &[u8]) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker for InMemoryBroker {
    fn publish(&self, key: Bytes, message: Bytes, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }

        let targets: Vec<Subscriber> = {
            let map = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(list) => list.iter().map(|(_, s)| s.clone()).collect(),
                None => {
                    tracing::trace!(key_len = key.len(), "no subscribers for pubsub key");
                    return;
                }
            }
        };

        for subscriber in targets {
            subscriber(&message);
        }
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .inner
            .subscribers
            .read()
            .map(|map| map.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryBroker").field("keys", &keys).finish()
    }
}

/// Subscription guard. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    broker: Weak<Inner>,
    key: Bytes,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.remove(&self.key, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
