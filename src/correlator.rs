//! Correlation of remote requests with their responses.
//!
//! The correlator hands out 32-bit ids and keeps a map from id to a
//! single-resolution completion. The reader resolves entries as
//! RemoteResponse/RemoteError frames arrive; unknown ids are dropped.
//!
//! # Id space
//!
//! Ids are `i32` on the wire and wrap on overflow. Before an id is handed
//! out the map is checked, and ids still pending are skipped, so a wrapped
//! counter never aliases a live request.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use procbus::correlator::RequestCorrelator;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let correlator = RequestCorrelator::new();
//! let pending = correlator.register();
//!
//! assert!(correlator.resolve(pending.id(), Ok(Bytes::from_static(b"done"))));
//! let body = pending.wait(&CancellationToken::new()).await.unwrap();
//! assert_eq!(&body[..], b"done");
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{IpcError, Result};

type Completion = oneshot::Sender<Result<Bytes>>;
type PendingMap = Mutex<HashMap<i32, Completion>>;

fn lock(map: &PendingMap) -> MutexGuard<'_, HashMap<i32, Completion>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Id generator plus the map of in-flight requests.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicI32,
    pending: Arc<PendingMap>,
}

impl RequestCorrelator {
    /// Create an empty correlator. The first id is 1.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    fn starting_at(last_id: i32) -> Self {
        Self {
            next_id: AtomicI32::new(last_id),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next id from the monotonic counter (wraps on overflow).
    pub fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Allocate an id and register a pending completion for it.
    pub fn register(&self) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);

        let id = loop {
            let id = self.next_id();
            if !pending.contains_key(&id) {
                break id;
            }
            tracing::warn!(id, "correlation id wrapped onto a pending request, skipping");
        };

        pending.insert(id, tx);

        PendingRequest {
            id,
            rx,
            map: Arc::downgrade(&self.pending),
        }
    }

    /// Resolve a pending request.
    ///
    /// Returns `false` if the id is unknown, already resolved, or its caller
    /// stopped waiting. Such outcomes are dropped.
    pub fn resolve(&self, id: i32, outcome: Result<Bytes>) -> bool {
        let Some(tx) = lock(&self.pending).remove(&id) else {
            tracing::trace!(id, "dropping outcome for unknown or stale correlation id");
            return false;
        };
        tx.send(outcome).is_ok()
    }

    /// Fail every pending request with an error from `reason`.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all<F>(&self, reason: F) -> usize
    where
        F: Fn() -> IpcError,
    {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(reason()));
        }
        count
    }

    /// Number of requests awaiting resolution.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller side of one registered request.
///
/// Dropping it before resolution removes the map entry, so a caller that
/// gives up never leaks an id.
#[derive(Debug)]
pub struct PendingRequest {
    id: i32,
    rx: oneshot::Receiver<Result<Bytes>>,
    map: Weak<PendingMap>,
}

impl PendingRequest {
    /// Correlation id carried by the request frame.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Wait for the outcome, or `Cancelled` if `cancel` fires first.
    ///
    /// Cancelling only abandons this wait; the connection is untouched.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            biased;
            outcome = &mut self.rx => outcome.unwrap_or(Err(IpcError::Cancelled)),
            _ = cancel.cancelled() => Err(IpcError::Cancelled),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.rx.close();
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let mut pending = lock(&map);
        // Only our own closed sender; the id may have been reissued.
        if pending.get(&self.id).is_some_and(|tx| tx.is_closed()) {
            pending.remove(&self.id);
        }
    }
}
