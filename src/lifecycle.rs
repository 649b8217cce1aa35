//! Connection state tracking and one-shot start gates.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::OnceCell;

use crate::error::Result;

/// Lifecycle of one physical connection.
///
/// Server-role workers cycle `Connected -> Closed -> Connecting -> Connected`
/// as peers come and go. For client-role workers `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Unconnected,
    /// Connecting out, or waiting for a peer to connect in.
    Connecting,
    /// A peer is attached.
    Connected,
    /// The connection ended.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closed,
            _ => ConnectionState::Unconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Unconnected as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::trace!(%previous, current = %state, "connection state changed");
        }
    }
}

/// One-shot start guard.
///
/// Many tasks may race to start the same loops. One of them runs the start
/// routine while the rest wait for its outcome. Success is permanent. A
/// failure, or the running caller being dropped, leaves the gate open and
/// the next waiter runs the routine itself, so no caller proceeds before
/// the worker is actually started.
#[derive(Debug)]
pub(crate) struct StartGate(OnceCell<()>);

impl StartGate {
    pub(crate) fn new() -> Self {
        Self(OnceCell::new())
    }

    /// Run `start` unless the gate is already open, waiting out any
    /// concurrent attempt first.
    pub(crate) async fn run<F, Fut>(&self, start: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.0.get_or_try_init(start).await.map(|_| ())
    }

    pub(crate) fn is_started(&self) -> bool {
        self.0.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpcError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Unconnected);

        cell.set(ConnectionState::Connecting);
        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);

        cell.set(ConnectionState::Closed);
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_gate_runs_start_once() {
        let gate = Arc::new(StartGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let racers: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    gate.run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for racer in racers {
            racer.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(gate.is_started());
    }

    #[tokio::test]
    async fn test_gate_failure_reaches_every_waiter() {
        let gate = Arc::new(StartGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let racers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    gate.run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Err(IpcError::ConnectionClosed)
                    })
                    .await
                })
            })
            .collect();

        for racer in racers {
            assert!(matches!(
                racer.await.unwrap(),
                Err(IpcError::ConnectionClosed)
            ));
        }
        // Each waiter retried after the previous attempt failed.
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert!(!gate.is_started());

        gate.run(|| async { Ok(()) }).await.unwrap();
        assert!(gate.is_started());
    }
}
