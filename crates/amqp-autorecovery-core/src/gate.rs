//! A re-closeable broadcast gate.
//!
//! [`SuspensionGate`] is what every recoverable handle parks its callers on
//! while the underlying link is being rebuilt. It is either open or closed;
//! any number of tasks may wait for it to open, and opening it releases all
//! of them at once. Closing it again affects only waiters that arrive
//! afterwards.
//!
//! The gate is backed by a [`tokio::sync::watch`] channel. Each waiter holds
//! its own receiver, so a waiter that gives up (cancellation or timeout)
//! simply drops that receiver and leaves nothing behind.
//!
//! # Examples
//!
//! ```
//! use amqp_autorecovery_core::SuspensionGate;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gate = SuspensionGate::new();
//! assert!(gate.close());
//! assert!(!gate.close()); // already closed, no transition
//!
//! let waiter = {
//!     let gate = gate.clone();
//!     tokio::spawn(async move { gate.wait().await })
//! };
//!
//! assert!(gate.open());
//! waiter.await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Reasons a wait on a [`SuspensionGate`] can end without the gate opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The caller's cancellation token fired first.
    #[error("wait cancelled")]
    Cancelled,
    /// The caller's deadline elapsed first.
    #[error("wait timed out after {0:?}")]
    TimedOut(Duration),
}

/// A gate that suspends callers while closed.
///
/// Cloning shares the same gate.
#[derive(Clone)]
pub struct SuspensionGate {
    open: Arc<watch::Sender<bool>>,
}

impl SuspensionGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::with_state(true)
    }

    /// Creates a gate that starts closed.
    pub fn closed() -> Self {
        Self::with_state(false)
    }

    fn with_state(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        Self { open: Arc::new(tx) }
    }

    /// Closes the gate.
    ///
    /// Returns `true` only when this call performed the open → closed
    /// transition, so callers can log the transition once.
    pub fn close(&self) -> bool {
        self.open
            .send_if_modified(|open| std::mem::replace(open, false))
    }

    /// Opens the gate, releasing every current waiter.
    ///
    /// Returns `true` only when this call performed the closed → open
    /// transition.
    pub fn open(&self) -> bool {
        self.open
            .send_if_modified(|open| !std::mem::replace(open, true))
    }

    /// Non-blocking observation of the gate.
    ///
    /// Only suitable for diagnostics. Use one of the `wait` methods to
    /// actually pass the gate.
    pub fn is_closed(&self) -> bool {
        !*self.open.borrow()
    }

    /// Waits until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Waits until the gate is open or `cancel` fires.
    ///
    /// An open gate wins over a token that is already cancelled.
    pub async fn wait_cancellable(&self, cancel: &CancellationToken) -> Result<(), GateError> {
        let mut rx = self.open.subscribe();
        tokio::select! {
            biased;
            _ = rx.wait_for(|open| *open) => Ok(()),
            _ = cancel.cancelled() => Err(GateError::Cancelled),
        }
    }

    /// Waits until the gate is open or `timeout` elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), GateError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| GateError::TimedOut(timeout))
    }

    /// Number of tasks currently parked on the gate.
    pub fn waiters(&self) -> usize {
        self.open.receiver_count()
    }
}

impl Default for SuspensionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SuspensionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspensionGate")
            .field("closed", &self.is_closed())
            .field("waiters", &self.waiters())
            .finish()
    }
}
