//! Lifecycle states for connections and the resources they own.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of a consumer or producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Usable; callers pass straight through.
    Active,
    /// Link lost; callers park until the owner resumes or terminates.
    Suspended,
    /// Recovery abandoned or connection closed. One-way.
    Terminated,
    /// Explicitly disposed by the application. One-way.
    Disposed,
}

impl ResourceState {
    /// True for states a resource never leaves.
    pub fn is_final(self) -> bool {
        matches!(self, ResourceState::Terminated | ResourceState::Disposed)
    }
}

/// Lifecycle of a recovering connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A physical connection is up and every resource is attached.
    Connected,
    /// The physical connection (or a link) is being re-established.
    Reconnecting,
    /// Recovery abandoned or connection disposed. One-way.
    Terminated,
}

/// Shared, lock-free view of a connection's state and attempt counter.
#[derive(Clone)]
pub struct RecoveryState {
    state: Arc<AtomicU8>,
    attempts: Arc<AtomicU32>,
    reconnects: Arc<AtomicU32>,
}

impl RecoveryState {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(Self::encode(ConnectionState::Reconnecting))),
            attempts: Arc::new(AtomicU32::new(0)),
            reconnects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        Self::decode(self.state.load(Ordering::Acquire))
    }

    /// Sets the state and returns the previous one. `Terminated` is sticky.
    pub(crate) fn transition(&self, to: ConnectionState) -> ConnectionState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = Self::decode(current);
            if from == ConnectionState::Terminated {
                return from;
            }
            match self.state.compare_exchange_weak(
                current,
                Self::encode(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return from,
                Err(actual) => current = actual,
            }
        }
    }

    /// Connect attempts made in the current (or last) reconnect sequence.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn increment_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    /// Completed reconnect sequences since the connection was created.
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub(crate) fn mark_reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }

    fn encode(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::Connected => 0,
            ConnectionState::Reconnecting => 1,
            ConnectionState::Terminated => 2,
        }
    }

    fn decode(encoded: u8) -> ConnectionState {
        match encoded {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Reconnecting,
            _ => ConnectionState::Terminated,
        }
    }
}

impl std::fmt::Debug for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryState")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .field("reconnects", &self.reconnects())
            .finish()
    }
}
