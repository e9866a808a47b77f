use std::time::{Duration, Instant};

use amqp_autorecovery_core::ClientEvent;

use crate::resource::{ResourceId, ResourceKind};
use crate::state::ConnectionState;

/// Events emitted by a recovering connection and its resources.
#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    /// A resource closed its gate; callers now park.
    ResourceSuspended {
        connection: String,
        timestamp: Instant,
        resource: ResourceId,
        kind: ResourceKind,
    },
    /// A resource reopened its gate after a rebuild.
    ResourceResumed {
        connection: String,
        timestamp: Instant,
        resource: ResourceId,
        kind: ResourceKind,
    },
    /// A resource attached a fresh link.
    ResourceRecovered {
        connection: String,
        timestamp: Instant,
        resource: ResourceId,
        kind: ResourceKind,
        generation: u64,
    },
    /// A resource was terminated. `clean` is false when a cause was recorded.
    ResourceTerminated {
        connection: String,
        timestamp: Instant,
        resource: ResourceId,
        kind: ResourceKind,
        clean: bool,
    },
    /// The physical connection dropped.
    ConnectionLost {
        connection: String,
        timestamp: Instant,
    },
    /// A connect attempt is about to start.
    ReconnectAttempt {
        connection: String,
        timestamp: Instant,
        attempt: u32,
    },
    /// A connect attempt failed; the loop will wait `delay` before the next one.
    ReconnectBackoff {
        connection: String,
        timestamp: Instant,
        attempt: u32,
        delay: Duration,
    },
    /// A reconnect sequence finished and resources were rebuilt.
    Reconnected {
        connection: String,
        timestamp: Instant,
        attempts: u32,
    },
    /// The retry budget ran out.
    RecoveryExhausted {
        connection: String,
        timestamp: Instant,
        attempts: u32,
    },
    /// The connection changed state.
    StateTransition {
        connection: String,
        timestamp: Instant,
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl ClientEvent for RecoveryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RecoveryEvent::ResourceSuspended { .. } => "resource_suspended",
            RecoveryEvent::ResourceResumed { .. } => "resource_resumed",
            RecoveryEvent::ResourceRecovered { .. } => "resource_recovered",
            RecoveryEvent::ResourceTerminated { .. } => "resource_terminated",
            RecoveryEvent::ConnectionLost { .. } => "connection_lost",
            RecoveryEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            RecoveryEvent::ReconnectBackoff { .. } => "reconnect_backoff",
            RecoveryEvent::Reconnected { .. } => "reconnected",
            RecoveryEvent::RecoveryExhausted { .. } => "recovery_exhausted",
            RecoveryEvent::StateTransition { .. } => "state_transition",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            RecoveryEvent::ResourceSuspended { timestamp, .. }
            | RecoveryEvent::ResourceResumed { timestamp, .. }
            | RecoveryEvent::ResourceRecovered { timestamp, .. }
            | RecoveryEvent::ResourceTerminated { timestamp, .. }
            | RecoveryEvent::ConnectionLost { timestamp, .. }
            | RecoveryEvent::ReconnectAttempt { timestamp, .. }
            | RecoveryEvent::ReconnectBackoff { timestamp, .. }
            | RecoveryEvent::Reconnected { timestamp, .. }
            | RecoveryEvent::RecoveryExhausted { timestamp, .. }
            | RecoveryEvent::StateTransition { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            RecoveryEvent::ResourceSuspended { connection, .. }
            | RecoveryEvent::ResourceResumed { connection, .. }
            | RecoveryEvent::ResourceRecovered { connection, .. }
            | RecoveryEvent::ResourceTerminated { connection, .. }
            | RecoveryEvent::ConnectionLost { connection, .. }
            | RecoveryEvent::ReconnectAttempt { connection, .. }
            | RecoveryEvent::ReconnectBackoff { connection, .. }
            | RecoveryEvent::Reconnected { connection, .. }
            | RecoveryEvent::RecoveryExhausted { connection, .. }
            | RecoveryEvent::StateTransition { connection, .. } => connection,
        }
    }
}
