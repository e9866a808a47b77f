//! Error types.
//!
//! Two layers:
//!
//! - [`TransportError`] is what the wire-level collaborator reports. The
//!   recovery core inspects it to decide between "rebuild the link" and
//!   "hand the failure to the caller".
//! - [`RecoveryError`] is what application code sees. Closed variants carry
//!   the captured termination cause, `None` meaning a clean close.

use crate::resource::ResourceKind;

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The link (consumer or producer) was closed by the peer.
    #[error("link closed: {0}")]
    LinkClosed(String),
    /// The physical connection is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// A connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// The broker refused to create a link.
    #[error("broker rejected the request: {reason}")]
    Rejected {
        /// Broker-supplied reason.
        reason: String,
    },
    /// A settlement referred to a delivery the link does not know.
    #[error("invalid delivery: {0}")]
    InvalidDelivery(String),
    /// A transport operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// True when the link this operation ran on is no longer usable.
    ///
    /// A closed connection closes every link on it.
    pub fn is_link_closed(&self) -> bool {
        matches!(
            self,
            TransportError::LinkClosed(_) | TransportError::ConnectionClosed(_)
        )
    }

    /// True when the failure is about the connection itself rather than
    /// the resource being created on it.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed(_)
                | TransportError::ConnectFailed(_)
                | TransportError::Timeout(_)
        )
    }
}

/// Errors surfaced by connections, consumers and producers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
    /// The consumer was terminated.
    #[error("consumer closed{}", describe_cause(.cause))]
    ConsumerClosed {
        /// The unrecoverable failure, `None` for a clean close.
        #[source]
        cause: Option<TransportError>,
    },
    /// The producer was terminated.
    #[error("producer closed{}", describe_cause(.cause))]
    ProducerClosed {
        /// The unrecoverable failure, `None` for a clean close.
        #[source]
        cause: Option<TransportError>,
    },
    /// The connection was terminated.
    #[error("connection closed{}", describe_cause(.cause))]
    ConnectionClosed {
        /// The unrecoverable failure, `None` for a clean close.
        #[source]
        cause: Option<TransportError>,
    },
    /// The handle was used after its own `dispose`.
    #[error("{resource} has been disposed")]
    Disposed {
        /// Which kind of handle.
        resource: ResourceKind,
    },
    /// The caller's cancellation fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,
    /// The producer link died mid-send. The message may or may not have
    /// reached the broker; resending is the caller's decision.
    #[error("send interrupted by link failure, producer is recovering")]
    SendInterrupted {
        /// The link failure.
        #[source]
        source: TransportError,
    },
    /// The message was received on a link that has since been replaced.
    #[error("delivery belongs to a link that no longer exists")]
    StaleDelivery,
    /// The message was not received by this consumer.
    #[error("delivery was not received by this consumer")]
    ForeignDelivery,
    /// The broker refused to create the link.
    #[error("failed to create {resource}: {source}")]
    Create {
        /// Which kind of handle.
        resource: ResourceKind,
        /// The broker's refusal.
        #[source]
        source: TransportError,
    },
    /// A single receive spanned more recovery cycles than allowed.
    #[error("receive abandoned after {cycles} recovery cycles")]
    RecoveryCyclesExceeded {
        /// Cycles observed by the call.
        cycles: u32,
        /// The last link failure.
        #[source]
        source: TransportError,
    },
    /// Any other transport failure, passed through unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn describe_cause(cause: &Option<TransportError>) -> String {
    match cause {
        Some(cause) => format!(" due to an unrecoverable error: {}", cause),
        None => String::new(),
    }
}

impl RecoveryError {
    pub(crate) fn closed(kind: ResourceKind, cause: Option<TransportError>) -> Self {
        match kind {
            ResourceKind::Consumer => RecoveryError::ConsumerClosed { cause },
            ResourceKind::Producer | ResourceKind::AnonymousProducer => {
                RecoveryError::ProducerClosed { cause }
            }
            ResourceKind::Connection => RecoveryError::ConnectionClosed { cause },
        }
    }

    /// True for errors meaning the handle will never work again.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            RecoveryError::ConsumerClosed { .. }
                | RecoveryError::ProducerClosed { .. }
                | RecoveryError::ConnectionClosed { .. }
                | RecoveryError::Disposed { .. }
        )
    }

    /// True when repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecoveryError::SendInterrupted { .. })
    }

    /// True when the caller's own cancellation ended the call.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RecoveryError::Cancelled)
    }

    /// The termination cause, for closed errors.
    pub fn cause(&self) -> Option<&TransportError> {
        match self {
            RecoveryError::ConsumerClosed { cause }
            | RecoveryError::ProducerClosed { cause }
            | RecoveryError::ConnectionClosed { cause } => cause.as_ref(),
            _ => None,
        }
    }
}

/// Result alias for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;
