//! Self-healing AMQP connections, consumers and producers.
//!
//! Application code holds long-lived [`Connection`], [`Consumer`],
//! [`Producer`] and [`AnonymousProducer`] handles. When a link or the
//! physical connection fails, the affected handles suspend their callers,
//! a per-connection task reconnects with backoff and reattaches every
//! handle with its original configuration, and the callers carry on.
//! When recovery is impossible the handles are terminated and every later
//! call fails immediately with the recorded cause.
//!
//! The wire protocol is not part of this crate. Anything implementing
//! [`Transport`] can be wrapped; the `test-util` feature provides an
//! in-memory broker with fault injection.
//!
//! # Features
//!
//! - **Transparent receive**: a pending [`Consumer::receive`] spans link loss,
//!   reconnects and reattachment, and returns the next message
//! - **Explicit resend**: a send interrupted by link loss fails with the
//!   retryable [`RecoveryError::SendInterrupted`] instead of being replayed
//! - **One reconnect at a time**: concurrent failure reports fold into a
//!   single reconnect sequence
//! - **Independent resources**: a resource that cannot be reattached is
//!   terminated alone
//! - **Event system**: observe suspensions, reconnects and terminations
//!   through [`RecoveryConfig`] listeners
//!
//! # Examples
//!
//! ```rust
//! use amqp_autorecovery::{RecoveryConfig, RecoveryPolicy};
//! use std::time::Duration;
//!
//! let config = RecoveryConfig::builder()
//!     .name("orders")
//!     .policy(RecoveryPolicy::exponential(
//!         Duration::from_millis(100),
//!         Duration::from_secs(5),
//!     ))
//!     .max_attempts(20)
//!     .attempt_timeout(Duration::from_secs(2))
//!     .on_reconnected(|attempts| {
//!         println!("reconnected after {} attempts", attempts);
//!     })
//!     .build();
//!
//! assert_eq!(config.max_attempts(), Some(20));
//! ```
//!
//! # Feature Flags
//!
//! - `tracing`: structured logs for suspensions, reconnect attempts and terminations
//! - `metrics`: counters and gauges through the `metrics` facade
//! - `test-util`: the [`testing`] module with an in-memory broker

mod address;
mod config;
mod connection;
mod consumer;
mod error;
mod events;
mod message;
#[cfg(feature = "metrics")]
mod metrics_support;
mod orchestrator;
mod policy;
mod producer;
mod registry;
mod resource;
mod state;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use address::{
    ConsumerConfig, ConsumerConfigBuilder, Destination, Endpoint, ProducerTarget, RoutingType,
};
pub use config::{RecoveryConfig, RecoveryConfigBuilder};
pub use connection::Connection;
pub use consumer::Consumer;
pub use error::{RecoveryError, Result, TransportError};
pub use events::RecoveryEvent;
pub use message::{Message, Transaction};
pub use policy::RecoveryPolicy;
pub use producer::{AnonymousProducer, Producer};
pub use resource::{Recoverable, ResourceId, ResourceKind};
pub use state::{ConnectionState, RecoveryState, ResourceState};
pub use transport::{LiveConnection, LiveConsumer, LiveLink, LiveProducer, Transport};

// Re-export the primitives and backoff strategies for convenience
pub use amqp_autorecovery_backoff::{
    ExponentialBackoff, ExponentialRandomBackoff, FixedInterval, FnInterval, IntervalFunction,
};
pub use amqp_autorecovery_core::{ClientEvent, GateError, SuspensionGate};
