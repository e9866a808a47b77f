//! The capability set a wire-level AMQP client must provide.
//!
//! The recovery core never speaks the protocol itself. It asks a
//! [`Transport`] for a [`LiveConnection`], asks that connection for
//! [`LiveConsumer`]s and [`LiveProducer`]s, and throws all of them away
//! wholesale when they fail. Implementations report link loss with
//! [`TransportError::LinkClosed`] and connection loss with
//! [`TransportError::ConnectionClosed`]; everything else is passed to the
//! caller unchanged.

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::{ConsumerConfig, Destination, Endpoint, ProducerTarget};
use crate::error::TransportError;
use crate::message::{Message, Transaction};

/// Opens physical connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes a connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn LiveConnection>, TransportError>;
}

/// One established physical connection.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    /// Attaches a receiver link.
    async fn create_consumer(
        &self,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn LiveConsumer>, TransportError>;

    /// Attaches a sender link.
    async fn create_producer(
        &self,
        target: &ProducerTarget,
    ) -> Result<Arc<dyn LiveProducer>, TransportError>;

    /// Resolves once the connection is gone, with the reason.
    async fn closed(&self) -> TransportError;

    /// Non-blocking check of [`closed`](Self::closed).
    fn is_closed(&self) -> bool;

    /// Closes the connection and every link on it.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Behavior shared by every link.
#[async_trait]
pub trait LiveLink: Send + Sync {
    /// Detaches the link, releasing broker-side state.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A receiver link.
#[async_trait]
pub trait LiveConsumer: LiveLink {
    /// Waits for the next delivery.
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a message.
    async fn receive(&self) -> Result<Message, TransportError>;

    /// Settles a delivery as accepted.
    async fn accept(
        &self,
        message: &Message,
        transaction: Option<&Transaction>,
    ) -> Result<(), TransportError>;

    /// Settles a delivery as rejected. With `undeliverable_here` unset the
    /// broker may redeliver it.
    async fn reject(&self, message: &Message, undeliverable_here: bool)
        -> Result<(), TransportError>;
}

/// A sender link.
#[async_trait]
pub trait LiveProducer: LiveLink {
    /// Sends one message. `destination` is only set on anonymous links.
    async fn send(
        &self,
        destination: Option<&Destination>,
        message: &Message,
        transaction: Option<&Transaction>,
    ) -> Result<(), TransportError>;
}
