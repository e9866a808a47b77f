//! Address model values passed through to the broker.
//!
//! None of these types carry behavior of their own: the recovery core keeps
//! them so it can ask a fresh connection for an identical link after a
//! failure.

use std::fmt;

/// How an address distributes messages to its queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingType {
    /// Point-to-point: each message is consumed once from a single queue.
    Anycast,
    /// Publish-subscribe: every bound queue receives its own copy.
    Multicast,
}

impl fmt::Display for RoutingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingType::Anycast => f.write_str("anycast"),
            RoutingType::Multicast => f.write_str("multicast"),
        }
    }
}

/// Everything needed to (re)attach a consumer.
///
/// Immutable once the consumer exists; recovery reattaches with exactly
/// these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub(crate) address: String,
    pub(crate) routing_type: RoutingType,
    pub(crate) queue: Option<String>,
    pub(crate) durable: bool,
    pub(crate) shared: bool,
    pub(crate) filter: Option<String>,
    pub(crate) credit: u32,
}

impl ConsumerConfig {
    /// Starts a builder for a consumer on `address`.
    pub fn builder(address: impl Into<String>, routing_type: RoutingType) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new(address, routing_type)
    }

    /// Shorthand for a consumer with default queue settings.
    pub fn new(address: impl Into<String>, routing_type: RoutingType) -> Self {
        Self::builder(address, routing_type).build()
    }

    /// The address the consumer reads from.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The routing type of the queue.
    pub fn routing_type(&self) -> RoutingType {
        self.routing_type
    }

    /// Explicit queue name, if one was requested.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Whether the queue outlives the consumer.
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Whether several consumers may attach to the queue at once.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Optional broker-side message filter.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Credit window (prefetch) granted to the broker.
    pub fn credit(&self) -> u32 {
        self.credit
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Creates a builder with broker defaults.
    ///
    /// Defaults:
    /// - queue: none (anycast attaches to the queue named after the address,
    ///   multicast gets a private subscription queue)
    /// - durable: `false`
    /// - shared: `false`
    /// - credit: 200
    pub fn new(address: impl Into<String>, routing_type: RoutingType) -> Self {
        Self {
            config: ConsumerConfig {
                address: address.into(),
                routing_type,
                queue: None,
                durable: false,
                shared: false,
                filter: None,
                credit: 200,
            },
        }
    }

    /// Attaches to a named queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = Some(queue.into());
        self
    }

    /// Keeps the queue after the consumer detaches.
    pub fn durable(mut self, durable: bool) -> Self {
        self.config.durable = durable;
        self
    }

    /// Lets other consumers attach to the same queue.
    pub fn shared(mut self, shared: bool) -> Self {
        self.config.shared = shared;
        self
    }

    /// Sets a broker-side filter expression.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = Some(filter.into());
        self
    }

    /// Sets the credit window.
    pub fn credit(mut self, credit: u32) -> Self {
        self.config.credit = credit;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

/// A per-message destination for anonymous producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target address.
    pub address: String,
    /// Routing type to apply, or the address default.
    pub routing_type: Option<RoutingType>,
}

impl Destination {
    /// Creates a destination.
    pub fn new(address: impl Into<String>, routing_type: Option<RoutingType>) -> Self {
        Self {
            address: address.into(),
            routing_type,
        }
    }
}

/// What a producer link is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerTarget {
    /// Bound to one address; every send goes there.
    Address(Destination),
    /// Unbound; each send names its own destination.
    Anonymous,
}

impl ProducerTarget {
    /// Convenience constructor for an address-bound target.
    pub fn address(address: impl Into<String>, routing_type: Option<RoutingType>) -> Self {
        ProducerTarget::Address(Destination::new(address, routing_type))
    }

    /// Returns true for anonymous producers.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, ProducerTarget::Anonymous)
    }
}

/// A broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// `amqp` or `amqps`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl Endpoint {
    /// A plain `amqp://` endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "amqp".to_string(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
