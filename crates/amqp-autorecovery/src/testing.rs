//! An in-memory broker implementing the transport traits, with fault
//! injection for exercising recovery.
//!
//! Address model:
//!
//! - An anycast consumer without a queue name attaches to the durable queue
//!   named after the address, creating it on first use. Competing consumers
//!   share it.
//! - A multicast consumer without a queue name gets a private,
//!   non-durable subscription queue that is deleted when it detaches.
//! - Named queues must be declared with [`MemoryBroker::declare_queue`].
//!   A named multicast queue takes a second consumer only when both the
//!   queue and the consumer are shared.
//! - Non-durable queues are lost when the broker stops.
//! - Deliveries that were not settled when their link closed go back to the
//!   front of their queue.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::address::{ConsumerConfig, Destination, Endpoint, ProducerTarget, RoutingType};
use crate::error::TransportError;
use crate::message::{Message, Transaction};
use crate::transport::{LiveConnection, LiveConsumer, LiveLink, LiveProducer, Transport};

/// A broker living in process memory.
///
/// Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    endpoint: Endpoint,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    running: bool,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, CancellationToken>,
    consumers: HashMap<u64, ConsumerRecord>,
    producers: HashMap<u64, ProducerRecord>,
    next_id: u64,
    next_tag: u64,
    connect_attempts: u32,
    failing_connects: u32,
    denied_queues: HashSet<String>,
    stalled_sends: bool,
    stalled_links: bool,
    timed_out_links: u32,
    accepted: Vec<Message>,
    rejected: Vec<Message>,
}

struct Queue {
    address: String,
    routing_type: RoutingType,
    durable: bool,
    shared: bool,
    auto_delete: bool,
    messages: VecDeque<Message>,
    consumers: usize,
    ready: Arc<Notify>,
}

impl Queue {
    fn new(address: &str, routing_type: RoutingType, durable: bool, shared: bool) -> Self {
        Self {
            address: address.to_string(),
            routing_type,
            durable,
            shared,
            auto_delete: false,
            messages: VecDeque::new(),
            consumers: 0,
            ready: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        self.ready.notify_one();
    }
}

struct ConsumerRecord {
    connection: u64,
    queue: String,
    token: CancellationToken,
    unacked: BTreeMap<u64, Message>,
}

struct ProducerRecord {
    connection: u64,
    address: Option<String>,
    token: CancellationToken,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn detach_consumer(&mut self, id: u64) {
        let Some(record) = self.consumers.remove(&id) else {
            return;
        };
        record.token.cancel();

        let Some(queue) = self.queues.get_mut(&record.queue) else {
            return;
        };
        queue.consumers = queue.consumers.saturating_sub(1);
        let redelivered = !record.unacked.is_empty();
        for (_, message) in record.unacked.into_iter().rev() {
            queue.messages.push_front(message);
        }
        if redelivered {
            queue.ready.notify_one();
        }
        if queue.auto_delete && queue.consumers == 0 {
            self.queues.remove(&record.queue);
        }
    }

    fn detach_connection(&mut self, connection: u64) {
        if let Some(token) = self.connections.remove(&connection) {
            token.cancel();
        }
        let consumers: Vec<u64> = self
            .consumers
            .iter()
            .filter(|(_, record)| record.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in consumers {
            self.detach_consumer(id);
        }
        self.producers.retain(|_, record| {
            let keep = record.connection != connection;
            if !keep {
                record.token.cancel();
            }
            keep
        });
    }

    fn route(&mut self, address: &str, routing_type: Option<RoutingType>, message: &Message) {
        let mut copies = 0;
        if routing_type != Some(RoutingType::Anycast) {
            for queue in self.queues.values_mut().filter(|queue| {
                queue.address == address && queue.routing_type == RoutingType::Multicast
            }) {
                queue.push(message.clone());
                copies += 1;
            }
        }

        if routing_type == Some(RoutingType::Multicast) {
            return;
        }

        let mut anycast: Vec<&String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.address == address && queue.routing_type == RoutingType::Anycast
            })
            .map(|(name, _)| name)
            .collect();
        anycast.sort();
        let target = anycast.first().map(|name| (*name).clone());

        match target {
            Some(name) => {
                if let Some(queue) = self.queues.get_mut(&name) {
                    queue.push(message.clone());
                }
            }
            None if copies == 0 || routing_type == Some(RoutingType::Anycast) => {
                let mut queue = Queue::new(address, RoutingType::Anycast, true, true);
                queue.push(message.clone());
                self.queues.insert(address.to_string(), queue);
            }
            None => {}
        }
    }
}

impl MemoryBroker {
    /// A running broker with no queues.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                endpoint: Endpoint {
                    scheme: "memory".to_string(),
                    host: "localhost".to_string(),
                    port: 5672,
                },
                state: Mutex::new(BrokerState {
                    running: true,
                    ..Default::default()
                }),
            }),
        }
    }

    /// The transport to hand to [`Connection::connect`](crate::Connection::connect).
    pub fn transport(&self) -> MemoryBroker {
        self.clone()
    }

    /// The broker's endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Declares a named queue bound to `address`. Existing queues are kept.
    pub fn declare_queue(
        &self,
        name: &str,
        address: &str,
        routing_type: RoutingType,
        durable: bool,
        shared: bool,
    ) {
        self.inner
            .state
            .lock()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(address, routing_type, durable, shared));
    }

    /// Takes the broker down: every connection drops and non-durable queues
    /// are deleted. Connect attempts fail until [`start`](Self::start).
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            state.detach_connection(connection);
        }
        state.queues.retain(|_, queue| queue.durable);
    }

    /// Brings the broker back up.
    pub fn start(&self) {
        self.inner.state.lock().running = true;
    }

    /// Stop followed by start.
    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Whether the broker accepts connections.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Drops every connection without losing any queue, like a network blip.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            state.detach_connection(connection);
        }
    }

    /// Detaches every consumer on `queue`, leaving connections up.
    /// Returns how many links were closed.
    pub fn close_consumer_links(&self, queue: &str) -> usize {
        let mut state = self.inner.state.lock();
        let links: Vec<u64> = state
            .consumers
            .iter()
            .filter(|(_, record)| record.queue == queue)
            .map(|(id, _)| *id)
            .collect();
        for id in &links {
            state.detach_consumer(*id);
        }
        links.len()
    }

    /// Detaches every producer bound to `address`, leaving connections up.
    /// Returns how many links were closed.
    pub fn close_producer_links(&self, address: &str) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.producers.len();
        state.producers.retain(|_, record| {
            let keep = record.address.as_deref() != Some(address);
            if !keep {
                record.token.cancel();
            }
            keep
        });
        before - state.producers.len()
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.state.lock().failing_connects = count;
    }

    /// Refuses consumers on `queue` until [`allow_consumers_on`](Self::allow_consumers_on).
    pub fn deny_consumers_on(&self, queue: &str) {
        self.inner.state.lock().denied_queues.insert(queue.to_string());
    }

    /// Lifts a [`deny_consumers_on`](Self::deny_consumers_on).
    pub fn allow_consumers_on(&self, queue: &str) {
        self.inner.state.lock().denied_queues.remove(queue);
    }

    /// While set, sends never complete; they fail once their link closes.
    pub fn stall_sends(&self, stalled: bool) {
        self.inner.state.lock().stalled_sends = stalled;
    }

    /// Makes the next `count` link attaches fail with
    /// [`TransportError::Timeout`] while the connection stays up.
    pub fn time_out_next_links(&self, count: u32) {
        self.inner.state.lock().timed_out_links = count;
    }

    /// While set, link attaches never complete; they fail once their
    /// connection closes.
    pub fn stall_link_creation(&self, stalled: bool) {
        self.inner.state.lock().stalled_links = stalled;
    }

    /// Connect attempts seen so far, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().connect_attempts
    }

    /// Publishes a message as if from another client.
    pub fn enqueue(&self, address: &str, routing_type: Option<RoutingType>, message: Message) {
        self.inner
            .state
            .lock()
            .route(address, routing_type, &message);
    }

    /// Messages waiting in `queue`, or `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
    }

    /// Whether `queue` exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers)
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Accepted deliveries, oldest first.
    pub fn accepted(&self) -> Vec<Message> {
        self.inner.state.lock().accepted.clone()
    }

    /// Deliveries rejected as undeliverable, oldest first.
    pub fn rejected(&self) -> Vec<Message> {
        self.inner.state.lock().rejected.clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("endpoint", &self.inner.endpoint)
            .field("running", &state.running)
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn LiveConnection>, TransportError> {
        let mut state = self.inner.state.lock();
        state.connect_attempts += 1;

        if *endpoint != self.inner.endpoint {
            return Err(TransportError::ConnectFailed(format!(
                "no broker listening on {}",
                endpoint
            )));
        }
        if !state.running {
            return Err(TransportError::ConnectFailed(format!(
                "broker at {} is not running",
                endpoint
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::ConnectFailed(
                "connection refused".to_string(),
            ));
        }

        let id = state.next_id();
        let token = CancellationToken::new();
        state.connections.insert(id, token.clone());
        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            id,
            token,
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    id: u64,
    token: CancellationToken,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.token.is_cancelled() {
            return Err(connection_lost());
        }
        Ok(())
    }

    /// Applies the link-attach faults before a link is created.
    async fn admit_link(&self) -> Result<(), TransportError> {
        let stalled = {
            let mut state = self.broker.state.lock();
            self.ensure_open()?;
            if state.timed_out_links > 0 {
                state.timed_out_links -= 1;
                return Err(TransportError::Timeout(
                    "link attach was not answered".to_string(),
                ));
            }
            state.stalled_links
        };
        if stalled {
            self.token.cancelled().await;
            return Err(connection_lost());
        }
        Ok(())
    }
}

fn connection_lost() -> TransportError {
    TransportError::ConnectionClosed("connection to memory broker lost".to_string())
}

#[async_trait]
impl LiveConnection for MemoryConnection {
    async fn create_consumer(
        &self,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn LiveConsumer>, TransportError> {
        self.admit_link().await?;
        let mut state = self.broker.state.lock();
        self.ensure_open()?;

        let name = match config.queue() {
            Some(name) => {
                let Some(queue) = state.queues.get(name) else {
                    return Err(TransportError::Rejected {
                        reason: format!("queue {} does not exist", name),
                    });
                };
                if queue.routing_type == RoutingType::Multicast
                    && queue.consumers > 0
                    && !(queue.shared && config.shared())
                {
                    return Err(TransportError::Rejected {
                        reason: format!("queue {} already has a consumer", name),
                    });
                }
                name.to_string()
            }
            None => match config.routing_type() {
                RoutingType::Anycast => {
                    let address = config.address();
                    state
                        .queues
                        .entry(address.to_string())
                        .or_insert_with(|| {
                            Queue::new(address, RoutingType::Anycast, true, true)
                        });
                    address.to_string()
                }
                RoutingType::Multicast => {
                    let name = format!("{}.subscription-{}", config.address(), state.next_id());
                    let mut queue =
                        Queue::new(config.address(), RoutingType::Multicast, false, false);
                    queue.auto_delete = true;
                    state.queues.insert(name.clone(), queue);
                    name
                }
            },
        };

        if state.denied_queues.contains(&name) {
            return Err(TransportError::Rejected {
                reason: format!("consumers are not allowed on queue {}", name),
            });
        }

        let ready = match state.queues.get_mut(&name) {
            Some(queue) => {
                queue.consumers += 1;
                Arc::clone(&queue.ready)
            }
            None => {
                return Err(TransportError::Rejected {
                    reason: format!("queue {} does not exist", name),
                })
            }
        };

        let id = state.next_id();
        let token = self.token.child_token();
        state.consumers.insert(
            id,
            ConsumerRecord {
                connection: self.id,
                queue: name.clone(),
                token: token.clone(),
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryConsumer {
            broker: Arc::clone(&self.broker),
            id,
            queue: name,
            token,
            connection: self.token.clone(),
            ready,
        }))
    }

    async fn create_producer(
        &self,
        target: &ProducerTarget,
    ) -> Result<Arc<dyn LiveProducer>, TransportError> {
        self.admit_link().await?;
        let mut state = self.broker.state.lock();
        self.ensure_open()?;

        let id = state.next_id();
        let token = self.token.child_token();
        let address = match target {
            ProducerTarget::Address(destination) => Some(destination.address.clone()),
            ProducerTarget::Anonymous => None,
        };
        state.producers.insert(
            id,
            ProducerRecord {
                connection: self.id,
                address,
                token: token.clone(),
            },
        );

        Ok(Arc::new(MemoryProducer {
            broker: Arc::clone(&self.broker),
            id,
            target: target.clone(),
            token,
            connection: self.token.clone(),
        }))
    }

    async fn closed(&self) -> TransportError {
        self.token.cancelled().await;
        connection_lost()
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().detach_connection(self.id);
        Ok(())
    }
}

fn link_closed(connection: &CancellationToken) -> TransportError {
    if connection.is_cancelled() {
        connection_lost()
    } else {
        TransportError::LinkClosed("link detached by broker".to_string())
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerInner>,
    id: u64,
    queue: String,
    token: CancellationToken,
    connection: CancellationToken,
    ready: Arc<Notify>,
}

#[async_trait]
impl LiveLink for MemoryConsumer {
    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().detach_consumer(self.id);
        Ok(())
    }
}

#[async_trait]
impl LiveConsumer for MemoryConsumer {
    async fn receive(&self) -> Result<Message, TransportError> {
        loop {
            {
                let mut guard = self.broker.state.lock();
                let state = &mut *guard;
                if self.token.is_cancelled() {
                    return Err(link_closed(&self.connection));
                }
                let (Some(record), Some(queue)) = (
                    state.consumers.get_mut(&self.id),
                    state.queues.get_mut(&self.queue),
                ) else {
                    return Err(link_closed(&self.connection));
                };

                if let Some(message) = queue.messages.pop_front() {
                    if !queue.messages.is_empty() {
                        queue.ready.notify_one();
                    }
                    state.next_tag += 1;
                    let message = message.with_delivery_tag(state.next_tag);
                    record.unacked.insert(state.next_tag, message.clone());
                    return Ok(message);
                }
            }

            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.token.cancelled() => {}
            }
        }
    }

    async fn accept(
        &self,
        message: &Message,
        _transaction: Option<&Transaction>,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let settled = settle(&mut state, self.id, message, &self.connection)?;
        state.accepted.push(settled);
        Ok(())
    }

    async fn reject(
        &self,
        message: &Message,
        undeliverable_here: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let settled = settle(&mut state, self.id, message, &self.connection)?;
        if undeliverable_here {
            state.rejected.push(settled);
        } else if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.messages.push_front(settled);
            queue.ready.notify_one();
        }
        Ok(())
    }
}

fn settle(
    state: &mut BrokerState,
    consumer: u64,
    message: &Message,
    connection: &CancellationToken,
) -> Result<Message, TransportError> {
    let record = state
        .consumers
        .get_mut(&consumer)
        .ok_or_else(|| link_closed(connection))?;
    let tag = message.delivery_tag().ok_or_else(|| {
        TransportError::InvalidDelivery("message has no delivery tag".to_string())
    })?;
    record.unacked.remove(&tag).ok_or_else(|| {
        TransportError::InvalidDelivery(format!("delivery {} is not outstanding", tag))
    })
}

struct MemoryProducer {
    broker: Arc<BrokerInner>,
    id: u64,
    target: ProducerTarget,
    token: CancellationToken,
    connection: CancellationToken,
}

#[async_trait]
impl LiveLink for MemoryProducer {
    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        if let Some(record) = state.producers.remove(&self.id) {
            record.token.cancel();
        }
        Ok(())
    }
}

#[async_trait]
impl LiveProducer for MemoryProducer {
    async fn send(
        &self,
        destination: Option<&Destination>,
        message: &Message,
        _transaction: Option<&Transaction>,
    ) -> Result<(), TransportError> {
        let stalled = {
            let state = self.broker.state.lock();
            if self.token.is_cancelled() || !state.producers.contains_key(&self.id) {
                return Err(link_closed(&self.connection));
            }
            state.stalled_sends
        };
        if stalled {
            self.token.cancelled().await;
            return Err(link_closed(&self.connection));
        }

        let (address, routing_type) = match (&self.target, destination) {
            (ProducerTarget::Address(bound), _) => (bound.address.as_str(), bound.routing_type),
            (ProducerTarget::Anonymous, Some(destination)) => {
                (destination.address.as_str(), destination.routing_type)
            }
            (ProducerTarget::Anonymous, None) => {
                return Err(TransportError::Other(
                    "anonymous producer needs a destination".to_string(),
                ))
            }
        };

        let mut state = self.broker.state.lock();
        if self.token.is_cancelled() {
            return Err(link_closed(&self.connection));
        }
        state.route(address, routing_type, message);
        Ok(())
    }
}
