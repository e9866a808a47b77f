//! The application-facing connection handle.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use amqp_autorecovery_core::SuspensionGate;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::address::{ConsumerConfig, Destination, Endpoint, ProducerTarget, RoutingType};
use crate::config::RecoveryConfig;
use crate::consumer::Consumer;
use crate::error::{RecoveryError, Result, TransportError};
use crate::events::RecoveryEvent;
use crate::orchestrator::{self, Outcome};
use crate::producer::{AnonymousProducer, Producer};
use crate::registry::ResourceRegistry;
use crate::resource::{Recoverable, RecoveryRequest, ResourceKind, ResourceOwner};
use crate::state::{ConnectionState, RecoveryState};
use crate::transport::{LiveConnection, Transport};

/// Whether the connection may still be used, and if not, why.
#[derive(Debug, Clone)]
pub(crate) enum Availability {
    Open,
    Disposed,
    Terminated(Option<TransportError>),
}

/// Everything the handle and the orchestrator task share.
pub(crate) struct Shared {
    pub(crate) config: RecoveryConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) next_endpoint: AtomicUsize,
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) state: RecoveryState,
    /// Open while connected; creators park on it during a reconnect.
    pub(crate) gate: SuspensionGate,
    /// Opened once every resource has been terminated.
    pub(crate) finished: SuspensionGate,
    pub(crate) current: Mutex<Option<Arc<dyn LiveConnection>>>,
    /// Bumped whenever `current` is taken or replaced.
    pub(crate) replaced: watch::Sender<u64>,
    pub(crate) availability: Mutex<Availability>,
    pub(crate) cancel: CancellationToken,
    pub(crate) signals: mpsc::UnboundedSender<RecoveryRequest>,
}

impl Shared {
    pub(crate) fn check(&self) -> Result<()> {
        match &*self.availability.lock() {
            Availability::Open => Ok(()),
            Availability::Disposed => Err(RecoveryError::Disposed {
                resource: ResourceKind::Connection,
            }),
            Availability::Terminated(cause) => Err(RecoveryError::ConnectionClosed {
                cause: cause.clone(),
            }),
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<dyn LiveConnection>> {
        self.current.lock().clone()
    }

    /// Swaps the physical connection and wakes creators waiting on the old one.
    pub(crate) fn set_current(
        &self,
        live: Option<Arc<dyn LiveConnection>>,
    ) -> Option<Arc<dyn LiveConnection>> {
        let previous = std::mem::replace(&mut *self.current.lock(), live);
        self.replaced.send_modify(|epoch| *epoch += 1);
        previous
    }

    /// Moves to `to` and reports the transition, if there was one.
    pub(crate) fn transition(&self, to: ConnectionState) {
        let from = self.state.transition(to);
        if from == to {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            connection = %self.config.name,
            from = ?from,
            to = ?to,
            "connection state transition"
        );

        self.emit(|connection, timestamp| RecoveryEvent::StateTransition {
            connection,
            timestamp,
            from,
            to,
        });
    }

    pub(crate) fn emit<F>(&self, event: F)
    where
        F: FnOnce(String, Instant) -> RecoveryEvent,
    {
        if !self.config.event_listeners.is_empty() {
            self.config
                .emit(event(self.config.name.clone(), Instant::now()));
        }
    }

    fn owner(self: &Arc<Self>) -> ResourceOwner {
        ResourceOwner {
            config: self.config.clone(),
            signals: self.signals.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }
}

/// A self-healing connection to an AMQP broker.
///
/// Owns one physical connection at a time, plus every consumer and producer
/// created through it. When the physical connection drops, a background
/// task suspends all of them, reconnects according to the
/// [`RecoveryPolicy`](crate::RecoveryPolicy), reattaches each one with its
/// original configuration and resumes it. When the retry budget runs out,
/// every resource is terminated with the last failure as its cause.
///
/// Dropping the handle has the same effect as [`dispose`](Self::dispose),
/// minus the wait.
///
/// # Examples
///
/// Requires the `test-util` feature for the in-memory broker.
///
/// ```rust,ignore
/// use amqp_autorecovery::testing::MemoryBroker;
/// use amqp_autorecovery::{Connection, ConsumerConfig, Message, RecoveryConfig, RoutingType};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> amqp_autorecovery::Result<()> {
/// let broker = MemoryBroker::new();
/// let connection = Connection::connect(
///     broker.transport(),
///     [broker.endpoint()],
///     RecoveryConfig::builder().name("orders").build(),
/// )
/// .await?;
///
/// let consumer = connection
///     .create_consumer(ConsumerConfig::new("orders", RoutingType::Anycast))
///     .await?;
/// let producer = connection.create_producer("orders", Some(RoutingType::Anycast)).await?;
///
/// let cancel = CancellationToken::new();
/// producer.send(&Message::from("order-1"), None, &cancel).await?;
/// let message = consumer.receive(&cancel).await?;
/// consumer.accept(&message, None).await?;
///
/// connection.dispose().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects to the first reachable endpoint and starts watching the
    /// connection.
    ///
    /// Endpoints are tried round-robin, with the same policy and budget
    /// that later reconnects use.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::ConnectionClosed`] carrying the last connect failure
    /// when the budget runs out.
    pub async fn connect<T, I>(transport: T, endpoints: I, config: RecoveryConfig) -> Result<Self>
    where
        T: Transport,
        I: IntoIterator<Item = Endpoint>,
    {
        let endpoints: Vec<Endpoint> = endpoints.into_iter().collect();
        if endpoints.is_empty() {
            return Err(RecoveryError::ConnectionClosed {
                cause: Some(TransportError::ConnectFailed(
                    "no endpoints configured".to_string(),
                )),
            });
        }

        let (signals, requests) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Arc::new(ResourceRegistry::new(config.name.clone())),
            config,
            transport: Arc::new(transport),
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            state: RecoveryState::new(),
            gate: SuspensionGate::closed(),
            finished: SuspensionGate::closed(),
            current: Mutex::new(None),
            replaced: watch::channel(0).0,
            availability: Mutex::new(Availability::Open),
            cancel: CancellationToken::new(),
            signals,
        });

        let live = match orchestrator::establish(&shared, Instant::now()).await {
            Ok(live) => live,
            Err(Outcome::Exhausted(cause)) => {
                return Err(RecoveryError::ConnectionClosed { cause: Some(cause) })
            }
            Err(Outcome::Cancelled) => return Err(RecoveryError::Cancelled),
        };
        shared.set_current(Some(live));
        shared.state.reset_attempts();
        shared.transition(ConnectionState::Connected);
        shared.gate.open();

        tokio::spawn(orchestrator::run(Arc::clone(&shared), requests));

        Ok(Self { shared })
    }

    /// Name from the [`RecoveryConfig`].
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.state()
    }

    /// Shared view of state, attempt and reconnect counters.
    pub fn recovery_state(&self) -> RecoveryState {
        self.shared.state.clone()
    }

    /// Number of live (not disposed) consumers and producers.
    pub fn resource_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Attaches a consumer.
    ///
    /// Waits while a reconnect is in progress.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::Create`] if the broker refuses the link; this is not
    /// retried.
    pub async fn create_consumer(&self, config: ConsumerConfig) -> Result<Consumer> {
        let link = loop {
            let live = self.live().await?;
            match live.create_consumer(&config).await {
                Ok(link) => break link,
                Err(error) => {
                    self.creation_failed(&live, ResourceKind::Consumer, error)
                        .await?
                }
            }
        };
        let consumer = Consumer::new(link, config, self.shared.owner());
        self.register(consumer.resource()).await?;
        Ok(consumer)
    }

    /// Attaches a producer bound to `address`.
    pub async fn create_producer(
        &self,
        address: impl Into<String>,
        routing_type: Option<RoutingType>,
    ) -> Result<Producer> {
        let destination = Destination::new(address, routing_type);
        let target = ProducerTarget::Address(destination.clone());
        let link = loop {
            let live = self.live().await?;
            match live.create_producer(&target).await {
                Ok(link) => break link,
                Err(error) => {
                    self.creation_failed(&live, ResourceKind::Producer, error)
                        .await?
                }
            }
        };
        let producer = Producer::new(link, destination, self.shared.owner());
        self.register(producer.resource()).await?;
        Ok(producer)
    }

    /// Attaches a producer that names a destination per message.
    pub async fn create_anonymous_producer(&self) -> Result<AnonymousProducer> {
        let link = loop {
            let live = self.live().await?;
            match live.create_producer(&ProducerTarget::Anonymous).await {
                Ok(link) => break link,
                Err(error) => {
                    self.creation_failed(&live, ResourceKind::AnonymousProducer, error)
                        .await?
                }
            }
        };
        let producer = AnonymousProducer::new(link, self.shared.owner());
        self.register(producer.resource()).await?;
        Ok(producer)
    }

    /// Closes the connection for good.
    ///
    /// Aborts any reconnect in progress and returns once every consumer and
    /// producer has been terminated with a clean (cause-less) close.
    /// Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        self.mark_disposed();
        self.shared.finished.wait().await;
        Ok(())
    }

    fn mark_disposed(&self) {
        {
            let mut availability = self.shared.availability.lock();
            if matches!(*availability, Availability::Open) {
                *availability = Availability::Disposed;
            }
        }
        self.shared.cancel.cancel();
    }

    async fn live(&self) -> Result<Arc<dyn LiveConnection>> {
        loop {
            self.shared.check()?;
            self.shared.gate.wait().await;
            self.shared.check()?;
            if let Some(live) = self.shared.current() {
                return Ok(live);
            }
            tokio::task::yield_now().await;
        }
    }

    /// A creation that failed because `live` went down is retried once the
    /// orchestrator has replaced it. Any other failure, including a
    /// connection-class error from a connection that is still up, is the
    /// broker refusing the link.
    async fn creation_failed(
        &self,
        live: &Arc<dyn LiveConnection>,
        resource: ResourceKind,
        error: TransportError,
    ) -> Result<()> {
        if !(error.is_connection_failure() && live.is_closed()) {
            return Err(RecoveryError::Create {
                resource,
                source: error,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            connection = %self.shared.config.name,
            kind = %resource,
            error = %error,
            "connection lost while creating, waiting for reconnect"
        );

        let mut replaced = self.shared.replaced.subscribe();
        loop {
            self.shared.check()?;
            match self.shared.current() {
                Some(current) if same_connection(&current, live) => {}
                _ => return Ok(()),
            }
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {}
                _ = replaced.changed() => {}
            }
        }
    }

    async fn register(&self, resource: Arc<dyn Recoverable>) -> Result<()> {
        self.shared.registry.insert(Arc::clone(&resource));

        // Lost a race with disposal or exhaustion: the final sweep may have
        // missed this resource.
        if let Err(error) = self.shared.check() {
            let cause = match &*self.shared.availability.lock() {
                Availability::Terminated(cause) => cause.clone(),
                _ => None,
            };
            resource.terminate(cause).await;
            return Err(error);
        }
        Ok(())
    }
}

fn same_connection(a: &Arc<dyn LiveConnection>, b: &Arc<dyn LiveConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.mark_disposed();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.config.name)
            .field("state", &self.shared.state)
            .field("endpoints", &self.shared.endpoints)
            .field("registry", &self.shared.registry)
            .finish()
    }
}
