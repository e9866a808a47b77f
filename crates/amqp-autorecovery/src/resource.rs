//! The recoverable-resource contract and the state every handle shares.
//!
//! Consumers and producers differ only in how they (re)create their link.
//! Everything else lives in [`ResourceCore`]: the gate callers park on,
//! the lifecycle state, the termination cause, and the current link
//! together with its generation. The generation increments every time a
//! fresh link is attached, which is how late failure reports from a
//! replaced link are told apart from live ones.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use amqp_autorecovery_core::SuspensionGate;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::config::RecoveryConfig;
use crate::error::{RecoveryError, TransportError};
use crate::events::RecoveryEvent;
use crate::registry::ResourceRegistry;
use crate::state::ResourceState;
use crate::transport::{LiveConnection, LiveLink};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a consumer or producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn next() -> Self {
        ResourceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource-{}", self.0)
    }
}

/// What sort of handle a resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A [`Consumer`](crate::Consumer).
    Consumer,
    /// An address-bound [`Producer`](crate::Producer).
    Producer,
    /// An [`AnonymousProducer`](crate::AnonymousProducer).
    AnonymousProducer,
    /// The [`Connection`](crate::Connection) itself.
    Connection,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Consumer => f.write_str("consumer"),
            ResourceKind::Producer => f.write_str("producer"),
            ResourceKind::AnonymousProducer => f.write_str("anonymous producer"),
            ResourceKind::Connection => f.write_str("connection"),
        }
    }
}

/// A handle the orchestrator can suspend, rebuild, resume and terminate.
///
/// `recover` replaces the link wholesale. It does not resume the
/// resource; the orchestrator resumes only after the whole sweep succeeded
/// for it.
#[async_trait]
pub trait Recoverable: Send + Sync {
    /// Identity used by the registry.
    fn id(&self) -> ResourceId;

    /// Which kind of handle this is.
    fn kind(&self) -> ResourceKind;

    /// Current lifecycle state.
    fn state(&self) -> ResourceState;

    /// Generation of the current link.
    fn generation(&self) -> u64;

    /// Parks new callers. Returns true on an Active → Suspended transition.
    fn suspend(&self) -> bool;

    /// Releases parked callers. Returns true on a Suspended → Active transition.
    fn resume(&self) -> bool;

    /// Attaches a fresh link on `connection`.
    async fn recover(&self, connection: &Arc<dyn LiveConnection>) -> Result<(), TransportError>;

    /// Permanently closes the resource, recording `cause`.
    async fn terminate(&self, cause: Option<TransportError>);
}

/// Sent to the orchestrator when a link fails under a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecoveryRequest {
    pub(crate) id: ResourceId,
    pub(crate) generation: u64,
}

/// The resource's way back to the connection that owns it.
#[derive(Clone)]
pub(crate) struct ResourceOwner {
    pub(crate) config: RecoveryConfig,
    pub(crate) signals: mpsc::UnboundedSender<RecoveryRequest>,
    pub(crate) registry: Weak<ResourceRegistry>,
}

impl ResourceOwner {
    fn request_recovery(&self, request: RecoveryRequest) {
        // A closed channel means the orchestrator is gone and will terminate
        // every resource on its way out.
        let _ = self.signals.send(request);
    }

    fn unregister(&self, id: ResourceId) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(id);
        }
    }
}

struct Lifecycle<L: ?Sized> {
    state: ResourceState,
    cause: Option<TransportError>,
    generation: u64,
    link: Option<Arc<L>>,
}

/// State shared by every recoverable handle, generic over its link type.
///
/// Dropping the core unregisters it and detaches its link in the
/// background.
pub(crate) struct ResourceCore<L: LiveLink + ?Sized + 'static> {
    id: ResourceId,
    kind: ResourceKind,
    gate: SuspensionGate,
    lifecycle: Mutex<Lifecycle<L>>,
    owner: ResourceOwner,
}

impl<L> ResourceCore<L>
where
    L: LiveLink + ?Sized + 'static,
{
    pub(crate) fn new(kind: ResourceKind, link: Arc<L>, owner: ResourceOwner) -> Self {
        Self {
            id: ResourceId::next(),
            kind,
            gate: SuspensionGate::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ResourceState::Active,
                cause: None,
                generation: 0,
                link: Some(link),
            }),
            owner,
        }
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub(crate) fn state(&self) -> ResourceState {
        self.lifecycle.lock().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lifecycle.lock().generation
    }

    pub(crate) fn config(&self) -> &RecoveryConfig {
        &self.owner.config
    }

    /// Fails with the terminal error if the resource is closed.
    pub(crate) fn check(&self) -> Result<(), RecoveryError> {
        let lifecycle = self.lifecycle.lock();
        self.terminal_error(&lifecycle).map_or(Ok(()), Err)
    }

    fn terminal_error(&self, lifecycle: &Lifecycle<L>) -> Option<RecoveryError> {
        match lifecycle.state {
            ResourceState::Terminated => {
                Some(RecoveryError::closed(self.kind, lifecycle.cause.clone()))
            }
            ResourceState::Disposed => Some(RecoveryError::Disposed {
                resource: self.kind,
            }),
            ResourceState::Active | ResourceState::Suspended => None,
        }
    }

    /// The attached link, if any, and the current generation. Never waits.
    pub(crate) fn current(&self) -> (Option<Arc<L>>, u64) {
        let lifecycle = self.lifecycle.lock();
        (lifecycle.link.clone(), lifecycle.generation)
    }

    /// Waits until the resource is usable and returns its current link.
    ///
    /// Terminal states fail immediately, without touching the gate.
    pub(crate) async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<L>, u64), RecoveryError> {
        loop {
            {
                let lifecycle = self.lifecycle.lock();
                if let Some(error) = self.terminal_error(&lifecycle) {
                    return Err(error);
                }
                if lifecycle.state == ResourceState::Active {
                    if let Some(link) = &lifecycle.link {
                        return Ok((Arc::clone(link), lifecycle.generation));
                    }
                }
            }
            self.gate
                .wait_cancellable(cancel)
                .await
                .map_err(|_| RecoveryError::Cancelled)?;
        }
    }

    /// Suspends the resource because the link of `generation` failed, and
    /// asks the owner for a rebuild.
    ///
    /// Reports from a link that has already been replaced, or arriving while
    /// a rebuild is pending, are ignored.
    pub(crate) fn request_recovery(&self, generation: u64) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.generation != generation || lifecycle.state != ResourceState::Active {
                return false;
            }
            lifecycle.state = ResourceState::Suspended;
            self.gate.close();
        }
        self.on_suspended();
        self.owner.request_recovery(RecoveryRequest {
            id: self.id,
            generation,
        });
        true
    }

    pub(crate) fn suspend(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ResourceState::Active {
                return false;
            }
            lifecycle.state = ResourceState::Suspended;
            self.gate.close();
        }
        self.on_suspended();
        true
    }

    pub(crate) fn resume(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ResourceState::Suspended || lifecycle.link.is_none() {
                return false;
            }
            lifecycle.state = ResourceState::Active;
            self.gate.open();
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(
            connection = %self.owner.config.name,
            resource = %self.id,
            kind = %self.kind,
            "resource resumed"
        );

        self.emit(|connection, timestamp| RecoveryEvent::ResourceResumed {
            connection,
            timestamp,
            resource: self.id,
            kind: self.kind,
        });
        true
    }

    /// Swaps in a link produced by `create`.
    ///
    /// The old link is detached first and its close errors are dropped. A
    /// resource that reached a terminal state in the meantime keeps that
    /// state and the new link is closed again.
    pub(crate) async fn rebuild<F, Fut>(&self, create: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<L>, TransportError>>,
    {
        let (old, suspended) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_final() {
                return Ok(());
            }
            let suspended = lifecycle.state == ResourceState::Active;
            if suspended {
                lifecycle.state = ResourceState::Suspended;
                self.gate.close();
            }
            (lifecycle.link.take(), suspended)
        };
        if suspended {
            self.on_suspended();
        }
        if let Some(old) = old {
            close_quietly(old.as_ref()).await;
        }

        let link = create().await?;

        let (orphan, generation) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_final() {
                (Some(link), lifecycle.generation)
            } else {
                lifecycle.generation += 1;
                lifecycle.link = Some(link);
                (None, lifecycle.generation)
            }
        };
        if let Some(orphan) = orphan {
            close_quietly(orphan.as_ref()).await;
            return Ok(());
        }

        self.emit(|connection, timestamp| RecoveryEvent::ResourceRecovered {
            connection,
            timestamp,
            resource: self.id,
            kind: self.kind,
            generation,
        });
        Ok(())
    }

    pub(crate) async fn terminate(&self, cause: Option<TransportError>) {
        let link = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state.is_final() {
                return;
            }
            lifecycle.state = ResourceState::Terminated;
            lifecycle.cause = cause.clone();
            self.gate.open();
            lifecycle.link.take()
        };
        if let Some(link) = link {
            close_quietly(link.as_ref()).await;
        }

        #[cfg(feature = "tracing")]
        {
            let connection = &self.owner.config.name;
            match &cause {
                Some(cause) => tracing::warn!(
                    connection = %connection,
                    resource = %self.id,
                    kind = %self.kind,
                    error = %cause,
                    "resource terminated"
                ),
                None => tracing::debug!(
                    connection = %connection,
                    resource = %self.id,
                    kind = %self.kind,
                    "resource closed"
                ),
            }
        }

        #[cfg(feature = "metrics")]
        counter!(
            "amqp_recovery_resources_terminated_total",
            "connection" => self.owner.config.name.clone(),
            "kind" => self.kind.to_string(),
            "clean" => if cause.is_none() { "true" } else { "false" }
        )
        .increment(1);

        self.emit(|connection, timestamp| RecoveryEvent::ResourceTerminated {
            connection,
            timestamp,
            resource: self.id,
            kind: self.kind,
            clean: cause.is_none(),
        });
    }

    /// Application-initiated shutdown. Idempotent.
    pub(crate) async fn dispose(&self) -> Result<(), RecoveryError> {
        let link = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ResourceState::Disposed {
                return Ok(());
            }
            lifecycle.state = ResourceState::Disposed;
            self.gate.open();
            lifecycle.link.take()
        };
        self.owner.unregister(self.id);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            connection = %self.owner.config.name,
            resource = %self.id,
            kind = %self.kind,
            "resource disposed"
        );

        match link {
            Some(link) => match link.close().await {
                Err(error) if !error.is_link_closed() => Err(error.into()),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn on_suspended(&self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            connection = %self.owner.config.name,
            resource = %self.id,
            kind = %self.kind,
            "resource suspended"
        );

        #[cfg(feature = "metrics")]
        counter!(
            "amqp_recovery_resources_suspended_total",
            "connection" => self.owner.config.name.clone(),
            "kind" => self.kind.to_string()
        )
        .increment(1);

        self.emit(|connection, timestamp| RecoveryEvent::ResourceSuspended {
            connection,
            timestamp,
            resource: self.id,
            kind: self.kind,
        });
    }

    fn emit<F>(&self, event: F)
    where
        F: FnOnce(String, Instant) -> RecoveryEvent,
    {
        let config = &self.owner.config;
        if !config.event_listeners.is_empty() {
            config.emit(event(config.name.clone(), Instant::now()));
        }
    }
}

impl<L: LiveLink + ?Sized + 'static> Drop for ResourceCore<L> {
    fn drop(&mut self) {
        self.owner.unregister(self.id);
        let Some(link) = self.lifecycle.get_mut().link.take() else {
            return;
        };
        // Outside a runtime the link is released with its connection.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { close_quietly(link.as_ref()).await });
        }
    }
}

impl<L: LiveLink + ?Sized + 'static> fmt::Debug for ResourceCore<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("ResourceCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &lifecycle.state)
            .field("generation", &lifecycle.generation)
            .field("cause", &lifecycle.cause)
            .finish()
    }
}

async fn close_quietly<L: LiveLink + ?Sized>(link: &L) {
    if let Err(_error) = link.close().await {
        #[cfg(feature = "tracing")]
        tracing::trace!(error = %_error, "ignoring close failure on discarded link");
    }
}
