//! Producers that reattach after link or connection loss.
//!
//! Address-bound and anonymous producers share one implementation; the
//! [`ProducerTarget`] they were created with is all that differs, both when
//! the link is first created and every time it is rebuilt.
//!
//! Unlike a receive, a send that loses its link is never replayed: the
//! broker may already have accepted the message. The call fails with the
//! retryable [`RecoveryError::SendInterrupted`] while the producer recovers
//! in the background, and the caller decides whether to send again.

use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::address::{Destination, ProducerTarget};
use crate::error::{RecoveryError, Result, TransportError};
use crate::message::{Message, Transaction};
use crate::resource::{Recoverable, ResourceCore, ResourceId, ResourceKind, ResourceOwner};
use crate::state::ResourceState;
use crate::transport::{LiveConnection, LiveProducer};

pub(crate) struct ProducerResource {
    core: ResourceCore<dyn LiveProducer>,
    target: ProducerTarget,
}

impl ProducerResource {
    fn new(link: Arc<dyn LiveProducer>, target: ProducerTarget, owner: ResourceOwner) -> Self {
        let kind = if target.is_anonymous() {
            ResourceKind::AnonymousProducer
        } else {
            ResourceKind::Producer
        };
        Self {
            core: ResourceCore::new(kind, link, owner),
            target,
        }
    }

    async fn send(
        &self,
        destination: Option<&Destination>,
        message: &Message,
        transaction: Option<&Transaction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (link, generation) = self.core.acquire(cancel).await?;

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
            sent = link.send(destination, message, transaction) => sent,
        };

        match sent {
            Ok(()) => Ok(()),
            Err(error) if error.is_link_closed() => {
                self.core.check()?;
                self.core.request_recovery(generation);

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    connection = %self.core.config().name(),
                    resource = %self.core.id(),
                    error = %error,
                    "send interrupted by link failure"
                );

                Err(RecoveryError::SendInterrupted { source: error })
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl Recoverable for ProducerResource {
    fn id(&self) -> ResourceId {
        self.core.id()
    }

    fn kind(&self) -> ResourceKind {
        self.core.kind()
    }

    fn state(&self) -> ResourceState {
        self.core.state()
    }

    fn generation(&self) -> u64 {
        self.core.generation()
    }

    fn suspend(&self) -> bool {
        self.core.suspend()
    }

    fn resume(&self) -> bool {
        self.core.resume()
    }

    async fn recover(
        &self,
        connection: &Arc<dyn LiveConnection>,
    ) -> std::result::Result<(), TransportError> {
        self.core
            .rebuild(|| connection.create_producer(&self.target))
            .await
    }

    async fn terminate(&self, cause: Option<TransportError>) {
        self.core.terminate(cause).await;
    }
}

/// A producer bound to one address.
///
/// Cloning shares the same producer.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerResource>,
}

impl Producer {
    pub(crate) fn new(
        link: Arc<dyn LiveProducer>,
        target: Destination,
        owner: ResourceOwner,
    ) -> Self {
        Self {
            inner: Arc::new(ProducerResource::new(
                link,
                ProducerTarget::Address(target),
                owner,
            )),
        }
    }

    pub(crate) fn resource(&self) -> Arc<dyn Recoverable> {
        Arc::clone(&self.inner) as Arc<dyn Recoverable>
    }

    /// Identity of this producer.
    pub fn id(&self) -> ResourceId {
        self.inner.core.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResourceState {
        self.inner.core.state()
    }

    /// The address this producer sends to.
    pub fn destination(&self) -> Option<&Destination> {
        match &self.inner.target {
            ProducerTarget::Address(destination) => Some(destination),
            ProducerTarget::Anonymous => None,
        }
    }

    /// Sends `message` to the producer's address.
    ///
    /// Waits while the producer is recovering.
    ///
    /// # Errors
    ///
    /// - [`RecoveryError::SendInterrupted`] if the link failed mid-send.
    ///   Safe to call again once the producer recovered.
    /// - [`RecoveryError::ProducerClosed`] once the producer is terminated.
    /// - [`RecoveryError::Cancelled`] when `cancel` fires first.
    pub async fn send(
        &self,
        message: &Message,
        transaction: Option<&Transaction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.send(None, message, transaction, cancel).await
    }

    /// Detaches the producer and removes it from its connection.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.core.dispose().await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("core", &self.inner.core)
            .field("target", &self.inner.target)
            .finish()
    }
}

/// Sends through the producer with a fresh cancellation token per call.
impl Service<Message> for Producer {
    type Response = ();
    type Error = RecoveryError;
    type Future = BoxFuture<'static, Result<()>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(self.inner.core.check())
    }

    fn call(&mut self, message: Message) -> Self::Future {
        let producer = self.clone();
        Box::pin(async move {
            producer
                .send(&message, None, &CancellationToken::new())
                .await
        })
    }
}

/// A producer whose messages each name their own destination.
///
/// Cloning shares the same producer.
#[derive(Clone)]
pub struct AnonymousProducer {
    inner: Arc<ProducerResource>,
}

impl AnonymousProducer {
    pub(crate) fn new(link: Arc<dyn LiveProducer>, owner: ResourceOwner) -> Self {
        Self {
            inner: Arc::new(ProducerResource::new(link, ProducerTarget::Anonymous, owner)),
        }
    }

    pub(crate) fn resource(&self) -> Arc<dyn Recoverable> {
        Arc::clone(&self.inner) as Arc<dyn Recoverable>
    }

    /// Identity of this producer.
    pub fn id(&self) -> ResourceId {
        self.inner.core.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResourceState {
        self.inner.core.state()
    }

    /// Sends `message` to `destination`. Same error contract as
    /// [`Producer::send`].
    pub async fn send(
        &self,
        destination: &Destination,
        message: &Message,
        transaction: Option<&Transaction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner
            .send(Some(destination), message, transaction, cancel)
            .await
    }

    /// Detaches the producer and removes it from its connection.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.core.dispose().await
    }
}

impl std::fmt::Debug for AnonymousProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnonymousProducer")
            .field("core", &self.inner.core)
            .finish()
    }
}
