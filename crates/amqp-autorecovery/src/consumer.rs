//! Consumers that reattach after link or connection loss.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::address::ConsumerConfig;
use crate::error::{RecoveryError, Result, TransportError};
use crate::message::{Message, Transaction};
use crate::resource::{Recoverable, ResourceCore, ResourceId, ResourceKind, ResourceOwner};
use crate::state::ResourceState;
use crate::transport::{LiveConnection, LiveConsumer};

/// A consumer handle that survives link and connection failures.
///
/// A pending [`receive`](Self::receive) rides through recovery: the caller
/// gets the next message once the consumer is reattached, and only sees an
/// error when the consumer is closed for good. Settlement is not retried,
/// since a delivery received before a recovery cycle cannot be settled on
/// the link that replaced it.
///
/// Cloning shares the same consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerResource>,
}

pub(crate) struct ConsumerResource {
    core: ResourceCore<dyn LiveConsumer>,
    config: ConsumerConfig,
}

impl Consumer {
    pub(crate) fn new(
        link: Arc<dyn LiveConsumer>,
        config: ConsumerConfig,
        owner: ResourceOwner,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerResource {
                core: ResourceCore::new(ResourceKind::Consumer, link, owner),
                config,
            }),
        }
    }

    pub(crate) fn resource(&self) -> Arc<dyn Recoverable> {
        Arc::clone(&self.inner) as Arc<dyn Recoverable>
    }

    /// Identity of this consumer.
    pub fn id(&self) -> ResourceId {
        self.inner.core.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResourceState {
        self.inner.core.state()
    }

    /// The configuration the consumer (re)attaches with.
    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Waits for the next message.
    ///
    /// Link failures suspend the consumer and trigger recovery; the call
    /// then waits for the rebuilt link and keeps receiving. From the second
    /// recovery cycle within one call on, the call backs off using the
    /// connection's recovery policy before trying again.
    ///
    /// # Errors
    ///
    /// - [`RecoveryError::Cancelled`] when `cancel` fires first.
    /// - [`RecoveryError::ConsumerClosed`] once the consumer is terminated.
    /// - [`RecoveryError::Disposed`] after [`dispose`](Self::dispose).
    /// - [`RecoveryError::RecoveryCyclesExceeded`] when the call spans more
    ///   recovery cycles than the connection allows.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<Message> {
        let core = &self.inner.core;
        let mut cycles = 0u32;

        loop {
            let (link, generation) = core.acquire(cancel).await?;

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                received = link.receive() => received,
            };

            let error = match received {
                Ok(message) => return Ok(message.stamp(core.id(), generation)),
                Err(error) if error.is_link_closed() => error,
                Err(error) => return Err(error.into()),
            };

            // The consumer may have been closed while the receive was failing.
            core.check()?;

            // Even when this call gives up below, the link still needs rebuilding.
            core.request_recovery(generation);

            cycles += 1;
            if let Some(max) = core.config().max_receive_recoveries() {
                if cycles > max {
                    return Err(RecoveryError::RecoveryCyclesExceeded {
                        cycles,
                        source: error,
                    });
                }
            }

            if cycles > 1 {
                self.backoff(cycles, cancel).await?;
            }
        }
    }

    async fn backoff(&self, cycles: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self
            .inner
            .core
            .config()
            .policy()
            .delay_for_attempt(cycles.saturating_sub(2) as usize);

        if let Some(delay) = delay {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                connection = %self.inner.core.config().name(),
                resource = %self.id(),
                cycles,
                ?delay,
                "receive spanning repeated recoveries, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    /// Settles `message` as accepted.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::StaleDelivery`] if the consumer was recovered after
    /// the message was received, and [`RecoveryError::ForeignDelivery`] if
    /// another consumer received it.
    pub async fn accept(&self, message: &Message, transaction: Option<&Transaction>) -> Result<()> {
        let (link, generation) = self.settlement_link(message)?;
        link.accept(message, transaction)
            .await
            .map_err(|error| self.settlement_error(error, generation))
    }

    /// Settles `message` as rejected.
    ///
    /// With `undeliverable_here` unset the broker may redeliver the message,
    /// to this consumer or another one.
    pub async fn reject(&self, message: &Message, undeliverable_here: bool) -> Result<()> {
        let (link, generation) = self.settlement_link(message)?;
        link.reject(message, undeliverable_here)
            .await
            .map_err(|error| self.settlement_error(error, generation))
    }

    fn settlement_link(&self, message: &Message) -> Result<(Arc<dyn LiveConsumer>, u64)> {
        let core = &self.inner.core;
        core.check()?;

        let receipt = message.receipt().ok_or(RecoveryError::ForeignDelivery)?;
        if receipt.consumer != core.id() {
            return Err(RecoveryError::ForeignDelivery);
        }

        match core.current() {
            (Some(link), generation) if generation == receipt.generation => Ok((link, generation)),
            _ => Err(RecoveryError::StaleDelivery),
        }
    }

    fn settlement_error(&self, error: TransportError, generation: u64) -> RecoveryError {
        if error.is_link_closed() {
            self.inner.core.request_recovery(generation);
            return match self.inner.core.check() {
                Err(closed) => closed,
                Ok(()) => RecoveryError::StaleDelivery,
            };
        }
        error.into()
    }

    /// Detaches the consumer and removes it from its connection.
    ///
    /// Pending and later calls fail with [`RecoveryError::Disposed`].
    pub async fn dispose(&self) -> Result<()> {
        self.inner.core.dispose().await
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("core", &self.inner.core)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[async_trait]
impl Recoverable for ConsumerResource {
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
            .rebuild(|| connection.create_consumer(&self.config))
            .await
    }

    async fn terminate(&self, cause: Option<TransportError>) {
        self.core.terminate(cause).await;
    }
}
