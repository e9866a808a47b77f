//! The per-connection recovery task.
//!
//! One task per connection watches the physical connection and the recovery
//! requests raised by resources. Because a single loop consumes both, only
//! one reconnect sequence can ever run at a time; requests arriving while one
//! is in flight are drained afterwards and dropped if the resource has
//! already been rebuilt.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use metrics::counter;
use tokio::sync::mpsc;

use crate::connection::{Availability, Shared};
use crate::error::TransportError;
use crate::events::RecoveryEvent;
use crate::resource::{Recoverable, RecoveryRequest, ResourceId};
use crate::state::{ConnectionState, ResourceState};
use crate::transport::LiveConnection;

/// How a connect sequence ended without a connection.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The connection was disposed.
    Cancelled,
    /// The retry budget ran out; carries the last failure.
    Exhausted(TransportError),
}

enum Sweep {
    Done,
    ConnectionLost(TransportError),
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut requests: mpsc::UnboundedReceiver<RecoveryRequest>,
) {
    let outcome = loop {
        let Some(live) = shared.current() else {
            break Outcome::Cancelled;
        };

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(Outcome::Cancelled),
            reason = live.closed() => reconnect(&shared, reason).await,
            Some(request) = requests.recv() => {
                let mut pending = vec![request];
                while let Ok(request) = requests.try_recv() {
                    pending.push(request);
                }
                recover_links(&shared, &live, pending).await
            }
        };

        if let Err(outcome) = result {
            break outcome;
        }
    };

    finish(&shared, outcome).await;
}

/// Rebuilds individual links on a connection that is still up, escalating
/// to a full reconnect if it turns out not to be.
async fn recover_links(
    shared: &Arc<Shared>,
    live: &Arc<dyn LiveConnection>,
    requests: Vec<RecoveryRequest>,
) -> Result<(), Outcome> {
    let mut latest: HashMap<ResourceId, u64> = HashMap::new();
    for request in requests {
        let generation = latest.entry(request.id).or_insert(request.generation);
        *generation = (*generation).max(request.generation);
    }

    let pending: Vec<Arc<dyn Recoverable>> = latest
        .into_iter()
        .filter_map(|(id, generation)| {
            shared.registry.get(id).filter(|resource| {
                resource.generation() == generation
                    && resource.state() == ResourceState::Suspended
            })
        })
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    if live.is_closed() {
        let reason = live.closed().await;
        return reconnect(shared, reason).await;
    }

    shared.transition(ConnectionState::Reconnecting);
    let mut recovered = Vec::with_capacity(pending.len());
    for resource in pending {
        match reattach(shared, resource.as_ref(), live).await? {
            Ok(()) => recovered.push(resource),
            Err(error) if error.is_connection_failure() => {
                return reconnect(shared, error).await;
            }
            Err(error) => abandon(shared, resource.as_ref(), error).await,
        }
    }
    for resource in recovered {
        resource.resume();
    }
    shared.transition(ConnectionState::Connected);
    Ok(())
}

/// Replaces the physical connection and rebuilds every registered resource.
async fn reconnect(shared: &Arc<Shared>, reason: TransportError) -> Result<(), Outcome> {
    #[cfg(feature = "tracing")]
    tracing::warn!(connection = %shared.config.name, error = %reason, "connection lost");
    #[cfg(not(feature = "tracing"))]
    let _ = reason;

    shared.emit(|connection, timestamp| RecoveryEvent::ConnectionLost {
        connection,
        timestamp,
    });
    shared.gate.close();
    shared.transition(ConnectionState::Reconnecting);

    for resource in shared.registry.snapshot() {
        resource.suspend();
    }
    if let Some(stale) = shared.set_current(None) {
        close_quietly(stale.as_ref()).await;
    }

    shared.state.reset_attempts();
    let started = Instant::now();
    loop {
        let live = establish(shared, started).await?;
        shared.set_current(Some(Arc::clone(&live)));

        match sweep(shared, &live).await? {
            Sweep::Done => break,
            Sweep::ConnectionLost(error) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    connection = %shared.config.name,
                    error = %error,
                    "connection lost again while reattaching resources"
                );
                shared.set_current(None);
                close_quietly(live.as_ref()).await;
                // A sweep that never completes spends the budget like a
                // refused connect.
                back_off(shared, shared.state.attempts(), started, error).await?;
            }
        }
    }

    let attempts = shared.state.attempts();
    shared.state.mark_reconnected();
    shared.state.reset_attempts();
    shared.transition(ConnectionState::Connected);
    shared.gate.open();

    #[cfg(feature = "tracing")]
    tracing::info!(connection = %shared.config.name, attempts, "reconnected");

    #[cfg(feature = "metrics")]
    counter!("amqp_recovery_reconnects_total", "connection" => shared.config.name.clone())
        .increment(1);

    shared.emit(|connection, timestamp| RecoveryEvent::Reconnected {
        connection,
        timestamp,
        attempts,
    });
    Ok(())
}

/// Reattaches every registered resource to `live`, then resumes the ones
/// that made it.
///
/// A resource whose link is refused is terminated on its own. A connection
/// failure aborts the sweep so the caller can reconnect and start over.
async fn sweep(shared: &Arc<Shared>, live: &Arc<dyn LiveConnection>) -> Result<Sweep, Outcome> {
    let mut recovered = Vec::new();
    for resource in shared.registry.snapshot() {
        if resource.state().is_final() {
            continue;
        }
        match reattach(shared, resource.as_ref(), live).await? {
            Ok(()) => recovered.push(resource),
            Err(error) if error.is_connection_failure() => {
                return Ok(Sweep::ConnectionLost(error));
            }
            Err(error) => abandon(shared, resource.as_ref(), error).await,
        }
    }
    for resource in recovered {
        resource.resume();
    }
    Ok(Sweep::Done)
}

/// Rebuilds one resource's link, bounded by the per-attempt timeout.
///
/// Disposal interrupts the rebuild; the resource is terminated afterwards
/// along with everything else.
async fn reattach(
    shared: &Shared,
    resource: &dyn Recoverable,
    live: &Arc<dyn LiveConnection>,
) -> Result<Result<(), TransportError>, Outcome> {
    let recover = async {
        match shared.config.attempt_timeout {
            Some(timeout) => tokio::time::timeout(timeout, resource.recover(live))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout(format!(
                        "reattaching {} {} timed out after {:?}",
                        resource.kind(),
                        resource.id(),
                        timeout
                    )))
                }),
            None => resource.recover(live).await,
        }
    };
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(Outcome::Cancelled),
        result = recover => Ok(result),
    }
}

async fn abandon(_shared: &Shared, resource: &dyn Recoverable, error: TransportError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(
        connection = %_shared.config.name,
        resource = %resource.id(),
        kind = %resource.kind(),
        error = %error,
        "failed to reattach resource"
    );
    resource.terminate(Some(error)).await;
}

/// Runs connect attempts until one succeeds or the budget runs out.
///
/// Endpoints rotate round-robin across attempts.
pub(crate) async fn establish(
    shared: &Shared,
    started: Instant,
) -> Result<Arc<dyn LiveConnection>, Outcome> {
    let config = &shared.config;
    loop {
        if shared.cancel.is_cancelled() {
            return Err(Outcome::Cancelled);
        }

        let attempt = shared.state.increment_attempts();
        let index = shared.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let endpoint = &shared.endpoints[index % shared.endpoints.len()];

        #[cfg(feature = "tracing")]
        tracing::debug!(connection = %config.name, attempt, endpoint = %endpoint, "connecting");

        #[cfg(feature = "metrics")]
        counter!(
            "amqp_recovery_reconnect_attempts_total",
            "connection" => config.name.clone()
        )
        .increment(1);

        shared.emit(|connection, timestamp| RecoveryEvent::ReconnectAttempt {
            connection,
            timestamp,
            attempt,
        });

        let connect = async {
            match config.attempt_timeout {
                Some(timeout) => {
                    tokio::time::timeout(timeout, shared.transport.connect(endpoint))
                        .await
                        .unwrap_or_else(|_| {
                            Err(TransportError::Timeout(format!(
                                "connect to {} timed out after {:?}",
                                endpoint, timeout
                            )))
                        })
                }
                None => shared.transport.connect(endpoint).await,
            }
        };
        let error = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(Outcome::Cancelled),
            connected = connect => match connected {
                Ok(live) => return Ok(live),
                Err(error) => error,
            },
        };

        back_off(shared, attempt, started, error).await?;
    }
}

/// Sleeps before the attempt after `attempt`, or gives up with `error` once
/// the budget is spent.
async fn back_off(
    shared: &Shared,
    attempt: u32,
    started: Instant,
    error: TransportError,
) -> Result<(), Outcome> {
    let Some(delay) = next_delay(shared, attempt, started) else {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            connection = %shared.config.name,
            attempts = attempt,
            error = %error,
            "giving up on reconnecting"
        );

        shared.emit(|connection, timestamp| RecoveryEvent::RecoveryExhausted {
            connection,
            timestamp,
            attempts: attempt,
        });
        return Err(Outcome::Exhausted(error));
    };

    shared.emit(|connection, timestamp| RecoveryEvent::ReconnectBackoff {
        connection,
        timestamp,
        attempt,
        delay,
    });

    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(Outcome::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Delay before the attempt after `attempt`, or `None` once the budget is spent.
fn next_delay(shared: &Shared, attempt: u32, started: Instant) -> Option<Duration> {
    let config = &shared.config;
    if let Some(max) = config.max_attempts {
        if attempt >= max {
            return None;
        }
    }
    let delay = config
        .policy
        .delay_for_attempt(attempt.saturating_sub(1) as usize)?;
    if let Some(max_elapsed) = config.max_elapsed {
        if started.elapsed() + delay > max_elapsed {
            return None;
        }
    }
    Some(delay)
}

/// Terminates every resource and releases anyone waiting on the connection.
async fn finish(shared: &Arc<Shared>, outcome: Outcome) {
    let cause = {
        let mut availability = shared.availability.lock();
        if matches!(*availability, Availability::Open) {
            *availability = match outcome {
                Outcome::Exhausted(cause) => Availability::Terminated(Some(cause)),
                Outcome::Cancelled => Availability::Disposed,
            };
        }
        match &*availability {
            Availability::Terminated(cause) => cause.clone(),
            Availability::Open | Availability::Disposed => None,
        }
    };

    shared.transition(ConnectionState::Terminated);

    let live = shared.set_current(None);
    for resource in shared.registry.snapshot() {
        resource.terminate(cause.clone()).await;
    }
    if let Some(live) = live {
        close_quietly(live.as_ref()).await;
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        connection = %shared.config.name,
        clean = cause.is_none(),
        "connection closed"
    );

    shared.gate.open();
    shared.finished.open();
}

async fn close_quietly(live: &dyn LiveConnection) {
    if let Err(_error) = live.close().await {
        #[cfg(feature = "tracing")]
        tracing::trace!(error = %_error, "ignoring close failure on discarded connection");
    }
}
