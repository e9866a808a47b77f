use std::sync::Arc;
use std::time::Duration;

use amqp_autorecovery_core::events::{EventListeners, FnListener};

use crate::events::RecoveryEvent;
use crate::policy::RecoveryPolicy;
use crate::resource::{ResourceId, ResourceKind};
use crate::state::ConnectionState;

/// Reconnect and recovery settings for one connection.
#[derive(Clone)]
pub struct RecoveryConfig {
    pub(crate) name: String,
    pub(crate) policy: RecoveryPolicy,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) max_elapsed: Option<Duration>,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) max_receive_recoveries: Option<u32>,
    pub(crate) event_listeners: Arc<EventListeners<RecoveryEvent>>,
}

impl RecoveryConfig {
    /// Creates a new builder.
    pub fn builder() -> RecoveryConfigBuilder {
        #[cfg(feature = "metrics")]
        {
            crate::metrics_support::describe();
        }
        RecoveryConfigBuilder::new()
    }

    /// Name used in events, logs and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backoff policy between connect attempts.
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Connect attempts allowed per reconnect sequence. `None` is unbounded.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Wall-clock budget for one reconnect sequence.
    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    /// Deadline for a single connect attempt.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Recovery cycles a single `receive` call may span.
    ///
    /// Falls back to `max_attempts` when not set explicitly.
    pub fn max_receive_recoveries(&self) -> Option<u32> {
        self.max_receive_recoveries.or(self.max_attempts)
    }

    pub(crate) fn emit(&self, event: RecoveryEvent) {
        self.event_listeners.emit(&event);
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfigBuilder::new().build()
    }
}

impl std::fmt::Debug for RecoveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryConfig")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_receive_recoveries", &self.max_receive_recoveries)
            .field("event_listeners", &self.event_listeners.len())
            .finish()
    }
}

/// Builder for [`RecoveryConfig`].
pub struct RecoveryConfigBuilder {
    name: String,
    policy: RecoveryPolicy,
    max_attempts: Option<u32>,
    max_elapsed: Option<Duration>,
    attempt_timeout: Option<Duration>,
    max_receive_recoveries: Option<u32>,
    event_listeners: EventListeners<RecoveryEvent>,
}

impl RecoveryConfigBuilder {
    /// Creates a builder with default settings.
    ///
    /// Defaults:
    /// - name: `"<unnamed>"`
    /// - policy: exponential, 100ms doubling up to 5s
    /// - max_attempts: unbounded
    /// - max_elapsed: unbounded
    /// - attempt_timeout: none
    pub fn new() -> Self {
        Self {
            name: "<unnamed>".to_string(),
            policy: RecoveryPolicy::default(),
            max_attempts: None,
            max_elapsed: None,
            attempt_timeout: None,
            max_receive_recoveries: None,
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the connection name.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the backoff policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use amqp_autorecovery::{RecoveryConfig, RecoveryPolicy};
    ///
    /// let config = RecoveryConfig::builder()
    ///     .policy(RecoveryPolicy::exponential_random(
    ///         Duration::from_millis(50),
    ///         Duration::from_secs(2),
    ///         0.5,
    ///     ))
    ///     .max_attempts(10)
    ///     .build();
    /// assert_eq!(config.max_attempts(), Some(10));
    /// ```
    pub fn policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Caps the connect attempts in one reconnect sequence.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Removes any attempt cap.
    pub fn unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Caps the wall-clock time of one reconnect sequence.
    pub fn max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Abandons a single connect attempt after `timeout`.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Caps the recovery cycles a single `receive` call may span.
    pub fn max_receive_recoveries(mut self, cycles: u32) -> Self {
        self.max_receive_recoveries = Some(cycles);
        self
    }

    /// Called before each connect attempt with the 1-indexed attempt number.
    pub fn on_reconnect_attempt<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RecoveryEvent::ReconnectAttempt { attempt, .. } = event {
                f(*attempt);
            }
        }));
        self
    }

    /// Called after a reconnect sequence succeeds, with the attempts it took.
    pub fn on_reconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RecoveryEvent::Reconnected { attempts, .. } = event {
                f(*attempts);
            }
        }));
        self
    }

    /// Called on every connection state transition.
    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RecoveryEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Called when a consumer or producer is terminated. The flag is true
    /// for a clean close.
    pub fn on_resource_terminated<F>(mut self, f: F) -> Self
    where
        F: Fn(ResourceId, ResourceKind, bool) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RecoveryEvent::ResourceTerminated {
                resource,
                kind,
                clean,
                ..
            } = event
            {
                f(*resource, *kind, *clean);
            }
        }));
        self
    }

    /// Called for every event.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&RecoveryEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(f));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> RecoveryConfig {
        RecoveryConfig {
            name: self.name,
            policy: self.policy,
            max_attempts: self.max_attempts,
            max_elapsed: self.max_elapsed,
            attempt_timeout: self.attempt_timeout,
            max_receive_recoveries: self.max_receive_recoveries,
            event_listeners: Arc::new(self.event_listeners),
        }
    }
}

impl Default for RecoveryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecoveryConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryConfigBuilder")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .field("max_elapsed", &self.max_elapsed)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("max_receive_recoveries", &self.max_receive_recoveries)
            .finish()
    }
}
