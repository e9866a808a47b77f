//! Backoff shapes for reconnect attempts.

use std::sync::Arc;
use std::time::Duration;

use amqp_autorecovery_backoff::{
    ExponentialBackoff, ExponentialRandomBackoff, FixedInterval, IntervalFunction,
};

/// How long to wait between failed connect attempts.
#[derive(Clone)]
pub enum RecoveryPolicy {
    /// Give up after the first failed attempt.
    None,

    /// Fixed delay between attempts.
    Fixed(FixedInterval),

    /// Exponential backoff between attempts.
    Exponential(ExponentialBackoff),

    /// Exponential backoff with jitter.
    ExponentialRandom(ExponentialRandomBackoff),

    /// Caller-supplied interval function.
    Custom(Arc<dyn IntervalFunction>),
}

impl RecoveryPolicy {
    /// No reconnection: the first failure terminates the connection.
    pub fn none() -> Self {
        RecoveryPolicy::None
    }

    /// Fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        RecoveryPolicy::Fixed(FixedInterval::new(delay))
    }

    /// Doubling delay from `initial_delay`, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        RecoveryPolicy::Exponential(
            ExponentialBackoff::new(initial_delay)
                .multiplier(2.0)
                .max_interval(max_delay),
        )
    }

    /// Doubling delay with jitter of `randomization_factor` (0.0 to 1.0).
    pub fn exponential_random(
        initial_delay: Duration,
        max_delay: Duration,
        randomization_factor: f64,
    ) -> Self {
        RecoveryPolicy::ExponentialRandom(
            ExponentialRandomBackoff::new(initial_delay, randomization_factor)
                .multiplier(2.0)
                .max_interval(max_delay),
        )
    }

    /// Any interval function.
    pub fn custom<I>(interval: I) -> Self
    where
        I: IntervalFunction + 'static,
    {
        RecoveryPolicy::Custom(Arc::new(interval))
    }

    /// Delay after failed attempt number `attempt` (0-indexed), or `None`
    /// when the policy does not retry at all.
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            RecoveryPolicy::None => None,
            RecoveryPolicy::Fixed(interval) => Some(interval.next_interval(attempt)),
            RecoveryPolicy::Exponential(backoff) => Some(backoff.next_interval(attempt)),
            RecoveryPolicy::ExponentialRandom(backoff) => Some(backoff.next_interval(attempt)),
            RecoveryPolicy::Custom(func) => Some(func.next_interval(attempt)),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl std::fmt::Debug for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "RecoveryPolicy::None"),
            Self::Fixed(_) => write!(f, "RecoveryPolicy::Fixed"),
            Self::Exponential(_) => write!(f, "RecoveryPolicy::Exponential"),
            Self::ExponentialRandom(_) => write!(f, "RecoveryPolicy::ExponentialRandom"),
            Self::Custom(_) => write!(f, "RecoveryPolicy::Custom"),
        }
    }
}
