use std::time::Duration;

/// Computes the delay before a reconnect attempt.
///
/// Implementations must be cheap and must not panic for any attempt number;
/// an unbounded reconnect loop will keep asking.
pub trait IntervalFunction: Send + Sync {
    /// Delay before the attempt following failure number `attempt` (0-indexed).
    fn next_interval(&self, attempt: usize) -> Duration;
}

/// Same delay for every attempt.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    duration: Duration,
}

impl FixedInterval {
    /// Creates a fixed interval.
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl IntervalFunction for FixedInterval {
    fn next_interval(&self, _attempt: usize) -> Duration {
        self.duration
    }
}

/// Exponential growth with a configurable multiplier.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Option<Duration>,
}

impl ExponentialBackoff {
    /// Creates an exponential backoff doubling from `initial_interval`.
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: 2.0,
            max_interval: None,
        }
    }

    /// Sets the growth multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Caps the delay.
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }
}

impl IntervalFunction for ExponentialBackoff {
    fn next_interval(&self, attempt: usize) -> Duration {
        grow(
            self.initial_interval,
            self.multiplier,
            attempt,
            self.max_interval,
        )
    }
}

/// Exponential growth with jitter.
///
/// The capped exponential delay `d` is spread uniformly over
/// `[d * (1 - factor), d * (1 + factor)]`.
#[derive(Debug, Clone)]
pub struct ExponentialRandomBackoff {
    initial_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Option<Duration>,
}

impl ExponentialRandomBackoff {
    /// Creates a randomized exponential backoff.
    ///
    /// `randomization_factor` is clamped to `0.0..=1.0`.
    pub fn new(initial_interval: Duration, randomization_factor: f64) -> Self {
        Self {
            initial_interval,
            multiplier: 2.0,
            randomization_factor: randomization_factor.clamp(0.0, 1.0),
            max_interval: None,
        }
    }

    /// Sets the growth multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Caps the delay before jitter is applied.
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    fn jitter(&self, duration: Duration) -> Duration {
        use rand::Rng;

        let secs = duration.as_secs_f64();
        let delta = secs * self.randomization_factor;
        let low = (secs - delta).max(0.0);
        let high = secs + delta;
        if !high.is_finite() || high <= low {
            return duration;
        }
        let jittered = rand::rng().random_range(low..=high);
        Duration::try_from_secs_f64(jittered).unwrap_or(duration)
    }
}

impl IntervalFunction for ExponentialRandomBackoff {
    fn next_interval(&self, attempt: usize) -> Duration {
        let capped = grow(
            self.initial_interval,
            self.multiplier,
            attempt,
            self.max_interval,
        );
        self.jitter(capped)
    }
}

/// Closure-backed interval.
pub struct FnInterval<F> {
    f: F,
}

impl<F> FnInterval<F>
where
    F: Fn(usize) -> Duration + Send + Sync,
{
    /// Wraps a closure mapping attempt number to delay.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> IntervalFunction for FnInterval<F>
where
    F: Fn(usize) -> Duration + Send + Sync,
{
    fn next_interval(&self, attempt: usize) -> Duration {
        (self.f)(attempt)
    }
}

impl<F> std::fmt::Debug for FnInterval<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnInterval")
    }
}

// Saturates instead of panicking: `Duration::mul_f64` panics once the
// product leaves the representable range, which an unbounded loop reaches.
fn grow(initial: Duration, multiplier: f64, attempt: usize, max: Option<Duration>) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    let capped = match max {
        Some(max) => secs.min(max.as_secs_f64()),
        None => secs,
    };
    if capped.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(capped).unwrap_or(max.unwrap_or(Duration::MAX))
}
