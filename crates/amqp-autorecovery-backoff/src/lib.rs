//! Backoff interval functions.
//!
//! A reconnect loop asks an [`IntervalFunction`] how long to wait before the
//! next attempt. Strategies provided here:
//!
//! - [`FixedInterval`]: the same delay every time
//! - [`ExponentialBackoff`]: delay grows by a multiplier, optionally capped
//! - [`ExponentialRandomBackoff`]: exponential growth plus jitter so many
//!   clients losing the same broker do not reconnect in lockstep
//! - [`FnInterval`]: any closure
//!
//! # Examples
//!
//! ```
//! use amqp_autorecovery_backoff::{ExponentialBackoff, IntervalFunction};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_millis(100))
//!     .max_interval(Duration::from_secs(1));
//!
//! assert_eq!(backoff.next_interval(0), Duration::from_millis(100));
//! assert_eq!(backoff.next_interval(3), Duration::from_millis(800));
//! assert_eq!(backoff.next_interval(9), Duration::from_secs(1));
//! ```

mod backoff;

pub use backoff::{
    ExponentialBackoff, ExponentialRandomBackoff, FixedInterval, FnInterval, IntervalFunction,
};
