//! Retry policy for the supervision loop
//!
//! A [`RetryPolicy`] decides whether the connection manager dials again after
//! a failed dial or a dropped connection, and how long it waits first.
//!
//! # Counting
//!
//! Every dial, including the first one, is recorded with
//! [`record_attempt`](RetryPolicy::record_attempt). After a failure the
//! manager asks [`should_retry`](RetryPolicy::should_retry), which is false
//! once the counter reaches `max_attempts`. With `max_attempts = 2` and a
//! broker that never answers, exactly two dials happen before
//! `Error::MaxAttempts { attempts: 2 }`.
//!
//! The counter keeps its value while connected. When an established
//! connection later drops, the counter starts from zero for the new reconnect
//! cycle unless [`with_reset_on_connect(false)`](RetryPolicy::with_reset_on_connect)
//! makes the budget span the lifetime of the manager.
//!
//! # Examples
//!
//! ```rust
//! use warren_client::RetryPolicy;
//! use std::time::Duration;
//!
//! // Five dials, one second apart
//! let bounded = RetryPolicy::new(5, Duration::from_secs(1));
//!
//! // Retry until cancelled, logging every failure
//! let forever = RetryPolicy::unbounded(Duration::from_millis(500))
//!     .with_error_listener(|err| eprintln!("broker unavailable: {}", err));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warren_core::Error;

/// Observer invoked with every connection failure, including the terminal one
pub type ErrorListener = Arc<dyn Fn(&Error) + Send + Sync>;

/// Bounded or unbounded fixed-backoff retry policy
pub struct RetryPolicy {
    attempts: AtomicU32,
    max_attempts: Option<u32>,
    backoff: Duration,
    on_error: Option<ErrorListener>,
    reset_on_connect: bool,
}

impl RetryPolicy {
    /// Allow at most `max_attempts` dials per reconnect cycle
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            max_attempts: Some(max_attempts),
            backoff,
            on_error: None,
            reset_on_connect: true,
        }
    }

    /// Retry until cancelled
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            ..Self::new(0, backoff)
        }
    }

    /// A single dial, never retried
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_error_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(listener));
        self
    }

    /// Whether the counter restarts when an established connection drops
    pub fn with_reset_on_connect(mut self, reset: bool) -> Self {
        self.reset_on_connect = reset;
        self
    }

    /// False once a finite `max_attempts` has been reached
    pub fn should_retry(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.attempts.load(Ordering::SeqCst) < max,
            None => true,
        }
    }

    /// Count one dial; returns the new total
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fixed wait before each retry
    pub fn wait_duration(&self) -> Duration {
        self.backoff
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub(crate) fn resets_on_connect(&self) -> bool {
        self.reset_on_connect
    }

    /// Hand a failure to the observer, if any
    pub fn notify(&self, err: &Error) {
        if let Some(listener) = &self.on_error {
            listener(err);
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts())
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("has_listener", &self.on_error.is_some())
            .field("reset_on_connect", &self.reset_on_connect)
            .finish()
    }
}
