//! Error types for warren
//!
//! Every fallible operation in the workspace returns [`Error`]. The enum is
//! `Clone` so that one failure can be handed to several parties at once: the
//! retry observer, the task blocked in `run`, and every caller waiting in a
//! consumer's `cancel()`.
//!
//! # Error Categories
//!
//! - **Setup errors**: `Config`, never retried
//! - **Connection errors**: `Connect`, retried while the retry policy allows it,
//!   then surfaced as `MaxAttempts`
//! - **Topology errors**: `Attach`, reported to the caller of an attach
//! - **Shutdown errors**: `Cancel`, `Cancelled`, `Closed`
//! - **Usage errors**: `NotConnected`, `AlreadyRunning`
//! - **Protocol errors**: `Broker`, anything the protocol library reports
//!
//! # Examples
//!
//! ```rust
//! use warren_core::{AttachStep, Error};
//!
//! let error = Error::attach(AttachStep::DeclareQueue, "PRECONDITION_FAILED");
//! assert!(error.to_string().contains("declare queue"));
//! assert!(!error.is_retryable());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type for warren operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for warren operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid or missing configuration (missing dial function, empty
    /// exchange name, ...). Surfaced immediately and never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dialing the broker failed, or the broker closed an established
    /// connection. Retried according to the retry policy.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The retry policy ran out of attempts. Terminal.
    #[error("Max reconnect attempts reached after {attempts} attempts")]
    MaxAttempts {
        /// Number of dial attempts performed before giving up
        attempts: u32,
    },

    /// Declaring or binding topology during a consumer/producer attach failed.
    /// The manager's connection state is not affected.
    #[error("Attach failed to {step}: {message}")]
    Attach {
        /// The attach step that failed
        step: AttachStep,
        /// The protocol library's description of the failure
        message: String,
    },

    /// Cancelling a consumer failed, either at the broker or because the
    /// delivery handler reported an error while draining.
    #[error("Cancel error: {0}")]
    Cancel(String),

    /// No usable connection is currently established.
    #[error("Not connected")]
    NotConnected,

    /// A cancellation token fired before the operation completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection manager was closed; a new manager is needed to reconnect.
    #[error("Connection manager closed")]
    Closed,

    /// A supervision loop is already running on this manager.
    #[error("Supervision loop already running")]
    AlreadyRunning,

    /// Error reported by the broker-protocol library outside of attach.
    #[error("Broker error: {0}")]
    Broker(String),
}

impl Error {
    /// Wrap a dial or close failure
    pub fn connect(err: impl fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }

    /// Wrap a protocol library failure
    pub fn broker(err: impl fmt::Display) -> Self {
        Self::Broker(err.to_string())
    }

    /// Build an attach failure for the given step
    pub fn attach(step: AttachStep, err: impl fmt::Display) -> Self {
        Self::Attach {
            step,
            message: err.to_string(),
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Broker(_))
    }

    /// Whether this error ends a supervision loop for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MaxAttempts { .. } | Self::Cancelled | Self::Closed | Self::Config(_)
        )
    }
}

/// Topology step that failed during an attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachStep {
    /// exchange.declare
    DeclareExchange,
    /// queue.declare
    DeclareQueue,
    /// queue.bind
    BindQueue,
    /// basic.consume
    Consume,
}

impl AttachStep {
    /// Human-readable name of the step
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeclareExchange => "declare exchange",
            Self::DeclareQueue => "declare queue",
            Self::BindQueue => "bind queue",
            Self::Consume => "start consuming",
        }
    }
}

impl fmt::Display for AttachStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
