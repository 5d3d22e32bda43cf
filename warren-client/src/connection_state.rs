//! Connection lifecycle state
//!
//! # State Transitions
//!
//! ```text
//! Idle → Connecting → Connected → Reconnecting → Connecting → ...
//!            ↓             ↓             ↓
//!          Closed  ←───  Closed   ←── Closed
//! ```
//!
//! `Closed` is terminal: once a manager is closed, or its retry policy gives
//! up, no further transition happens and a new manager is needed.

use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of a connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, nothing dialed yet
    Idle,
    /// A dial is in flight
    Connecting,
    /// A connection and its default channel are installed
    Connected,
    /// The last dial failed or the connection dropped; waiting to dial again
    Reconnecting,
    /// Terminal
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Numeric form used by the connection state gauge
    pub(crate) fn gauge_value(&self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Closed => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcasts state changes to any number of watchers
#[derive(Debug)]
pub(crate) struct StateTracker {
    tx: watch::Sender<ConnectionState>,
}

impl StateTracker {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`; returns whether the state changed. Nothing moves out
    /// of `Closed`.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = ConnectionState::Idle;
        let applied = self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            previous = *state;
            *state = next;
            previous != next
        });

        if applied {
            tracing::debug!(from = %previous, to = %next, "Connection state changed");
        }
        applied
    }
}
