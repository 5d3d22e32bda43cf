//! Supervised broker connection
//!
//! The [`ConnectionManager`] owns exactly one broker connection and its
//! default channel at a time. It dials through the configured dial function,
//! prepares the channel (QoS, confirm mode), runs the on-connect hook, and in
//! supervising mode redials according to the [`RetryPolicy`](crate::RetryPolicy)
//! whenever the broker drops the connection.
//!
//! # Lifecycle
//!
//! 1. **Connect**: [`connect`](ConnectionManager::connect) performs one dial
//! 2. **Supervise**: [`run`](ConnectionManager::run) blocks the caller,
//!    [`start`](ConnectionManager::start) spawns the loop after a first
//!    successful connect
//! 3. **Close**: [`close`](ConnectionManager::close) or the caller's
//!    cancellation token ends supervision; the manager is then `Closed` for
//!    good
//!
//! # Handles
//!
//! A freshly dialed connection stays hidden until the on-connect hook has
//! returned. Only the manager handed to the hook can see it in the meantime,
//! so nothing attaches to it before the hook does.
//!
//! Consumers and producers never keep the channel itself. They hold a lease
//! stamped with the generation of the connection they attached to and resolve
//! it on every use; once the manager has replaced or dropped that connection
//! the lease answers `NotConnected`.
//!
//! # Cloning
//!
//! `ConnectionManager` is an `Arc` handle. Clones share the same connection,
//! state and supervision loop.

use crate::connection_state::{ConnectionState, StateTracker};
use crate::{ClientMetrics, Config};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use warren_core::{BrokerChannel, BrokerConnection, CloseSignal, Error, Result};

/// Connection and default channel installed by a successful dial
#[derive(Clone)]
struct Live {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Live {
    fn is_usable(&self) -> bool {
        !self.connection.is_closed() && !self.channel.is_closed()
    }
}

struct Slot {
    generation: u64,
    live: Option<Live>,
    /// Set once the on-connect hook for `generation` has returned
    published: bool,
}

struct Inner {
    config: Config,
    slot: Mutex<Slot>,
    state: StateTracker,
    shutdown: CancellationToken,
    dial_guard: tokio::sync::Mutex<()>,
    running: AtomicBool,
    terminal: watch::Sender<Option<Error>>,
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervises one broker connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    /// Generation this handle may see before it is published (the hook's view)
    preparing: Option<u64>,
}

/// Generation-stamped reference to the manager's current channel
#[derive(Clone)]
pub(crate) struct Lease {
    manager: ConnectionManager,
    generation: u64,
}

impl Lease {
    /// The channel this lease was issued for, if it is still installed and open
    pub(crate) fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let slot = self.manager.inner.lock_slot();
        match self.manager.visible(&slot) {
            Some(live) if slot.generation == self.generation => Ok(live.channel.clone()),
            _ => Err(Error::NotConnected),
        }
    }

    pub(crate) fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        let (terminal, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                slot: Mutex::new(Slot {
                    generation: 0,
                    live: None,
                    published: false,
                }),
                state: StateTracker::new(),
                shutdown: CancellationToken::new(),
                dial_guard: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                terminal,
            }),
            preparing: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Dial attempts recorded by the retry policy (0 without one)
    pub fn attempts(&self) -> u32 {
        self.inner
            .config
            .retry
            .as_ref()
            .map(|policy| policy.attempts())
            .unwrap_or(0)
    }

    /// Whether a supervision loop is active
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The live connection; never a stale or half-prepared one
    pub fn current_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.current().map(|live| live.connection)
    }

    /// The default channel of the live connection
    pub fn current_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.current().map(|live| live.channel)
    }

    fn current(&self) -> Result<Live> {
        let slot = self.inner.lock_slot();
        self.visible(&slot).cloned().ok_or(Error::NotConnected)
    }

    /// The installed connection, if it is usable and this handle may see it
    fn visible<'a>(&self, slot: &'a Slot) -> Option<&'a Live> {
        let live = slot.live.as_ref().filter(|live| live.is_usable())?;
        (slot.published || self.preparing == Some(slot.generation)).then_some(live)
    }

    /// Lease the current channel; requires `Connected`
    pub(crate) fn lease(&self) -> Result<Lease> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }

        let slot = self.inner.lock_slot();
        match self.visible(&slot) {
            Some(_) => Ok(Lease {
                manager: self.clone(),
                generation: slot.generation,
            }),
            None => Err(Error::NotConnected),
        }
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<ClientMetrics>> {
        self.inner.config.metrics.as_ref()
    }

    /// Dial once, without retrying
    ///
    /// On success the connection and its default channel are installed, the
    /// on-connect hook has completed, and the returned [`CloseSignal`] fires
    /// when the broker later drops the connection.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<CloseSignal> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let result = self.dial_guarded(cancel).await;
        if result.is_err() {
            self.set_state(ConnectionState::Idle);
        }
        result
    }

    /// Connect and keep the connection up until the retry policy gives up,
    /// `cancel` fires or the manager is closed
    ///
    /// Always returns the reason supervision ended: the last connection error
    /// when no retry policy is configured, `MaxAttempts` when the policy is
    /// exhausted, `Cancelled` or `Closed` on shutdown. The manager is `Closed`
    /// afterwards.
    pub async fn run(&self, cancel: CancellationToken) -> Error {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Error::AlreadyRunning;
        }

        let err = self.supervise(&cancel, None).await;
        self.finish(err)
    }

    /// Connect once, then supervise in a background task
    ///
    /// The first connect's error is returned directly. Later terminal errors
    /// go to the retry policy's listener and to [`wait`](Self::wait).
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let signal = match self.dial_guarded(&cancel).await {
            Ok(signal) => signal,
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Idle);
                return Err(err);
            }
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let err = manager.supervise(&cancel, Some(signal)).await;
            manager.finish(err);
        });

        Ok(())
    }

    /// Wait for supervision to end and return why
    pub async fn wait(&self) -> Error {
        let mut rx = self.inner.terminal.subscribe();
        rx.wait_for(|terminal| terminal.is_some())
            .await
            .ok()
            .and_then(|terminal| (*terminal).clone())
            .unwrap_or(Error::Closed)
    }

    /// Stop supervision and close the connection
    ///
    /// Idempotent: later calls find nothing to release and return `Ok`.
    /// Without an active supervisor, [`wait`](Self::wait) returns `Closed`
    /// from here on.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let live = self.take_live();
        self.set_state(ConnectionState::Closed);

        if !self.is_running() {
            self.inner.terminal.send_if_modified(|terminal| {
                if terminal.is_some() {
                    return false;
                }
                *terminal = Some(Error::Closed);
                true
            });
        }

        match live {
            Some(live) => {
                tracing::info!("Closing broker connection");
                live.connection.close().await
            }
            None => Ok(()),
        }
    }

    async fn supervise(&self, cancel: &CancellationToken, mut signal: Option<CloseSignal>) -> Error {
        let mut connected_before = signal.is_some();

        loop {
            let failure = match signal.take() {
                Some(close_signal) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.shut_down(Error::Cancelled).await,
                        _ = self.inner.shutdown.cancelled() => return self.shut_down(Error::Closed).await,
                        reason = close_signal.recv() => {
                            self.connection_lost(&reason);
                            reason
                        }
                    }
                }
                None => {
                    if cancel.is_cancelled() {
                        return self.shut_down(Error::Cancelled).await;
                    }

                    let dialed = {
                        let _guard = self.inner.dial_guard.lock().await;
                        self.dial_once(cancel).await
                    };

                    match dialed {
                        Ok(close_signal) => {
                            if connected_before {
                                tracing::info!("Reconnected to broker");
                                if let Some(metrics) = self.metrics() {
                                    metrics.record_reconnection();
                                }
                            }
                            connected_before = true;
                            signal = Some(close_signal);
                            continue;
                        }
                        Err(Error::Cancelled) => return self.shut_down(Error::Cancelled).await,
                        Err(Error::Closed) => return self.shut_down(Error::Closed).await,
                        Err(err) => err,
                    }
                }
            };

            if let Some(metrics) = self.metrics() {
                metrics.record_error(&failure);
            }

            let Some(policy) = self.inner.config.retry.clone() else {
                tracing::error!(error = %failure, "Connection failed, retry disabled");
                return self.shut_down(failure).await;
            };

            policy.notify(&failure);

            if !policy.should_retry() {
                let terminal = Error::MaxAttempts {
                    attempts: policy.attempts(),
                };
                tracing::error!(attempts = policy.attempts(), "Reconnection abandoned (max attempts reached)");
                policy.notify(&terminal);
                return self.shut_down(terminal).await;
            }

            self.set_state(ConnectionState::Reconnecting);
            let backoff = policy.wait_duration();
            tracing::info!(
                attempts = policy.attempts(),
                backoff_ms = backoff.as_millis() as u64,
                error = %failure,
                "Waiting before reconnecting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.shut_down(Error::Cancelled).await,
                _ = self.inner.shutdown.cancelled() => return self.shut_down(Error::Closed).await,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn dial_guarded(&self, cancel: &CancellationToken) -> Result<CloseSignal> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let _guard = self.inner.dial_guard.lock().await;
        self.dial_once(cancel).await
    }

    /// One dial plus channel preparation; the caller holds the dial guard
    async fn dial_once(&self, cancel: &CancellationToken) -> Result<CloseSignal> {
        self.set_state(ConnectionState::Connecting);
        let attempt = self
            .inner
            .config
            .retry
            .as_ref()
            .map(|policy| policy.record_attempt())
            .unwrap_or(1);
        tracing::info!(attempt, "Dialing broker");

        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(Error::Closed),
            result = (self.inner.config.dial)() => result,
        };

        if let Some(metrics) = self.metrics() {
            metrics.record_dial(dialed.is_ok());
        }

        let connection = match dialed {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(attempt, error = %err, "Dial failed");
                return Err(err);
            }
        };

        let close_signal = connection.close_signal();
        let channel = match self.prepare_channel(connection.as_ref()).await {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to prepare channel");
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(error = %close_err, "Failed to close half-open connection");
                }
                return Err(err);
            }
        };

        let (rejected, replaced, generation) = {
            let mut slot = self.inner.lock_slot();
            let live = Live {
                connection,
                channel,
            };
            if self.inner.shutdown.is_cancelled() {
                (Some(live), None, slot.generation)
            } else {
                slot.generation += 1;
                slot.published = false;
                (None, slot.live.replace(live), slot.generation)
            }
        };

        if let Some(live) = rejected {
            // close() ran while we were dialing
            let _ = live.connection.close().await;
            return Err(Error::Closed);
        }
        if let Some(stale) = replaced {
            let _ = stale.connection.close().await;
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(attempt, "Connected to broker");

        if let Some(hook) = &self.inner.config.on_connect {
            hook(self.preparing(generation)).await;
        }
        self.publish(generation);

        Ok(close_signal)
    }

    async fn prepare_channel(&self, connection: &dyn BrokerConnection) -> Result<Arc<dyn BrokerChannel>> {
        let channel = connection.open_channel().await?;

        if let Some(qos) = self.inner.config.qos {
            channel.qos(qos).await?;
        }
        if self.inner.config.publisher_confirms {
            channel.confirm_select().await?;
        }

        Ok(channel)
    }

    fn connection_lost(&self, reason: &Error) {
        let lost = self.take_live();
        self.set_state(ConnectionState::Reconnecting);
        tracing::warn!(error = %reason, "Connection to broker lost");

        if let Some(policy) = &self.inner.config.retry {
            if policy.resets_on_connect() {
                policy.reset();
            }
        }
        drop(lost);
    }

    async fn shut_down(&self, reason: Error) -> Error {
        self.inner.shutdown.cancel();
        let live = self.take_live();
        self.set_state(ConnectionState::Closed);

        if let Some(live) = live {
            if let Err(err) = live.connection.close().await {
                tracing::warn!(error = %err, "Failed to close broker connection");
            }
        }

        if !matches!(reason, Error::Cancelled | Error::Closed) {
            if let Some(metrics) = self.metrics() {
                metrics.record_terminal_failure(&reason);
            }
        }

        tracing::info!(reason = %reason, "Connection supervision stopped");
        reason
    }

    fn finish(&self, err: Error) -> Error {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.terminal.send_replace(Some(err.clone()));
        err
    }

    /// Handle for the on-connect hook, able to see `generation` before it is published
    fn preparing(&self, generation: u64) -> Self {
        Self {
            inner: self.inner.clone(),
            preparing: Some(generation),
        }
    }

    fn publish(&self, generation: u64) {
        let mut slot = self.inner.lock_slot();
        if slot.generation == generation {
            slot.published = true;
        }
    }

    fn take_live(&self) -> Option<Live> {
        self.inner.lock_slot().live.take()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.inner.state.transition(state) {
            if let Some(metrics) = self.metrics() {
                metrics.update_connection_state(state);
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .field("running", &self.is_running())
            .finish()
    }
}
