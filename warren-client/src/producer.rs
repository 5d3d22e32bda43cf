//! Producer attachments
//!
//! A [`ProducerAttachment`] declares an exchange (and optionally a queue bound
//! to it) on the manager's current channel and publishes through that channel.
//! Publishes are neither buffered nor retried: once the connection it was
//! attached to is gone every publish fails with `NotConnected`, and the
//! producer has to be attached again, typically from the on-connect hook.

use crate::consumer::attach_failed;
use crate::manager::{ConnectionManager, Lease};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use warren_core::{
    AttachStep, BrokerChannel, DeferredConfirmation, Error, ProducerOptions, Publishing, Result,
};

/// Publisher bound to one connection generation
#[derive(Clone)]
pub struct ProducerAttachment {
    options: Arc<ProducerOptions>,
    queue: Option<String>,
    lease: Lease,
}

impl ProducerAttachment {
    /// Declare the exchange and, if configured, the queue and its binding
    pub async fn attach(manager: &ConnectionManager, options: ProducerOptions) -> Result<Self> {
        options.validate()?;
        let lease = manager.lease()?;
        let channel = lease.channel()?;

        let queue = match declare(channel.as_ref(), &options).await {
            Ok(queue) => queue,
            Err(err) => {
                tracing::warn!(exchange = %options.exchange.name, error = %err, "Producer attach failed");
                if let Some(metrics) = manager.metrics() {
                    metrics.record_error(&err);
                }
                return Err(err);
            }
        };

        tracing::info!(exchange = %options.exchange.name, queue = ?queue, "Producer attached");

        Ok(Self {
            options: Arc::new(options),
            queue,
            lease,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.options.exchange.name
    }

    /// Name of the declared queue, if any
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Publish `message` to the attached exchange
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<()> {
        let channel = self.channel_for_publish(cancel)?;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = channel.publish(self.exchange(), routing_key, mandatory, immediate, message) => result,
        };

        self.record(routing_key, &result, started);
        result
    }

    /// Publish `message` and return a handle resolving to the broker's
    /// confirmation
    ///
    /// The confirmation is `NotRequested` unless the manager was configured
    /// with publisher confirms.
    pub async fn publish_with_deferred_confirm(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<DeferredConfirmation> {
        let channel = self.channel_for_publish(cancel)?;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = channel.publish_with_deferred_confirm(
                self.exchange(),
                routing_key,
                mandatory,
                immediate,
                message,
            ) => result,
        };

        self.record(routing_key, &result, started);
        result
    }

    fn channel_for_publish(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.lease.channel()
    }

    fn record<T>(&self, routing_key: &str, result: &Result<T>, started: Instant) {
        if let Err(err) = result {
            tracing::debug!(exchange = %self.exchange(), routing_key, error = %err, "Publish failed");
        }
        if let Some(metrics) = self.lease.manager().metrics() {
            metrics.record_publish(self.exchange(), result.is_ok(), started.elapsed());
        }
    }
}

async fn declare(channel: &dyn BrokerChannel, options: &ProducerOptions) -> Result<Option<String>> {
    channel
        .declare_exchange(&options.exchange)
        .await
        .map_err(|err| attach_failed(AttachStep::DeclareExchange, err))?;

    let Some(queue_options) = &options.queue else {
        return Ok(None);
    };

    let queue = channel
        .declare_queue(queue_options)
        .await
        .map_err(|err| attach_failed(AttachStep::DeclareQueue, err))?;

    channel
        .bind_queue(
            &queue,
            &queue_options.routing_key,
            &options.exchange.name,
            queue_options.no_wait,
            &queue_options.args,
        )
        .await
        .map_err(|err| attach_failed(AttachStep::BindQueue, err))?;

    Ok(Some(queue))
}
