//! Consumer attachments
//!
//! A [`ConsumerAttachment`] declares its topology on the manager's current
//! channel, starts a broker consumer and hands the delivery stream to a
//! handler running in its own task.
//!
//! # Attach Order
//!
//! 1. declare exchange
//! 2. declare queue
//! 3. bind queue to exchange with the queue's routing key
//! 4. start consuming
//!
//! The first failing step aborts the attach with `Error::Attach`; steps that
//! already succeeded are not rolled back.
//!
//! # Shutdown
//!
//! [`cancel`](ConsumerAttachment::cancel) cancels the broker consumer, which
//! ends the delivery stream, then waits until the handler has returned. A
//! handler that keeps running after its stream has ended blocks `cancel`
//! indefinitely.
//!
//! # Examples
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use warren_client::{ConnectionManager, ConsumerAttachment};
//! use warren_core::{ConsumerOptions, ExchangeKind, ExchangeOptions, QueueOptions};
//!
//! # async fn example(manager: ConnectionManager) -> warren_core::Result<()> {
//! let options = ConsumerOptions::new(
//!     "audit-log",
//!     ExchangeOptions::new("audit", ExchangeKind::Fanout),
//!     QueueOptions::new("audit.log"),
//! );
//!
//! let consumer = ConsumerAttachment::attach(&manager, options, |mut deliveries| async move {
//!     while let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         tracing::info!(body = %String::from_utf8_lossy(&delivery.body), "audit event");
//!         delivery.ack().await?;
//!     }
//!     Ok(())
//! })
//! .await?;
//!
//! consumer.cancel().await?;
//! # Ok(())
//! # }
//! ```

use crate::manager::{ConnectionManager, Lease};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;
use warren_core::{AttachStep, BrokerChannel, ConsumerOptions, DeliveryStream, Error, Result};

/// Errors from a cancellation triggered by [`ConsumerAttachment::bind_to_cancellation`]
pub type CancelErrors = mpsc::Receiver<Error>;

/// A running broker consumer
///
/// Cheap to clone; clones refer to the same consumer.
#[derive(Clone)]
pub struct ConsumerAttachment {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    options: ConsumerOptions,
    queue: String,
    lease: Lease,
    done: watch::Receiver<Option<Result<()>>>,
    broker_cancel: OnceCell<Result<()>>,
}

impl ConsumerAttachment {
    /// Declare topology, start consuming and spawn `handler` over the
    /// delivery stream
    ///
    /// Requires the manager to be `Connected`. The handler acknowledges
    /// deliveries itself unless `auto_ack` is set; its return value is
    /// reported by [`cancel`](Self::cancel).
    pub async fn attach<H, Fut>(
        manager: &ConnectionManager,
        options: ConsumerOptions,
        handler: H,
    ) -> Result<Self>
    where
        H: FnOnce(DeliveryStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        options.validate()?;
        let lease = manager.lease()?;
        let channel = lease.channel()?;

        let (queue, deliveries) = match declare_and_consume(channel.as_ref(), &options).await {
            Ok(declared) => declared,
            Err(err) => {
                tracing::warn!(consumer_tag = %options.tag, error = %err, "Consumer attach failed");
                if let Some(metrics) = manager.metrics() {
                    metrics.record_error(&err);
                }
                return Err(err);
            }
        };

        let deliveries = match manager.metrics().cloned() {
            Some(metrics) => {
                let tag = options.tag.clone();
                deliveries
                    .inspect(move |delivery| {
                        if delivery.is_ok() {
                            metrics.record_delivery(&tag);
                        }
                    })
                    .boxed()
            }
            None => deliveries,
        };

        let (done_tx, done_rx) = watch::channel(None);
        let tag = options.tag.clone();
        tokio::spawn(async move {
            let result = handler(deliveries).await;
            match &result {
                Ok(()) => tracing::debug!(consumer_tag = %tag, "Delivery handler finished"),
                Err(err) => tracing::warn!(consumer_tag = %tag, error = %err, "Delivery handler failed"),
            }
            done_tx.send_replace(Some(result));
        });

        tracing::info!(
            consumer_tag = %options.tag,
            exchange = %options.exchange.name,
            queue = %queue,
            "Consumer attached"
        );

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                options,
                queue,
                lease,
                done: done_rx,
                broker_cancel: OnceCell::new(),
            }),
        })
    }

    pub fn tag(&self) -> &str {
        &self.inner.options.tag
    }

    /// Name of the consumed queue, as reported by the broker
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }

    /// Whether the handler has returned
    pub fn is_done(&self) -> bool {
        self.inner.done.borrow().is_some()
    }

    /// Cancel the broker consumer and wait for the handler to return
    ///
    /// Concurrent and repeated calls share a single broker cancel; each one
    /// waits for the handler. The broker error, if any, wins over the
    /// handler's.
    pub async fn cancel(&self) -> Result<()> {
        let broker = self
            .inner
            .broker_cancel
            .get_or_init(|| self.cancel_consumer())
            .await
            .clone();
        let handler = self.wait_done().await;
        let result = broker.and(handler);

        if let Some(metrics) = self.inner.lease.manager().metrics() {
            metrics.record_consumer_cancel(self.tag(), result.is_ok());
        }
        result
    }

    /// Cancel this consumer once `token` fires
    ///
    /// The returned receiver yields the cancellation error, if any, and is
    /// closed once the cancellation has completed.
    pub fn bind_to_cancellation(&self, token: CancellationToken) -> CancelErrors {
        let (tx, rx) = mpsc::channel(1);
        let consumer = self.clone();

        tokio::spawn(async move {
            token.cancelled().await;
            if let Err(err) = consumer.cancel().await {
                let _ = tx.send(err).await;
            }
        });

        rx
    }

    async fn cancel_consumer(&self) -> Result<()> {
        let channel = match self.inner.lease.channel() {
            Ok(channel) => channel,
            Err(_) => {
                // The connection is gone and the broker forgot the consumer with it.
                tracing::debug!(consumer_tag = %self.tag(), "Channel gone, skipping broker cancel");
                return Ok(());
            }
        };

        tracing::info!(consumer_tag = %self.tag(), "Cancelling consumer");
        channel
            .cancel(self.tag(), false)
            .await
            .map_err(|err| Error::Cancel(format!("failed to cancel consumer {}: {}", self.tag(), err)))
    }

    async fn wait_done(&self) -> Result<()> {
        let mut done = self.inner.done.clone();
        let finished = done
            .wait_for(|result| result.is_some())
            .await
            .map(|result| (*result).clone());

        match finished {
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(err))) => Err(Error::Cancel(format!("delivery handler failed: {}", err))),
            Ok(None) | Err(_) => Err(Error::Cancel(
                "delivery handler ended without reporting".to_string(),
            )),
        }
    }
}

async fn declare_and_consume(
    channel: &dyn BrokerChannel,
    options: &ConsumerOptions,
) -> Result<(String, DeliveryStream)> {
    channel
        .declare_exchange(&options.exchange)
        .await
        .map_err(|err| attach_failed(AttachStep::DeclareExchange, err))?;

    let queue = channel
        .declare_queue(&options.queue)
        .await
        .map_err(|err| attach_failed(AttachStep::DeclareQueue, err))?;

    channel
        .bind_queue(
            &queue,
            &options.queue.routing_key,
            &options.exchange.name,
            options.queue.no_wait,
            &options.queue.args,
        )
        .await
        .map_err(|err| attach_failed(AttachStep::BindQueue, err))?;

    let deliveries = channel
        .consume(&queue, options)
        .await
        .map_err(|err| attach_failed(AttachStep::Consume, err))?;

    Ok((queue, deliveries))
}

/// Tag a protocol failure with the attach step it happened in
pub(crate) fn attach_failed(step: AttachStep, err: Error) -> Error {
    match err {
        Error::Broker(message) | Error::Connect(message) => Error::Attach { step, message },
        other => Error::attach(step, other),
    }
}
