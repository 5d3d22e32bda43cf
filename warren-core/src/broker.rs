//! Broker-protocol seam
//!
//! warren does not speak AMQP itself. Everything it needs from a protocol
//! library is captured by two object-safe traits:
//!
//! - [`BrokerConnection`]: a physical connection that can open channels,
//!   report when the broker closes it, and be closed by its owner
//! - [`BrokerChannel`]: the channel-level methods used by consumers and
//!   producers (declare, bind, consume, cancel, qos, publish)
//!
//! `warren-client` ships an implementation for `lapin`; tests use an
//! in-memory broker. The message types in this module ([`Delivery`],
//! [`Publishing`], [`DeferredConfirmation`], ...) are owned by warren so that
//! handlers never depend on a particular protocol library.

use crate::{Arguments, ConsumerOptions, Error, ExchangeOptions, FieldValue, Qos, QueueOptions, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Stream of deliveries for one consumer; ends when the consumer is
/// cancelled or its channel goes away
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A live connection to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Register for the broker closing this connection
    ///
    /// The signal resolves when the broker or the network ends the
    /// connection. A close requested through [`close`](Self::close) does not
    /// have to fire it.
    fn close_signal(&self) -> CloseSignal;

    /// Whether the connection is no longer usable
    fn is_closed(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Channel-level protocol methods
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// basic.qos
    async fn qos(&self, qos: Qos) -> Result<()>;

    /// confirm.select, required before deferred confirmations resolve to
    /// `Ack`/`Nack`
    async fn confirm_select(&self) -> Result<()>;

    /// exchange.declare
    async fn declare_exchange(&self, exchange: &ExchangeOptions) -> Result<()>;

    /// queue.declare; returns the queue name, which the broker picks when
    /// `queue.name` is empty
    async fn declare_queue(&self, queue: &QueueOptions) -> Result<String>;

    /// queue.bind
    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        args: &Arguments,
    ) -> Result<()>;

    /// basic.consume
    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<DeliveryStream>;

    /// basic.cancel
    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<()>;

    /// basic.publish without waiting for a confirmation
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<()>;

    /// basic.publish returning a handle for the broker's confirmation
    async fn publish_with_deferred_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<DeferredConfirmation>;

    /// Whether the channel is no longer usable
    fn is_closed(&self) -> bool;
}

/// Fires once when the broker closes a connection
pub struct CloseSignal {
    rx: oneshot::Receiver<Error>,
}

/// Sending half of a [`CloseSignal`]
pub struct CloseNotifier {
    tx: oneshot::Sender<Error>,
}

impl CloseSignal {
    /// Create a connected notifier/signal pair
    pub fn channel() -> (CloseNotifier, CloseSignal) {
        let (tx, rx) = oneshot::channel();
        (CloseNotifier { tx }, CloseSignal { rx })
    }

    /// Wait for the connection to close and return the reason
    ///
    /// A notifier dropped without reporting counts as a close as well: the
    /// protocol library has released the connection.
    pub async fn recv(self) -> Error {
        self.rx
            .await
            .unwrap_or_else(|_| Error::Connect("connection dropped".to_string()))
    }
}

impl CloseNotifier {
    /// Report the close; later calls are impossible by construction
    pub fn notify(self, reason: Error) {
        // The supervisor may already be gone.
        let _ = self.tx.send(reason);
    }
}

/// Acknowledgement methods bound to a single delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// Basic properties shared by deliveries and publishings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Arguments,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

/// A message received by a consumer
///
/// Unless the consumer was attached with `auto_ack`, the handler must call
/// [`ack`](Self::ack), [`nack`](Self::nack) or [`reject`](Self::reject).
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
            body,
            acker,
        }
    }

    pub fn with_routing(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    /// Body as UTF-8
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| Error::Broker(format!("delivery body is not valid UTF-8: {}", e)))
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Broker(format!("failed to deserialize delivery body: {}", e)))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A message to publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publishing {
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: MessageProperties::default(),
            body: body.into(),
        }
    }

    /// UTF-8 text body with `text/plain` content type
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(body.into().into_bytes()).with_content_type("text/plain")
    }

    /// JSON body with `application/json` content type
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::Config(format!("failed to serialize message body: {}", e)))?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Mark the message persistent (delivery mode 2)
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.properties.delivery_mode = Some(if persistent { 2 } else { 1 });
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.properties.expiration = Some(expiration.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.properties.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }
}

/// Broker outcome for a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message
    Ack,
    /// The broker refused the message
    Nack,
    /// The channel is not in confirm mode
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// Pending broker confirmation for one published message
pub struct DeferredConfirmation {
    inner: BoxFuture<'static, Result<Confirmation>>,
}

impl DeferredConfirmation {
    pub fn new(inner: BoxFuture<'static, Result<Confirmation>>) -> Self {
        Self { inner }
    }

    /// A confirmation that is already known
    pub fn ready(confirmation: Confirmation) -> Self {
        Self::new(Box::pin(futures::future::ready(Ok(confirmation))))
    }

    /// Wait for the broker's answer
    pub async fn wait(self) -> Result<Confirmation> {
        self.inner.await
    }
}

impl fmt::Debug for DeferredConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredConfirmation").finish_non_exhaustive()
    }
}
