//! `lapin` implementation of the broker seam
//!
//! [`dial`] builds a dial function for [`Config::new`](crate::Config::new):
//!
//! ```rust,no_run
//! use warren_client::{amqp, Config, ConnectionManager};
//!
//! let manager = ConnectionManager::new(Config::new(amqp::dial("amqp://127.0.0.1:5672/%2f")));
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use warren_core::{
    Acknowledger, Arguments, BrokerChannel, BrokerConnection, CloseSignal, Confirmation,
    ConsumerOptions, DeferredConfirmation, Delivery, DeliveryStream, Error, ExchangeKind,
    ExchangeOptions, FieldValue, MessageProperties, Publishing, Qos, QueueOptions, Result,
};

/// Dial function connecting to `uri` with default connection properties
pub fn dial(
    uri: impl Into<String>,
) -> impl Fn() -> BoxFuture<'static, Result<LapinConnection>> + Send + Sync + Clone + 'static {
    let uri: Arc<str> = Arc::from(uri.into());
    move || {
        let uri = uri.clone();
        async move { LapinConnection::connect(&uri, ConnectionProperties::default()).await }.boxed()
    }
}

/// A `lapin` connection
pub struct LapinConnection {
    connection: Connection,
}

impl LapinConnection {
    pub async fn connect(uri: &str, properties: ConnectionProperties) -> Result<Self> {
        let connection = Connection::connect(uri, properties)
            .await
            .map_err(Error::connect)?;
        Ok(Self { connection })
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn inner(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(Error::broker)?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    /// lapin keeps one error handler per connection; a later call replaces
    /// the signal returned by an earlier one
    fn close_signal(&self) -> CloseSignal {
        let (notifier, signal) = CloseSignal::channel();
        let mut notifier = Some(notifier);
        self.connection.on_error(move |err| {
            if let Some(notifier) = notifier.take() {
                notifier.notify(Error::connect(err));
            }
        });
        signal
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "connection manager closed")
            .await
            .map_err(Error::connect)
    }
}

/// A `lapin` channel
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn inner(&self) -> &Channel {
        &self.channel
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<lapin::publisher_confirm::PublisherConfirm> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                &message.body,
                to_basic_properties(&message.properties),
            )
            .await
            .map_err(Error::broker)
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, qos: Qos) -> Result<()> {
        if qos.prefetch_size != 0 {
            tracing::debug!(
                prefetch_size = qos.prefetch_size,
                "prefetch_size is not supported by the AMQP client and is ignored"
            );
        }
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(Error::broker)
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(Error::broker)
    }

    async fn declare_exchange(&self, exchange: &ExchangeOptions) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                to_exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                },
                to_field_table(&exchange.args),
            )
            .await
            .map_err(Error::broker)
    }

    async fn declare_queue(&self, queue: &QueueOptions) -> Result<String> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                to_field_table(&queue.args),
            )
            .await
            .map_err(Error::broker)?;

        // A no-wait declare returns no name; fall back to the requested one.
        let name = declared.name().as_str();
        Ok(if name.is_empty() {
            queue.name.clone()
        } else {
            name.to_string()
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        no_wait: bool,
        args: &Arguments,
    ) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: no_wait },
                to_field_table(args),
            )
            .await
            .map_err(Error::broker)
    }

    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                to_field_table(&options.args),
            )
            .await
            .map_err(Error::broker)?;

        Ok(consumer
            .map(|delivery| delivery.map(from_lapin_delivery).map_err(Error::broker))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str, no_wait: bool) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: no_wait })
            .await
            .map_err(Error::broker)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<()> {
        self.basic_publish(exchange, routing_key, mandatory, immediate, message)
            .await
            .map(|_| ())
    }

    async fn publish_with_deferred_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<DeferredConfirmation> {
        let confirm = self
            .basic_publish(exchange, routing_key, mandatory, immediate, message)
            .await?;

        Ok(DeferredConfirmation::new(
            async move {
                use lapin::publisher_confirm::Confirmation as Lapin;
                match confirm.await.map_err(Error::broker)? {
                    Lapin::Ack(_) => Ok(Confirmation::Ack),
                    Lapin::Nack(_) => Ok(Confirmation::Nack),
                    Lapin::NotRequested => Ok(Confirmation::NotRequested),
                }
            }
            .boxed(),
        ))
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(Error::broker)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(Error::broker)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(Error::broker)
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    )
    .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str())
    .with_redelivered(delivery.redelivered)
    .with_properties(properties)
}

fn to_exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
    }
}

fn to_field_table(args: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
        FieldValue::Float(f) => AMQPValue::Double(*f),
        FieldValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
    }
}

fn from_field_table(table: &FieldTable) -> Arguments {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| from_amqp_value(value).map(|v| (key.as_str().to_string(), v)))
        .collect()
}

/// Nested tables, arrays and decimals have no `FieldValue` counterpart and are dropped
fn from_amqp_value(value: &AMQPValue) -> Option<FieldValue> {
    Some(match value {
        AMQPValue::Boolean(b) => FieldValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
        AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
        AMQPValue::Timestamp(t) => FieldValue::Int(*t as i64),
        AMQPValue::Float(f) => FieldValue::Float(f64::from(*f)),
        AMQPValue::Double(f) => FieldValue::Float(*f),
        AMQPValue::ShortString(s) => FieldValue::Str(s.as_str().to_string()),
        AMQPValue::LongString(s) => FieldValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => return None,
    })
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(content_encoding) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(content_encoding.as_str()));
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.as_str()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.as_str()));
    }

    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    MessageProperties {
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        delivery_mode: *basic.delivery_mode(),
        priority: *basic.priority(),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        message_id: text(basic.message_id()),
        timestamp: *basic.timestamp(),
        app_id: text(basic.app_id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(
            to_exchange_kind(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
        match to_exchange_kind(&ExchangeKind::Custom("x-delayed-message".to_string())) {
            lapin::ExchangeKind::Custom(name) => assert_eq!(name, "x-delayed-message"),
            other => panic!("Expected custom exchange kind, got: {:?}", other),
        }
    }

    #[test]
    fn test_field_table_conversion() {
        let mut args = Arguments::new();
        args.insert("x-max-priority".to_string(), FieldValue::Int(10));
        args.insert("x-queue-mode".to_string(), FieldValue::from("lazy"));
        args.insert("x-single-active-consumer".to_string(), FieldValue::Bool(true));

        let table = to_field_table(&args);
        assert_eq!(table.inner().len(), 3);
        assert_eq!(from_field_table(&table), args);
    }

    #[test]
    fn test_basic_properties_conversion() {
        let message = Publishing::text("hello")
            .with_persistent(true)
            .with_priority(3)
            .with_message_id("m-1")
            .with_timestamp(1_700_000_000)
            .with_header("x-tenant", "acme");

        let basic = to_basic_properties(&message.properties);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(*basic.priority(), Some(3));

        let back = from_basic_properties(&basic);
        assert_eq!(back, message.properties);
    }

    #[test]
    fn test_dial_function_is_reusable() {
        let dial = dial("amqp://127.0.0.1:5672/%2f");
        let again = dial.clone();
        // Building the futures does not connect yet.
        drop(dial());
        drop(again());
    }
}
