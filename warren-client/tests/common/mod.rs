//! Common test utilities for warren-client integration tests
//!
//! [`MockBroker`] is an in-memory implementation of the broker seam. It
//! scripts dial outcomes, records every protocol call, feeds deliveries to
//! consumers and can drop the current connection the way a broker restart
//! would.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warren_core::{
    Acknowledger, Arguments, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal,
    Confirmation, ConsumerOptions, DeferredConfirmation, Delivery, DeliveryStream, Error,
    ExchangeOptions, Publishing, Qos, QueueOptions, Result,
};

/// A protocol call observed by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    OpenChannel,
    Qos(Qos),
    ConfirmSelect,
    DeclareExchange(String),
    DeclareQueue(String),
    BindQueue {
        queue: String,
        routing_key: String,
        exchange: String,
    },
    Consume {
        queue: String,
        tag: String,
    },
    Cancel(String),
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
    },
    CloseConnection,
}

/// Protocol step the mock can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue,
    Consume,
    Cancel,
    Publish,
}

struct ConnState {
    closed: AtomicBool,
    notifier: Mutex<Option<CloseNotifier>>,
}

#[derive(Default)]
struct BrokerState {
    dial_script: Mutex<VecDeque<String>>,
    refuse_all: AtomicBool,
    dial_delay: Mutex<Option<Duration>>,
    dials: AtomicU32,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<Op, String>>,
    connections: Mutex<Vec<Arc<ConnState>>>,
    consumers: Mutex<HashMap<String, stream_channel::UnboundedSender<Result<Delivery>>>>,
    next_tag: AtomicU32,
    acks: Arc<Mutex<Vec<String>>>,
    confirmation: Mutex<Option<Confirmation>>,
}

/// In-memory broker
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` dials
    pub fn fail_next_dials(&self, count: usize) {
        let mut script = self.state.dial_script.lock().unwrap();
        for n in 0..count {
            script.push_back(format!("connection refused (scripted failure {})", n + 1));
        }
    }

    /// Refuse every dial from now on
    pub fn refuse_all_dials(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Make every dial take `delay` before answering
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.state.dial_delay.lock().unwrap() = Some(delay);
    }

    /// Fail `op` with a broker error until cleared
    pub fn fail_on(&self, op: Op, message: &str) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(op, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().unwrap().clear();
    }

    /// Outcome reported for confirmed publishes (default `Ack`)
    pub fn set_confirmation(&self, confirmation: Confirmation) {
        *self.state.confirmation.lock().unwrap() = Some(confirmation);
    }

    /// Dial function suitable for `Config::new`
    pub fn dial_fn(
        &self,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<MockConnection>> + Send + Sync + 'static
    {
        let broker = self.clone();
        move || {
            let broker = broker.clone();
            Box::pin(async move { broker.dial().await })
        }
    }

    async fn dial(&self) -> Result<MockConnection> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.dial_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.state.dial_script.lock().unwrap().pop_front();
        if let Some(message) = scripted {
            return Err(Error::Connect(message));
        }
        if self.state.refuse_all.load(Ordering::SeqCst) {
            return Err(Error::connect("connection refused"));
        }

        let conn = Arc::new(ConnState {
            closed: AtomicBool::new(false),
            notifier: Mutex::new(None),
        });
        self.state.connections.lock().unwrap().push(conn.clone());

        Ok(MockConnection {
            broker: self.state.clone(),
            conn,
        })
    }

    pub fn dials(&self) -> u32 {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Calls recorded after the most recent `OpenChannel`
    pub fn calls_since_open(&self) -> Vec<Call> {
        let calls = self.calls();
        let start = calls
            .iter()
            .rposition(|call| *call == Call::OpenChannel)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        calls[start..].to_vec()
    }

    pub fn acks(&self) -> Vec<String> {
        self.state.acks.lock().unwrap().clone()
    }

    /// Push a delivery to the consumer registered under `consumer_tag`
    pub fn deliver(&self, consumer_tag: &str, routing_key: &str, body: &[u8]) -> bool {
        let consumers = self.state.consumers.lock().unwrap();
        let Some(sender) = consumers.get(consumer_tag) else {
            return false;
        };

        let tag = u64::from(self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let delivery = Delivery::new(
            tag,
            body.to_vec(),
            Arc::new(MockAcker {
                tag,
                log: self.state.acks.clone(),
            }),
        )
        .with_routing("mock", routing_key);

        sender.unbounded_send(Ok(delivery)).is_ok()
    }

    pub fn has_consumer(&self, consumer_tag: &str) -> bool {
        self.state.consumers.lock().unwrap().contains_key(consumer_tag)
    }

    /// Simulate the broker dropping the latest connection
    pub fn drop_connection(&self) {
        let latest = self.state.connections.lock().unwrap().last().cloned();
        if let Some(conn) = latest {
            conn.closed.store(true, Ordering::SeqCst);
            // Consumer streams end with their channel.
            self.state.consumers.lock().unwrap().clear();
            let notifier = conn.notifier.lock().unwrap().take();
            if let Some(notifier) = notifier {
                notifier.notify(Error::connect("CONNECTION_FORCED - broker forced connection closure"));
            }
        }
    }

    fn record(state: &BrokerState, call: Call) {
        state.calls.lock().unwrap().push(call);
    }

    fn check(state: &BrokerState, op: Op) -> Result<()> {
        match state.failures.lock().unwrap().get(&op) {
            Some(message) => Err(Error::Broker(message.clone())),
            None => Ok(()),
        }
    }
}

pub struct MockConnection {
    broker: Arc<BrokerState>,
    conn: Arc<ConnState>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        MockBroker::check(&self.broker, Op::OpenChannel)?;
        MockBroker::record(&self.broker, Call::OpenChannel);
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            conn: self.conn.clone(),
            confirm_mode: AtomicBool::new(false),
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        let (notifier, signal) = CloseSignal::channel();
        *self.conn.notifier.lock().unwrap() = Some(notifier);
        signal
    }

    fn is_closed(&self) -> bool {
        self.conn.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        MockBroker::record(&self.broker, Call::CloseConnection);
        self.conn.closed.store(true, Ordering::SeqCst);
        // A client-initiated close does not fire the close signal.
        drop(self.conn.notifier.lock().unwrap().take());
        Ok(())
    }
}

pub struct MockChannel {
    broker: Arc<BrokerState>,
    conn: Arc<ConnState>,
    confirm_mode: AtomicBool,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.conn.closed.load(Ordering::SeqCst) {
            return Err(Error::broker("channel closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn qos(&self, qos: Qos) -> Result<()> {
        self.ensure_open()?;
        MockBroker::record(&self.broker, Call::Qos(qos));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.confirm_mode.store(true, Ordering::SeqCst);
        MockBroker::record(&self.broker, Call::ConfirmSelect);
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeOptions) -> Result<()> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::DeclareExchange)?;
        MockBroker::record(&self.broker, Call::DeclareExchange(exchange.name.clone()));
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueOptions) -> Result<String> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::DeclareQueue)?;
        let name = if queue.name.is_empty() {
            "amq.gen-mock".to_string()
        } else {
            queue.name.clone()
        };
        MockBroker::record(&self.broker, Call::DeclareQueue(name.clone()));
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
        _no_wait: bool,
        _args: &Arguments,
    ) -> Result<()> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::BindQueue)?;
        MockBroker::record(
            &self.broker,
            Call::BindQueue {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
            },
        );
        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<DeliveryStream> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::Consume)?;
        MockBroker::record(
            &self.broker,
            Call::Consume {
                queue: queue.to_string(),
                tag: options.tag.clone(),
            },
        );

        let (tx, rx) = stream_channel::unbounded();
        self.broker
            .consumers
            .lock()
            .unwrap()
            .insert(options.tag.clone(), tx);
        Ok(rx.boxed())
    }

    async fn cancel(&self, consumer_tag: &str, _no_wait: bool) -> Result<()> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::Cancel)?;
        MockBroker::record(&self.broker, Call::Cancel(consumer_tag.to_string()));
        // Dropping the sender ends the consumer's stream.
        self.broker.consumers.lock().unwrap().remove(consumer_tag);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _mandatory: bool,
        _immediate: bool,
        message: Publishing,
    ) -> Result<()> {
        self.ensure_open()?;
        MockBroker::check(&self.broker, Op::Publish)?;
        MockBroker::record(
            &self.broker,
            Call::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: message.body,
            },
        );
        Ok(())
    }

    async fn publish_with_deferred_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<DeferredConfirmation> {
        self.publish(exchange, routing_key, mandatory, immediate, message)
            .await?;

        let confirmation = if self.confirm_mode.load(Ordering::SeqCst) {
            self.broker
                .confirmation
                .lock()
                .unwrap()
                .unwrap_or(Confirmation::Ack)
        } else {
            Confirmation::NotRequested
        };
        Ok(DeferredConfirmation::ready(confirmation))
    }

    fn is_closed(&self) -> bool {
        self.conn.closed.load(Ordering::SeqCst)
    }
}

struct MockAcker {
    tag: u64,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.log.lock().unwrap().push(format!("ack:{}", self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("nack:{}:{}", self.tag, requeue));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("reject:{}:{}", self.tag, requeue));
        Ok(())
    }
}

/// Wait until `condition` holds, polling every millisecond
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_dial_script() {
        let broker = MockBroker::new();
        broker.fail_next_dials(1);
        let dial = broker.dial_fn();

        assert!(dial().await.is_err());
        assert!(dial().await.is_ok());
        assert_eq!(broker.dials(), 2);
    }
}
