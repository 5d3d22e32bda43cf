//! Topology and QoS options
//!
//! Plain value objects describing what a consumer or producer declares on the
//! broker when it attaches. They carry no behavior besides builder methods and
//! [`validate`](ExchangeOptions::validate).
//!
//! All option types implement `Serialize`/`Deserialize`, so a host process can
//! keep its topology in whatever configuration format it already loads.
//!
//! # Examples
//!
//! ```rust
//! use warren_core::{ConsumerOptions, ExchangeKind, ExchangeOptions, QueueOptions};
//!
//! let options = ConsumerOptions::new(
//!     "billing-worker",
//!     ExchangeOptions::new("billing", ExchangeKind::Topic).with_durable(true),
//!     QueueOptions::new("billing.invoices")
//!         .with_routing_key("invoice.*")
//!         .with_durable(true),
//! );
//! assert!(options.validate().is_ok());
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Extra `x-` arguments passed along with declare, bind and consume methods
pub type Arguments = BTreeMap<String, FieldValue>;

/// A value in an [`Arguments`] table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Exchange type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin-provided exchange types such as `x-delayed-message`
    Custom(String),
}

impl ExchangeKind {
    /// Name of the exchange type as sent on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl ExchangeOptions {
    /// Create a non-durable exchange declaration
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            args: Arguments::new(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }

    /// The default (nameless) exchange cannot be declared, so the name is required.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("exchange name cannot be empty".to_string()));
        }
        if let ExchangeKind::Custom(kind) = &self.kind {
            if kind.is_empty() {
                return Err(Error::Config("custom exchange kind cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Queue declaration and the routing key used to bind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Queue name; empty asks the broker to generate one
    pub name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_key: String::new(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            args: Arguments::new(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }
}

/// Everything a consumer attach declares and consumes
///
/// The exchange and queue descriptors are required at construction, so an
/// attach can never run with half of its topology missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Consumer tag, also used to cancel the consumer
    pub tag: String,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub no_local: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: Arguments,
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
}

impl ConsumerOptions {
    pub fn new(tag: impl Into<String>, exchange: ExchangeOptions, queue: QueueOptions) -> Self {
        Self {
            tag: tag.into(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            args: Arguments::new(),
            exchange,
            queue,
        }
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }

    /// The tag must be set: it is the only handle for cancelling the consumer.
    pub fn validate(&self) -> Result<()> {
        if self.tag.is_empty() {
            return Err(Error::Config("consumer tag cannot be empty".to_string()));
        }
        self.exchange.validate()
    }
}

/// Topology a producer declares before publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerOptions {
    pub exchange: ExchangeOptions,
    /// Optional queue declared and bound to the exchange
    #[serde(default)]
    pub queue: Option<QueueOptions>,
}

impl ProducerOptions {
    pub fn new(exchange: ExchangeOptions) -> Self {
        Self {
            exchange,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.exchange.validate()
    }
}

/// Prefetch settings applied to every channel the manager opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    pub prefetch_count: u16,
    /// Prefetch window in bytes; 0 means no limit
    #[serde(default)]
    pub prefetch_size: u32,
    #[serde(default)]
    pub global: bool,
}

impl Qos {
    pub fn new(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            prefetch_size: 0,
            global: false,
        }
    }

    pub fn with_prefetch_size(mut self, prefetch_size: u32) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    pub fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }
}
