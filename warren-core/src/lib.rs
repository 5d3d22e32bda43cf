//! Core types for warren
//!
//! This crate holds everything the client crate and its users share without
//! depending on a particular AMQP library:
//!
//! - **Error handling**: [`Error`] and [`AttachStep`]
//! - **Options**: exchange, queue, consumer, producer and QoS settings
//! - **Broker seam**: the [`BrokerConnection`]/[`BrokerChannel`] traits and the
//!   message types that cross them
//! - **Observability**: OpenTelemetry and `tracing` setup
//!
//! # Example
//!
//! ```rust
//! use warren_core::{ExchangeKind, ExchangeOptions, ProducerOptions, Publishing};
//!
//! let options = ProducerOptions::new(ExchangeOptions::new("orders", ExchangeKind::Direct));
//! assert!(options.validate().is_ok());
//!
//! let message = Publishing::text("order #17 shipped").with_persistent(true);
//! assert_eq!(message.properties.delivery_mode, Some(2));
//! ```

pub mod broker;
pub mod error;
pub mod observability;
pub mod options;

pub use broker::{
    Acknowledger, BrokerChannel, BrokerConnection, CloseNotifier, CloseSignal, Confirmation,
    DeferredConfirmation, Delivery, DeliveryStream, MessageProperties, Publishing,
};
pub use error::{AttachStep, Error, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use options::{
    Arguments, ConsumerOptions, ExchangeKind, ExchangeOptions, FieldValue, ProducerOptions, Qos,
    QueueOptions,
};
