//! Supervised AMQP connections
//!
//! This crate keeps one broker connection alive for a process and lets
//! consumers and producers attach to it:
//!
//! - **ConnectionManager**: dials, prepares the default channel, reconnects
//!   according to a [`RetryPolicy`] and exposes its [`ConnectionState`]
//! - **ConsumerAttachment**: declares topology, consumes, runs a handler task,
//!   cancels cleanly
//! - **ProducerAttachment**: declares topology and publishes, optionally with
//!   publisher confirms
//! - **amqp**: the `lapin`-backed dial function and broker adapter
//! - **Observability**: `tracing` events for every lifecycle step and optional
//!   OpenTelemetry [`ClientMetrics`]
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use warren_client::{amqp, Config, ConnectionManager, ConsumerAttachment, RetryPolicy};
//! use warren_core::{ConsumerOptions, ExchangeKind, ExchangeOptions, QueueOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new(amqp::dial("amqp://127.0.0.1:5672/%2f"))
//!         .with_retry_policy(RetryPolicy::unbounded(Duration::from_secs(1)))
//!         .with_on_connect(|manager| async move {
//!             let options = ConsumerOptions::new(
//!                 "greeter",
//!                 ExchangeOptions::new("greetings", ExchangeKind::Direct),
//!                 QueueOptions::new("greetings.inbox").with_routing_key("hello"),
//!             );
//!             let attached = ConsumerAttachment::attach(&manager, options, |mut deliveries| async move {
//!                 while let Some(delivery) = deliveries.next().await {
//!                     let delivery = delivery?;
//!                     println!("{}", delivery.body_str()?);
//!                     delivery.ack().await?;
//!                 }
//!                 Ok(())
//!             })
//!             .await;
//!             if let Err(err) = attached {
//!                 tracing::error!(error = %err, "attach failed");
//!             }
//!         });
//!
//!     let manager = ConnectionManager::new(config);
//!     let shutdown = CancellationToken::new();
//!     let err = manager.run(shutdown.clone()).await;
//!     println!("supervision ended: {}", err);
//!     Ok(())
//! }
//! ```

pub mod amqp;
mod config;
mod connection_state;
mod consumer;
mod manager;
mod metrics;
mod producer;
mod retry;

pub use config::{Config, ConfigBuilder, DialFn, DialFuture, OnConnect};
pub use connection_state::ConnectionState;
pub use consumer::{CancelErrors, ConsumerAttachment};
pub use manager::ConnectionManager;
pub use metrics::ClientMetrics;
pub use producer::ProducerAttachment;
pub use retry::{ErrorListener, RetryPolicy};
