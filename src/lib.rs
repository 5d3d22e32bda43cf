//! Warren - supervised AMQP connections
//!
//! This is the main convenience crate that re-exports the warren sub-crates.
//! Use it when a single dependency covering the connection manager, the
//! attachments and the core types is all you need.
//!
//! # Architecture
//!
//! - **warren-core**: errors, topology options, the broker seam and observability setup
//! - **warren-client**: connection manager, retry policy, consumer and producer
//!   attachments, and the `lapin` adapter
//!
//! # Quick Start - Producer
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use warren::client::amqp;
//! use warren::core::{ExchangeKind, ExchangeOptions, ProducerOptions, Publishing};
//! use warren::{Config, ConnectionManager, ProducerAttachment, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::new(
//!         Config::new(amqp::dial("amqp://127.0.0.1:5672/%2f"))
//!             .with_retry_policy(RetryPolicy::new(5, Duration::from_secs(2))),
//!     );
//!     manager.start(CancellationToken::new()).await?;
//!
//!     let options = ProducerOptions::new(ExchangeOptions::new("greetings", ExchangeKind::Direct));
//!     let producer = ProducerAttachment::attach(&manager, options).await?;
//!     producer
//!         .publish(&CancellationToken::new(), "hello", false, false, Publishing::text("hi"))
//!         .await?;
//!
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

// Re-export the sub-crates so everything is reachable through `warren::`
pub use warren_client as client;
pub use warren_core as core;

// Convenience re-exports of the most commonly used types
pub use warren_client::{
    Config, ConnectionManager, ConnectionState, ConsumerAttachment, ProducerAttachment, RetryPolicy,
};
pub use warren_core::{Error, Result};
