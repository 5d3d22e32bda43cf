//! Producer example
//!
//! Publishes a greeting every second with publisher confirms, exporting
//! traces and client metrics over OTLP.
//!
//! Run with: cargo run --example producer

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren::client::{amqp, ClientMetrics};
use warren::core::{ExchangeKind, ExchangeOptions, ObservabilityConfig, ProducerOptions, Publishing};
use warren::{Config, ConnectionManager, ProducerAttachment, RetryPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_config = ObservabilityConfig::new("warren-producer")
        .with_endpoint("http://localhost:4317")
        .with_log_level("info");
    warren::core::init_observability(otel_config)?;

    let uri = std::env::var("AMQP_URI").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string());
    let manager = ConnectionManager::new(
        Config::new(amqp::dial(uri))
            .with_retry_policy(RetryPolicy::unbounded(Duration::from_secs(1)))
            .with_publisher_confirms(true)
            .with_metrics(Arc::new(ClientMetrics::new())),
    );

    let shutdown = CancellationToken::new();
    manager.start(shutdown.clone()).await?;

    let options = ProducerOptions::new(
        ExchangeOptions::new("greetings", ExchangeKind::Direct).with_durable(true),
    );
    let mut producer = ProducerAttachment::attach(&manager, options.clone()).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }

        sequence += 1;
        let message = Publishing::text(format!("hello #{}", sequence))
            .with_persistent(true)
            .with_message_id(sequence.to_string());

        let confirm = match producer
            .publish_with_deferred_confirm(&shutdown, "hello", false, false, message)
            .await
        {
            Ok(confirm) => confirm,
            Err(warren::Error::NotConnected) => {
                // The connection was replaced; attach to the new one once it is up.
                if let Ok(fresh) = ProducerAttachment::attach(&manager, options.clone()).await {
                    producer = fresh;
                }
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Publish failed");
                continue;
            }
        };

        match confirm.wait().await {
            Ok(outcome) => println!("#{} -> {:?}", sequence, outcome),
            Err(err) => tracing::warn!(error = %err, "Confirmation lost"),
        }
    }

    shutdown.cancel();
    manager.close().await?;
    println!("Supervision ended: {}", manager.wait().await);

    // Give time for telemetry to flush
    tokio::time::sleep(Duration::from_secs(2)).await;
    warren::core::shutdown_observability();

    Ok(())
}
