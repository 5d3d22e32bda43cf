//! Consumer example
//!
//! Keeps a consumer attached across broker restarts: the on-connect hook
//! re-attaches it after every reconnect.
//!
//! Run with: cargo run --example consumer
//! Then publish to the `greetings` exchange with routing key `hello`.

use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren::client::amqp;
use warren::core::{ConsumerOptions, ExchangeKind, ExchangeOptions, Qos, QueueOptions};
use warren::{Config, ConnectionManager, ConsumerAttachment, RetryPolicy};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let uri = std::env::var("AMQP_URI").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string());
    let shutdown = CancellationToken::new();
    let hook_shutdown = shutdown.clone();

    let policy = RetryPolicy::unbounded(Duration::from_secs(1)).with_error_listener(|err| {
        tracing::warn!(error = %err, "Broker connection problem");
    });

    let config = Config::new(amqp::dial(uri))
        .with_retry_policy(policy)
        .with_qos(Qos::new(10))
        .with_on_connect(move |manager| {
            let shutdown = hook_shutdown.clone();
            async move {
                let options = ConsumerOptions::new(
                    "greeter",
                    ExchangeOptions::new("greetings", ExchangeKind::Direct).with_durable(true),
                    QueueOptions::new("greetings.inbox")
                        .with_routing_key("hello")
                        .with_durable(true),
                );

                let attached = ConsumerAttachment::attach(&manager, options, |mut deliveries| async move {
                    while let Some(delivery) = deliveries.next().await {
                        let delivery = delivery?;
                        match delivery.body_str() {
                            Ok(text) => println!("[{}] {}", delivery.routing_key, text),
                            Err(_) => println!("[{}] {} bytes", delivery.routing_key, delivery.body.len()),
                        }
                        delivery.ack().await?;
                    }
                    Ok(())
                })
                .await;

                match attached {
                    Ok(consumer) => {
                        // Drained on Ctrl+C; the receiver only matters for logging.
                        let mut errors = consumer.bind_to_cancellation(shutdown);
                        tokio::spawn(async move {
                            if let Some(err) = errors.recv().await {
                                tracing::warn!(error = %err, "Consumer cancel failed");
                            }
                        });
                    }
                    Err(err) => tracing::error!(error = %err, "Failed to attach consumer"),
                }
            }
        });

    let manager = ConnectionManager::new(config);

    let supervisor = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };

    println!("Waiting for messages, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    shutdown.cancel();

    let reason = supervisor.await?;
    println!("Supervision ended: {}", reason);

    Ok(())
}
