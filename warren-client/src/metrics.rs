//! OpenTelemetry instruments for connection managers and attachments
//!
//! # Metrics Collected
//!
//! - **warren.connection.state**: current [`ConnectionState`] as a gauge
//!   (0=idle, 1=connecting, 2=connected, 3=reconnecting, 4=closed)
//! - **warren.dial.attempts**: dials performed, by outcome
//! - **warren.reconnections**: connections re-established after a drop
//! - **warren.failures.terminal**: supervision loops that gave up
//! - **warren.publishes**: publishes, by exchange and outcome
//! - **warren.publish.duration**: publish latency in seconds
//! - **warren.deliveries**: deliveries handed to consumer handlers
//! - **warren.consumer.cancels**: consumer cancellations, by outcome
//! - **warren.errors**: errors by kind
//!
//! Instruments are recorded only when a manager is configured with
//! [`Config::with_metrics`](crate::Config::with_metrics). Export goes through
//! whatever global meter provider is installed, usually by
//! `warren_core::init_observability`.

use crate::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};
use std::time::Duration;
use warren_core::Error;

/// Client-side metrics for one or more connection managers
pub struct ClientMetrics {
    pub connection_state: Gauge<i64>,
    pub dial_attempts: Counter<u64>,
    pub reconnections: Counter<u64>,
    pub terminal_failures: Counter<u64>,
    pub publishes: Counter<u64>,
    pub publish_duration: Histogram<f64>,
    pub deliveries: Counter<u64>,
    pub consumer_cancels: Counter<u64>,
    pub errors: Counter<u64>,
}

impl ClientMetrics {
    /// Instruments on the global meter named `warren`
    pub fn new() -> Self {
        Self::new_with_meter(&global::meter("warren"))
    }

    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("warren.connection.state")
                .with_description(
                    "Connection state (0=idle, 1=connecting, 2=connected, 3=reconnecting, 4=closed)",
                )
                .build(),
            dial_attempts: meter
                .u64_counter("warren.dial.attempts")
                .with_description("Total number of dial attempts")
                .build(),
            reconnections: meter
                .u64_counter("warren.reconnections")
                .with_description("Connections re-established after a drop")
                .build(),
            terminal_failures: meter
                .u64_counter("warren.failures.terminal")
                .with_description("Supervision loops that stopped retrying")
                .build(),
            publishes: meter
                .u64_counter("warren.publishes")
                .with_description("Total number of publishes")
                .build(),
            publish_duration: meter
                .f64_histogram("warren.publish.duration")
                .with_description("Publish duration in seconds")
                .with_unit("s")
                .build(),
            deliveries: meter
                .u64_counter("warren.deliveries")
                .with_description("Deliveries handed to consumer handlers")
                .build(),
            consumer_cancels: meter
                .u64_counter("warren.consumer.cancels")
                .with_description("Consumer cancellations")
                .build(),
            errors: meter
                .u64_counter("warren.errors")
                .with_description("Total number of errors encountered")
                .build(),
        }
    }

    pub fn update_connection_state(&self, state: ConnectionState) {
        self.connection_state.record(state.gauge_value(), &[]);
    }

    pub fn record_dial(&self, success: bool) {
        self.dial_attempts
            .add(1, &[KeyValue::new("outcome", outcome(success))]);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.add(1, &[]);
    }

    pub fn record_terminal_failure(&self, error: &Error) {
        self.terminal_failures
            .add(1, &[KeyValue::new("error_type", error_kind(error))]);
    }

    pub fn record_publish(&self, exchange: &str, success: bool, duration: Duration) {
        let attributes = &[
            KeyValue::new("exchange", exchange.to_string()),
            KeyValue::new("outcome", outcome(success)),
        ];
        self.publishes.add(1, attributes);
        self.publish_duration.record(duration.as_secs_f64(), attributes);
    }

    pub fn record_delivery(&self, consumer_tag: &str) {
        self.deliveries
            .add(1, &[KeyValue::new("consumer_tag", consumer_tag.to_string())]);
    }

    pub fn record_consumer_cancel(&self, consumer_tag: &str, success: bool) {
        self.consumer_cancels.add(
            1,
            &[
                KeyValue::new("consumer_tag", consumer_tag.to_string()),
                KeyValue::new("outcome", outcome(success)),
            ],
        );
    }

    pub fn record_error(&self, error: &Error) {
        self.errors
            .add(1, &[KeyValue::new("error_type", error_kind(error))]);
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Config(_) => "config",
        Error::Connect(_) => "connect",
        Error::MaxAttempts { .. } => "max_attempts",
        Error::Attach { .. } => "attach",
        Error::Cancel(_) => "cancel",
        Error::NotConnected => "not_connected",
        Error::Cancelled => "cancelled",
        Error::Closed => "closed",
        Error::AlreadyRunning => "already_running",
        Error::Broker(_) => "broker",
    }
}
