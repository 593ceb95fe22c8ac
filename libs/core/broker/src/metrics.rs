//! Broker metrics, emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding process installs a recorder
//! (the demo binary installs the Prometheus exporter).

use crate::exchange::RouteResult;
use metrics::{counter, gauge};

/// Record the outcome of routing one publish.
pub fn record_route(exchange: &str, result: &RouteResult) {
    let exchange = if exchange.is_empty() { "(default)" } else { exchange };
    counter!(
        "broker_messages_published_total",
        "exchange" => exchange.to_string(),
        "outcome" => result.outcome()
    )
    .increment(1);
}

/// Per-queue metrics helper.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
        }
    }

    pub fn message_enqueued(&self, bytes: u64) {
        counter!("broker_messages_enqueued_total", "queue" => self.queue.clone()).increment(1);
        counter!("broker_enqueued_bytes_total", "queue" => self.queue.clone()).increment(bytes);
    }

    pub fn message_delivered(&self, redelivered: bool) {
        counter!(
            "broker_messages_delivered_total",
            "queue" => self.queue.clone(),
            "redelivered" => if redelivered { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn message_acked(&self) {
        counter!("broker_messages_acked_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn message_rejected(&self, requeue: bool) {
        counter!(
            "broker_messages_rejected_total",
            "queue" => self.queue.clone(),
            "requeue" => if requeue { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn message_dead_lettered(&self) {
        counter!("broker_messages_dead_lettered_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn messages_evicted(&self, count: usize) {
        counter!("broker_messages_evicted_total", "queue" => self.queue.clone())
            .increment(count as u64);
    }

    pub fn set_depth(&self, ready: usize, unacked: usize) {
        gauge!("broker_queue_messages_ready", "queue" => self.queue.clone()).set(ready as f64);
        gauge!("broker_queue_messages_unacked", "queue" => self.queue.clone()).set(unacked as f64);
    }
}
