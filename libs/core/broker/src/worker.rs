//! Processor loop on top of a [`Subscription`].
//!
//! Success acks. Permanent failures are rejected without requeue, so they
//! reach the queue's dead-letter exchange if it has one. Transient and
//! rate-limited failures are requeued after a backoff until their category's
//! retry budget is used up, then rejected without requeue.

use crate::consumer::Subscription;
use crate::error::{ErrorCategory, ProcessingError};
use crate::message::Delivery;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Handles one delivery at a time.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// Used in logs.
    fn name(&self) -> &'static str;
}

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub requeued: u64,
    pub rejected: u64,
}

pub struct ConsumerWorker<P: Processor> {
    subscription: Subscription,
    processor: P,
    max_backoff: Duration,
}

impl<P: Processor> ConsumerWorker<P> {
    pub fn new(subscription: Subscription, processor: P) -> Self {
        Self {
            subscription,
            processor,
            max_backoff: Duration::from_secs(120),
        }
    }

    /// Cap the backoff applied before a requeue.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Process deliveries until `shutdown` flips to `true` or the consumer is
    /// cancelled. Dropping the worker afterwards cancels the consumer and
    /// requeues anything still unacknowledged.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(
            queue = %self.subscription.queue(),
            consumer = %self.subscription.consumer_tag(),
            processor = self.processor.name(),
            "Starting consumer worker"
        );

        loop {
            let delivery = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping worker");
                        break;
                    }
                    continue;
                }
                delivery = self.subscription.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.handle(delivery, &mut stats).await;
        }

        info!(
            consumer = %self.subscription.consumer_tag(),
            processed = stats.processed,
            requeued = stats.requeued,
            rejected = stats.rejected,
            "Consumer worker stopped"
        );
        stats
    }

    async fn handle(&self, delivery: Delivery, stats: &mut WorkerStats) {
        let redeliveries = delivery.delivery_count();
        debug!(
            queue = %delivery.queue,
            tag = delivery.tag,
            offset = delivery.offset,
            redeliveries,
            "Processing delivery"
        );

        let settled = match self.processor.process(&delivery).await {
            Ok(()) => {
                stats.processed += 1;
                self.subscription.ack(&delivery)
            }
            Err(e) => {
                let category = e.category();
                if category != ErrorCategory::Permanent && e.should_retry(redeliveries) {
                    let delay = Duration::from_millis(e.backoff_delay_ms(redeliveries))
                        .min(self.max_backoff);
                    warn!(
                        tag = delivery.tag,
                        error = %e,
                        category = %category,
                        redeliveries,
                        delay_ms = delay.as_millis() as u64,
                        "Processing failed, requeueing"
                    );
                    tokio::time::sleep(delay).await;
                    stats.requeued += 1;
                    self.subscription.reject(&delivery, true)
                } else {
                    warn!(
                        tag = delivery.tag,
                        error = %e,
                        category = %category,
                        redeliveries,
                        "Processing failed, rejecting"
                    );
                    stats.rejected += 1;
                    self.subscription.reject(&delivery, false)
                }
            }
        };

        if let Err(e) = settled {
            error!(tag = delivery.tag, error = %e, "Failed to settle delivery");
        }
    }
}
