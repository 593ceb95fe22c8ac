//! Settlement of deliveries: ack, reject with requeue, reject to dead-letter.
//!
//! ```text
//! Delivered ──ack──────────────▶ Acked      (classic: deleted, stream: committed)
//!     │
//!     └──reject──┬─requeue────▶ Requeued   (pending again, delivery_count + 1)
//!                ├─DLX set────▶ DeadLettered (x-death appended, routed via DLX)
//!                └─no DLX─────▶ Dropped
//! ```
//!
//! The queue-side transition happens under the queue lock. Routing a
//! dead-lettered message is done by the broker after the lock is released.

use crate::error::{BrokerError, Result};
use crate::message::{DeathReason, DeathRecord, DeliveryTag, Message};
use crate::queue::{DeadLetterConfig, Log, QueueState};
use chrono::{DateTime, Utc};

/// Queue-side result of a reject.
#[derive(Debug)]
pub(crate) enum Rejection {
    Requeued,
    /// Removed from the consumer's window; dead-letter it or drop it.
    Discarded(Option<Message>),
}

impl QueueState {
    fn take_unacked(&mut self, consumer_tag: &str, tag: DeliveryTag) -> Result<u64> {
        self.consumers
            .get_mut(consumer_tag)
            .and_then(|consumer| consumer.unacked.remove(&tag))
            .ok_or_else(|| BrokerError::unknown_tag(consumer_tag, tag))
    }

    /// Acknowledge one delivery. Unknown tags leave the state untouched.
    pub(crate) fn ack(&mut self, consumer_tag: &str, tag: DeliveryTag) -> Result<u64> {
        let offset = self.take_unacked(consumer_tag, tag)?;
        match &mut self.log {
            Log::Classic(log) => {
                log.remove(offset);
            }
            Log::Stream(_) => {
                if let Some(cursor) = self
                    .consumers
                    .get_mut(consumer_tag)
                    .and_then(|consumer| consumer.stream.as_mut())
                {
                    cursor.commit(offset);
                }
            }
        }
        Ok(offset)
    }

    /// Reject one delivery.
    ///
    /// On a stream the message stays in the log either way; a requeue makes the
    /// same consumer read it again before moving on.
    pub(crate) fn reject(
        &mut self,
        consumer_tag: &str,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<Rejection> {
        let offset = self.take_unacked(consumer_tag, tag)?;
        let QueueState { log, consumers, .. } = self;

        match log {
            Log::Classic(log) if requeue => {
                log.requeue(offset);
                Ok(Rejection::Requeued)
            }
            Log::Classic(log) => Ok(Rejection::Discarded(
                log.remove(offset).map(|stored| stored.message),
            )),
            Log::Stream(log) => {
                let cursor = consumers
                    .get_mut(consumer_tag)
                    .and_then(|consumer| consumer.stream.as_mut());
                if requeue {
                    if let Some(cursor) = cursor {
                        cursor.requeue(offset);
                    }
                    return Ok(Rejection::Requeued);
                }
                let redeliveries = cursor.map_or(0, |cursor| {
                    let count = cursor.redeliveries.get(&offset).copied().unwrap_or(0);
                    cursor.forget(offset);
                    count
                });
                Ok(Rejection::Discarded(log.get(offset).map(|stored| {
                    let mut message = stored.message.clone();
                    message.delivery_count = redeliveries;
                    message
                })))
            }
        }
    }
}

/// Rewrite a rejected message for republishing through its queue's DLX.
///
/// Appends one `x-death` entry, switches to the dead-letter routing key when
/// one is configured (keeping the old key in `x-original-routing-key`), and
/// resets the per-queue delivery count.
pub(crate) fn dead_letter(
    mut message: Message,
    queue: &str,
    target: &DeadLetterConfig,
    now: DateTime<Utc>,
) -> Message {
    let prior = message.headers.death_count(queue, DeathReason::Rejected);
    message.headers.death.push(DeathRecord {
        reason: DeathReason::Rejected,
        queue: queue.to_string(),
        count: prior + 1,
        time: now,
        exchange: message.exchange.clone(),
        routing_keys: vec![message.routing_key.clone()],
    });

    if let Some(key) = &target.routing_key {
        if *key != message.routing_key {
            if message.headers.original_routing_key.is_none() {
                message.headers.original_routing_key = Some(message.routing_key.clone());
            }
            message.routing_key = key.clone();
        }
    }

    message.exchange = target.exchange.clone();
    message.delivery_count = 0;
    message
}
