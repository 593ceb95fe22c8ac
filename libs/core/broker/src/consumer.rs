//! Consumers and the per-consumer delivery scheduler.
//!
//! Each subscription gets one scheduler task. The task dispatches from the
//! queue while the consumer's unacked set is below its prefetch limit, pushes
//! the deliveries into a bounded channel, and parks on the queue's notifier
//! when there is nothing to send or the window is full. Acks, rejects, new
//! messages and cancellations all wake it.
//!
//! A dispatched delivery stays in the consumer's unacked set until it is
//! settled. Auto-ack consumers settle when [`Subscription::recv`] hands the
//! delivery over, so whatever is still buffered in the channel when the
//! consumer goes away is requeued like any other unacked message.

use crate::broker::BrokerInner;
use crate::error::{BrokerError, Result};
use crate::message::{Delivery, DeliveryTag, Message};
use crate::queue::{Log, Queue, QueueState};
use crate::stream::{StreamLog, StreamOffset};
use chrono::Utc;
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscription parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Maximum unacknowledged deliveries; 0 means unbounded.
    pub prefetch: u16,
    pub manual_ack: bool,
    /// Starting position, stream queues only.
    pub offset: Option<StreamOffset>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
            prefetch: 0,
            manual_ack: true,
            offset: None,
        }
    }
}

impl ConsumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_manual_ack(mut self, manual_ack: bool) -> Self {
        self.manual_ack = manual_ack;
        self
    }

    pub fn with_offset(mut self, offset: StreamOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Capacity of the delivery channel between scheduler and subscription.
    pub(crate) fn channel_capacity(&self, unbounded_buffer: usize) -> usize {
        match self.prefetch {
            0 => unbounded_buffer.max(1),
            n => usize::from(n),
        }
    }

    /// Most unsettled deliveries the consumer may hold. Manual-ack consumers
    /// without a prefetch are unbounded; auto-ack consumers never hold more
    /// than their channel can buffer.
    fn in_flight_limit(&self, unbounded_buffer: usize) -> Option<usize> {
        match (self.manual_ack, self.prefetch) {
            (true, 0) => None,
            _ => Some(self.channel_capacity(unbounded_buffer)),
        }
    }

    pub(crate) fn validate(&self, queue: &Queue) -> Result<()> {
        if self.consumer_tag.is_empty() {
            return Err(BrokerError::invalid("consumer tag must not be empty"));
        }
        if queue.options().is_stream() {
            if !self.manual_ack {
                return Err(BrokerError::invalid("stream consumers must acknowledge manually"));
            }
            if self.prefetch == 0 {
                return Err(BrokerError::invalid("stream consumers need a prefetch limit"));
            }
        } else if self.offset.is_some() {
            return Err(BrokerError::invalid("start offsets apply to stream queues only"));
        }
        Ok(())
    }
}

/// Read position of a stream consumer.
#[derive(Debug, Default)]
pub(crate) struct StreamCursor {
    pub(crate) next: u64,
    /// Requeued offsets, delivered before the cursor moves on.
    pub(crate) redeliver: BTreeSet<u64>,
    /// This consumer's redelivery count per offset. The shared log is never
    /// touched, so other readers of the stream are unaffected.
    pub(crate) redeliveries: BTreeMap<u64, u32>,
    /// Highest acknowledged offset.
    pub(crate) committed: Option<u64>,
}

impl StreamCursor {
    fn advance(&mut self, log: &StreamLog) -> Option<(u64, Message)> {
        while let Some(offset) = self.redeliver.pop_first() {
            if let Some(stored) = log.get(offset) {
                let mut message = stored.message.clone();
                message.delivery_count = self.redeliveries.get(&offset).copied().unwrap_or(0);
                return Some((offset, message));
            }
            self.redeliveries.remove(&offset);
        }

        // a reader that fell behind retention resumes at the oldest retained message
        if let Some(first) = log.first_offset() {
            self.next = self.next.max(first);
        }
        let stored = log.get(self.next)?;
        self.next += 1;
        Some((stored.offset, stored.message.clone()))
    }

    pub(crate) fn commit(&mut self, offset: u64) {
        self.committed = Some(self.committed.map_or(offset, |c| c.max(offset)));
        self.redeliveries.remove(&offset);
    }

    /// Read `offset` again before moving on.
    pub(crate) fn requeue(&mut self, offset: u64) {
        *self.redeliveries.entry(offset).or_default() += 1;
        self.redeliver.insert(offset);
    }

    /// Drop redelivery bookkeeping for an offset settled without a commit.
    pub(crate) fn forget(&mut self, offset: u64) {
        self.redeliveries.remove(&offset);
    }
}

/// Consumer bookkeeping held inside its queue's state.
#[derive(Debug)]
pub(crate) struct ConsumerState {
    /// `None` is unbounded.
    limit: Option<usize>,
    last_tag: DeliveryTag,
    pub(crate) unacked: BTreeMap<DeliveryTag, u64>,
    pub(crate) stream: Option<StreamCursor>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.limit.is_none_or(|limit| self.unacked.len() < limit)
    }
}

impl QueueState {
    /// Register a consumer, resolving its start offset on stream queues.
    pub(crate) fn attach(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
        unbounded_buffer: usize,
    ) -> Result<()> {
        let stream = match &self.log {
            Log::Classic(_) => None,
            Log::Stream(log) => Some(StreamCursor {
                next: log.cursor_for(
                    queue,
                    options.offset.as_ref(),
                    self.next_offset,
                    Utc::now(),
                )?,
                ..StreamCursor::default()
            }),
        };
        self.consumers.insert(
            options.consumer_tag.clone(),
            ConsumerState {
                limit: options.in_flight_limit(unbounded_buffer),
                last_tag: 0,
                unacked: BTreeMap::new(),
                stream,
            },
        );
        Ok(())
    }

    /// Remove a consumer and requeue its unacked messages.
    ///
    /// Returns the number requeued, or `None` if the consumer was unknown.
    pub(crate) fn detach(&mut self, consumer_tag: &str) -> Option<usize> {
        let consumer = self.consumers.remove(consumer_tag)?;
        let Log::Classic(log) = &mut self.log else {
            return Some(0);
        };
        Some(
            consumer
                .unacked
                .into_values()
                .filter(|offset| log.requeue(*offset))
                .count(),
        )
    }

    /// Dispatch up to `max` deliveries while the consumer's window is open.
    ///
    /// Returns `None` once the consumer is gone.
    pub(crate) fn dispatch(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        max: usize,
    ) -> Option<Vec<Delivery>> {
        let QueueState { log, consumers, .. } = self;
        let consumer = consumers.get_mut(consumer_tag)?;

        let mut deliveries = Vec::new();
        while deliveries.len() < max && consumer.has_capacity() {
            let next = match log {
                Log::Classic(log) => log.take_next(),
                Log::Stream(log) => consumer.stream.as_mut().and_then(|c| c.advance(log)),
            };
            let Some((offset, message)) = next else {
                break;
            };

            consumer.last_tag += 1;
            let tag = consumer.last_tag;
            consumer.unacked.insert(tag, offset);

            deliveries.push(Delivery {
                tag,
                consumer_tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                offset,
                redelivered: message.delivery_count > 0,
                message,
            });
        }
        Some(deliveries)
    }
}

/// Delivery loop for one consumer. Ends when the consumer is cancelled or its
/// subscription is dropped.
pub(crate) async fn run_scheduler(
    queue: Arc<Queue>,
    consumer_tag: String,
    sender: mpsc::Sender<Delivery>,
    mut cancelled: watch::Receiver<bool>,
    batch: usize,
) {
    debug!(queue = %queue.name(), consumer = %consumer_tag, "Delivery scheduler started");

    'schedule: loop {
        let notified = queue.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let dispatched = {
            let mut state = queue.lock();
            state
                .dispatch(queue.name(), &consumer_tag, batch)
                .map(|deliveries| (deliveries, state.ready(), state.unacked()))
        };
        let Some((deliveries, ready, unacked)) = dispatched else {
            break;
        };
        let idle = deliveries.is_empty();
        if !idle {
            queue.metrics.set_depth(ready, unacked);
        }

        for delivery in deliveries {
            queue.metrics.message_delivered(delivery.redelivered);
            tokio::select! {
                sent = sender.send(delivery) => {
                    if sent.is_err() {
                        break 'schedule;
                    }
                }
                _ = cancelled.changed() => break 'schedule,
            }
        }

        if idle {
            tokio::select! {
                _ = &mut notified => {}
                _ = cancelled.changed() => break,
            }
        }
    }

    debug!(queue = %queue.name(), consumer = %consumer_tag, "Delivery scheduler stopped");
}

/// Ordered, prefetch-throttled sequence of deliveries for one consumer.
///
/// Dropping the subscription cancels the consumer and requeues whatever it
/// left unacknowledged.
pub struct Subscription {
    broker: Arc<BrokerInner>,
    consumer_tag: String,
    queue: String,
    manual_ack: bool,
    receiver: mpsc::Receiver<Delivery>,
    cancelled: watch::Receiver<bool>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        broker: Arc<BrokerInner>,
        consumer_tag: String,
        queue: String,
        manual_ack: bool,
        receiver: mpsc::Receiver<Delivery>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            consumer_tag,
            queue,
            manual_ack,
            receiver,
            cancelled,
            active: true,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Hand a buffered delivery to the caller, settling it first when the
    /// consumer auto-acks. `None` if the consumer went away in between; the
    /// message was requeued by the cancellation.
    fn accept(&self, delivery: Delivery) -> Option<Delivery> {
        if self.is_cancelled() {
            return None;
        }
        if !self.manual_ack {
            if let Err(e) = self.broker.ack(&self.consumer_tag, delivery.tag) {
                debug!(
                    consumer = %self.consumer_tag,
                    tag = delivery.tag,
                    error = %e,
                    "Auto-ack failed, delivery skipped"
                );
                return None;
            }
        }
        Some(delivery)
    }

    /// Wait for the next delivery. `None` once the consumer is cancelled.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if self.is_cancelled() {
                return None;
            }
            let delivery = tokio::select! {
                delivery = self.receiver.recv() => delivery?,
                changed = self.cancelled.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    continue;
                }
            };
            if let Some(delivery) = self.accept(delivery) {
                return Some(delivery);
            }
        }
    }

    /// Take a delivery that is already waiting, without blocking.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            if self.is_cancelled() {
                return None;
            }
            let delivery = self.receiver.try_recv().ok()?;
            if let Some(delivery) = self.accept(delivery) {
                return Some(delivery);
            }
        }
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.ack(&self.consumer_tag, delivery.tag)
    }

    pub fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.broker.reject(&self.consumer_tag, delivery.tag, requeue)
    }

    /// Cancel the consumer. Returns how many unacked messages were requeued.
    pub fn cancel(mut self) -> Result<usize> {
        self.active = false;
        self.broker.cancel_consumer(&self.consumer_tag)
    }

    /// Adapt into a `Stream` of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        futures::stream::unfold(self, |mut subscription| async move {
            let delivery = subscription.recv().await?;
            Some((delivery, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.broker.cancel_consumer(&self.consumer_tag) {
            Ok(requeued) => {
                debug!(consumer = %self.consumer_tag, requeued, "Subscription dropped")
            }
            Err(BrokerError::NotFound { .. }) => {}
            Err(e) => warn!(consumer = %self.consumer_tag, error = %e, "Failed to cancel consumer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueOptions;
    use crate::stream::StreamRetention;

    const BUFFER: usize = 64;

    fn classic() -> Queue {
        Queue::new("jobs", QueueOptions::new())
    }

    fn publish(queue: &Queue, count: usize) {
        for i in 0..count {
            queue.enqueue(Message::new("", "jobs", format!("m{i}")), Utc::now());
        }
    }

    fn consumer(tag: &str, prefetch: u16) -> ConsumeOptions {
        ConsumeOptions::new().with_tag(tag).with_prefetch(prefetch)
    }

    #[test]
    fn test_prefetch_window_limits_dispatch() {
        let queue = classic();
        publish(&queue, 5);
        let mut state = queue.lock();
        state.attach("jobs", &consumer("c1", 2), BUFFER).unwrap();

        let first = state.dispatch("jobs", "c1", usize::MAX).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.iter().map(|d| d.offset).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(first.iter().map(|d| d.tag).collect::<Vec<_>>(), [1, 2]);
        assert!(state.dispatch("jobs", "c1", usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_competing_consumers_share_the_backlog() {
        let queue = classic();
        publish(&queue, 3);
        let mut state = queue.lock();
        state.attach("jobs", &consumer("a", 1), BUFFER).unwrap();
        state.attach("jobs", &consumer("b", 1), BUFFER).unwrap();

        let a = state.dispatch("jobs", "a", usize::MAX).unwrap();
        let b = state.dispatch("jobs", "b", usize::MAX).unwrap();
        assert_eq!(a[0].offset, 0);
        assert_eq!(b[0].offset, 1);
    }

    #[test]
    fn test_auto_ack_deliveries_stay_in_flight() {
        let queue = classic();
        publish(&queue, 5);
        let mut state = queue.lock();
        state
            .attach("jobs", &consumer("c1", 0).with_manual_ack(false), 3)
            .unwrap();

        let deliveries = state.dispatch("jobs", "c1", usize::MAX).unwrap();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(state.unacked(), 3);
        assert_eq!(state.ready(), 2);

        assert_eq!(state.detach("c1"), Some(3));
        assert_eq!(state.ready(), 5);
    }

    #[test]
    fn test_manual_ack_without_prefetch_is_unbounded() {
        let queue = classic();
        publish(&queue, 5);
        let mut state = queue.lock();
        state.attach("jobs", &consumer("c1", 0), 2).unwrap();

        assert_eq!(state.dispatch("jobs", "c1", usize::MAX).unwrap().len(), 5);
    }

    #[test]
    fn test_detach_requeues_unacked() {
        let queue = classic();
        publish(&queue, 2);
        let mut state = queue.lock();
        state.attach("jobs", &consumer("c1", 0), BUFFER).unwrap();
        state.dispatch("jobs", "c1", usize::MAX).unwrap();

        assert_eq!(state.detach("c1"), Some(2));
        assert_eq!(state.detach("c1"), None);

        state.attach("jobs", &consumer("c2", 0), BUFFER).unwrap();
        let again = state.dispatch("jobs", "c2", usize::MAX).unwrap();
        assert_eq!(again.len(), 2);
        assert!(again.iter().all(|d| d.redelivered && d.delivery_count() == 1));
    }

    #[test]
    fn test_stream_consumers_read_independently() {
        let queue = Queue::new(
            "events",
            QueueOptions::new().durable(true).stream(StreamRetention::new()),
        );
        publish(&queue, 3);
        let mut state = queue.lock();
        let from_first = consumer("from-first", 10).with_offset(StreamOffset::First);
        state.attach("events", &from_first, BUFFER).unwrap();
        state.attach("events", &consumer("from-tail", 10), BUFFER).unwrap();

        let replay = state.dispatch("events", "from-first", usize::MAX).unwrap();
        assert_eq!(replay.iter().map(|d| d.offset).collect::<Vec<_>>(), [0, 1, 2]);
        assert!(state.dispatch("events", "from-tail", usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_stream_consumer_options_are_checked() {
        let queue = Queue::new(
            "events",
            QueueOptions::new().durable(true).stream(StreamRetention::new()),
        );
        assert!(consumer("c", 0).validate(&queue).is_err());
        assert!(consumer("c", 5).with_manual_ack(false).validate(&queue).is_err());
        assert!(consumer("c", 5).validate(&queue).is_ok());

        let offset_on_classic = consumer("c", 5).with_offset(StreamOffset::First);
        assert!(offset_on_classic.validate(&classic()).is_err());
    }
}
