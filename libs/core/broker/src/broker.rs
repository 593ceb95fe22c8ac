//! The broker facade.
//!
//! Lock order is routing table, then queue map, then an individual queue.
//! The consumer map is never held while taking the routing or queue-map locks.

use crate::ack::{self, Rejection};
use crate::consumer::{ConsumeOptions, Subscription, run_scheduler};
use crate::error::{BrokerError, ResourceKind, Result};
use crate::exchange::{DEFAULT_EXCHANGE, ExchangeKind, RouteResult, RoutingTable};
use crate::message::{DeliveryTag, Message, PublishOptions};
use crate::metrics::record_route;
use crate::queue::{Queue, QueueInfo, QueueOptions, lock};
use chrono::Utc;
use core_config::broker::BrokerConfig;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct ConsumerHandle {
    queue: Arc<Queue>,
    cancel: watch::Sender<bool>,
}

pub(crate) struct BrokerInner {
    config: BrokerConfig,
    routing: RwLock<RoutingTable>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl BrokerInner {
    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        read(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Queue, name))
    }

    pub(crate) fn queues(&self) -> Vec<Arc<Queue>> {
        read(&self.queues).values().cloned().collect()
    }

    fn route(&self, exchange: &str, routing_key: &str, mandatory: bool) -> Result<RouteResult> {
        let routing = read(&self.routing);
        let queues = read(&self.queues);
        routing.route(exchange, routing_key, mandatory, |name| queues.contains_key(name))
    }

    /// Append `message` to every queue named by `result`.
    fn deliver(&self, result: &RouteResult, message: Message) {
        let targets: Vec<Arc<Queue>> = {
            let queues = read(&self.queues);
            result
                .queues()
                .iter()
                .filter_map(|name| queues.get(name).cloned())
                .collect()
        };

        let now = Utc::now();
        for queue in targets {
            if queue.enqueue(message.clone(), now).is_none() {
                debug!(queue = %queue.name(), "Queue deleted while routing, skipped");
            }
        }
    }

    fn consumer_queue(&self, consumer_tag: &str) -> Option<Arc<Queue>> {
        lock(&self.consumers)
            .get(consumer_tag)
            .map(|handle| handle.queue.clone())
    }

    pub(crate) fn ack(&self, consumer_tag: &str, tag: DeliveryTag) -> Result<()> {
        let queue = self
            .consumer_queue(consumer_tag)
            .ok_or_else(|| BrokerError::unknown_tag(consumer_tag, tag))?;
        let offset = {
            let mut state = queue.lock();
            let offset = state.ack(consumer_tag, tag)?;
            queue.refresh_depth(&state);
            offset
        };
        queue.metrics.message_acked();
        queue.wake();
        debug!(queue = %queue.name(), consumer = %consumer_tag, tag, offset, "Acked");
        Ok(())
    }

    pub(crate) fn reject(
        &self,
        consumer_tag: &str,
        tag: DeliveryTag,
        requeue: bool,
    ) -> Result<()> {
        let queue = self
            .consumer_queue(consumer_tag)
            .ok_or_else(|| BrokerError::unknown_tag(consumer_tag, tag))?;
        let rejection = {
            let mut state = queue.lock();
            let rejection = state.reject(consumer_tag, tag, requeue)?;
            queue.refresh_depth(&state);
            rejection
        };
        queue.metrics.message_rejected(requeue);
        queue.wake();

        match rejection {
            Rejection::Requeued => {
                debug!(queue = %queue.name(), consumer = %consumer_tag, tag, "Requeued");
            }
            Rejection::Discarded(Some(message)) => self.dead_letter(&queue, message),
            Rejection::Discarded(None) => {
                debug!(queue = %queue.name(), tag, "Rejected message already evicted");
            }
        }
        Ok(())
    }

    /// Route a rejected message through its queue's dead-letter exchange, or drop it.
    fn dead_letter(&self, queue: &Queue, message: Message) {
        let Some(target) = &queue.options().dead_letter else {
            debug!(queue = %queue.name(), message_id = %message.id, "Rejected message dropped");
            return;
        };

        let message = ack::dead_letter(message, queue.name(), target, Utc::now());
        match self.route(&target.exchange, &message.routing_key, false) {
            Ok(result) if result.is_routed() => {
                info!(
                    queue = %queue.name(),
                    exchange = %target.exchange,
                    routing_key = %message.routing_key,
                    message_id = %message.id,
                    "Dead-lettered message"
                );
                queue.metrics.message_dead_lettered();
                self.deliver(&result, message);
            }
            Ok(_) => warn!(
                queue = %queue.name(),
                exchange = %target.exchange,
                routing_key = %message.routing_key,
                "Dead-lettered message matched no queue, dropped"
            ),
            Err(e) => warn!(
                queue = %queue.name(),
                error = %e,
                "Dead-letter exchange unavailable, message dropped"
            ),
        }
    }

    pub(crate) fn cancel_consumer(&self, consumer_tag: &str) -> Result<usize> {
        let handle = lock(&self.consumers)
            .remove(consumer_tag)
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Consumer, consumer_tag))?;

        let requeued = {
            let mut state = handle.queue.lock();
            let requeued = state.detach(consumer_tag).unwrap_or(0);
            handle.queue.refresh_depth(&state);
            requeued
        };
        let _ = handle.cancel.send(true);
        handle.queue.wake();
        info!(
            queue = %handle.queue.name(),
            consumer = %consumer_tag,
            requeued,
            "Consumer cancelled"
        );
        Ok(requeued)
    }
}

/// In-process message broker.
///
/// Cheap to clone; clones share the same exchanges, queues and consumers.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                routing: RwLock::new(RoutingTable::new()),
                queues: RwLock::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        self.inner.config()
    }

    pub(crate) fn inner(&self) -> &Arc<BrokerInner> {
        &self.inner
    }

    // ---- exchanges ----

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        alternate: Option<&str>,
    ) -> Result<()> {
        write(&self.inner.routing).declare_exchange(name, kind, alternate)
    }

    pub fn delete_exchange(&self, name: &str) -> Result<()> {
        write(&self.inner.routing).delete_exchange(name)
    }

    // ---- queues ----

    /// Declare a queue. Redeclaring with identical options is a no-op.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        if name.is_empty() {
            return Err(BrokerError::invalid("queue name must not be empty"));
        }
        options.validate()?;

        let mut queues = write(&self.inner.queues);
        if let Some(existing) = queues.get(name) {
            if *existing.options() != options {
                return Err(BrokerError::conflict(
                    ResourceKind::Queue,
                    name,
                    format!("declared with {:?}, requested {:?}", existing.options(), options),
                ));
            }
            debug!(queue = %name, "Queue already declared");
            return Ok(());
        }

        info!(
            queue = %name,
            durable = options.durable,
            stream = options.is_stream(),
            dead_letter_exchange = ?options.dead_letter.as_ref().map(|d| d.exchange.as_str()),
            "Declared queue"
        );
        queues.insert(name.to_string(), Arc::new(Queue::new(name, options)));
        Ok(())
    }

    /// Declare a queue from an AMQP-style arguments table.
    pub fn declare_queue_with_arguments(
        &self,
        name: &str,
        durable: bool,
        arguments: &Map<String, Value>,
    ) -> Result<()> {
        let options = QueueOptions::from_arguments(
            durable,
            arguments,
            self.inner.config.default_segment_size_bytes,
        )?;
        self.declare_queue(name, options)
    }

    /// Delete a queue, its bindings and its consumers. Returns the number of
    /// messages that were still in the queue.
    pub fn delete_queue(&self, name: &str) -> Result<usize> {
        let queue = {
            let mut routing = write(&self.inner.routing);
            let mut queues = write(&self.inner.queues);
            let queue = queues
                .remove(name)
                .ok_or_else(|| BrokerError::not_found(ResourceKind::Queue, name))?;
            routing.remove_queue_bindings(name);
            queue
        };

        let cancelled: Vec<ConsumerHandle> = {
            let mut consumers = lock(&self.inner.consumers);
            let tags: Vec<String> = consumers
                .iter()
                .filter(|(_, handle)| Arc::ptr_eq(&handle.queue, &queue))
                .map(|(tag, _)| tag.clone())
                .collect();
            tags.iter().filter_map(|tag| consumers.remove(tag)).collect()
        };

        let removed = queue.close();
        for handle in &cancelled {
            let _ = handle.cancel.send(true);
        }
        info!(queue = %name, removed, consumers = cancelled.len(), "Deleted queue");
        Ok(removed)
    }

    /// Drop every pending message of a classic queue; unacked ones are kept.
    pub fn purge_queue(&self, name: &str) -> Result<usize> {
        self.inner.queue(name)?.purge()
    }

    pub fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        Ok(self.inner.queue(name)?.info())
    }

    /// Snapshot of retained messages with their offsets, oldest first.
    pub fn browse(&self, name: &str) -> Result<Vec<(u64, Message)>> {
        Ok(self.inner.queue(name)?.browse())
    }

    // ---- bindings ----

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut routing = write(&self.inner.routing);
        if !read(&self.inner.queues).contains_key(queue) {
            return Err(BrokerError::not_found(ResourceKind::Queue, queue));
        }
        routing.bind(exchange, queue, pattern)?;
        Ok(())
    }

    pub fn unbind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        write(&self.inner.routing).unbind(exchange, queue, pattern)
    }

    // ---- publish ----

    /// Route and enqueue a message. Never blocks on consumers.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<RouteResult> {
        let PublishOptions {
            headers,
            persistent,
            mandatory,
        } = options;

        let result = self.inner.route(exchange, routing_key, mandatory)?;
        record_route(exchange, &result);

        match &result {
            RouteResult::Delivered(_) | RouteResult::FallenBack(_) => {
                let message = Message::new(exchange, routing_key, body)
                    .with_headers(headers)
                    .with_persistent(persistent);
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    outcome = result.outcome(),
                    queues = ?result.queues(),
                    "Published"
                );
                self.inner.deliver(&result, message);
            }
            RouteResult::Returned { reply_text, .. } => {
                info!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply = %reply_text,
                    "Returned unroutable message"
                );
            }
            RouteResult::Dropped => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "Dropped unroutable message"
                );
            }
        }
        Ok(result)
    }

    // ---- consume ----

    /// Attach a consumer and start its delivery scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BrokerError::Runtime("subscribe requires a Tokio runtime".into()))?;
        let queue = self.inner.queue(queue)?;
        options.validate(&queue)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut consumers = lock(&self.inner.consumers);
            if consumers.contains_key(&options.consumer_tag) {
                return Err(BrokerError::ConsumerTagInUse(options.consumer_tag));
            }
            let unbounded_buffer = self.inner.config.unbounded_prefetch_buffer;
            queue.lock().attach(queue.name(), &options, unbounded_buffer)?;
            consumers.insert(
                options.consumer_tag.clone(),
                ConsumerHandle {
                    queue: queue.clone(),
                    cancel: cancel_tx,
                },
            );
        }

        let capacity = options.channel_capacity(self.inner.config.unbounded_prefetch_buffer);
        let (sender, receiver) = mpsc::channel(capacity);
        runtime.spawn(run_scheduler(
            queue.clone(),
            options.consumer_tag.clone(),
            sender,
            cancel_rx.clone(),
            capacity,
        ));

        info!(
            queue = %queue.name(),
            consumer = %options.consumer_tag,
            prefetch = options.prefetch,
            manual_ack = options.manual_ack,
            offset = ?options.offset,
            "Consumer subscribed"
        );
        Ok(Subscription::new(
            self.inner.clone(),
            options.consumer_tag,
            queue.name().to_string(),
            options.manual_ack,
            receiver,
            cancel_rx,
        ))
    }

    /// Cancel a consumer; its unacked messages are requeued.
    pub fn unsubscribe(&self, consumer_tag: &str) -> Result<usize> {
        self.inner.cancel_consumer(consumer_tag)
    }

    pub fn ack(&self, consumer_tag: &str, tag: DeliveryTag) -> Result<()> {
        self.inner.ack(consumer_tag, tag)
    }

    pub fn reject(&self, consumer_tag: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.inner.reject(consumer_tag, tag, requeue)
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        name == DEFAULT_EXCHANGE || read(&self.inner.routing).contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::GaugeRecorder;
    use crate::stream::StreamRetention;
    use std::time::Duration;

    #[test]
    fn test_queue_redeclare_must_match() {
        let broker = Broker::default();
        let options = QueueOptions::new().durable(true);
        broker.declare_queue("jobs", options.clone()).unwrap();
        broker.declare_queue("jobs", options).unwrap();

        let err = broker
            .declare_queue("jobs", QueueOptions::new().durable(true).with_dead_letter("dlx", None))
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::AlreadyDeclaredConflict {
                kind: ResourceKind::Queue,
                ..
            }
        ));
    }

    #[test]
    fn test_bind_requires_both_ends() {
        let broker = Broker::default();
        broker.declare_exchange("emails", ExchangeKind::Direct, None).unwrap();
        assert_eq!(
            broker.bind("missing", "emails", "k").unwrap_err(),
            BrokerError::not_found(ResourceKind::Queue, "missing")
        );

        broker.declare_queue("email.notifications", QueueOptions::new()).unwrap();
        assert_eq!(
            broker.bind("email.notifications", "nope", "k").unwrap_err(),
            BrokerError::not_found(ResourceKind::Exchange, "nope")
        );
        broker.bind("email.notifications", "emails", "notification").unwrap();
    }

    #[test]
    fn test_publish_to_missing_exchange() {
        let broker = Broker::default();
        let err = broker
            .publish("nowhere", "k", "x", PublishOptions::new())
            .unwrap_err();
        assert_eq!(err, BrokerError::not_found(ResourceKind::Exchange, "nowhere"));
    }

    #[test]
    fn test_default_exchange_delivers_by_name() {
        let broker = Broker::default();
        broker.declare_queue("jobs", QueueOptions::new()).unwrap();

        let result = broker.publish("", "jobs", "x", PublishOptions::new()).unwrap();
        assert_eq!(result, RouteResult::Delivered(vec!["jobs".into()]));
        assert_eq!(broker.queue_info("jobs").unwrap().messages_ready, 1);
    }

    #[test]
    fn test_delete_queue_removes_bindings() {
        let broker = Broker::default();
        broker.declare_exchange("emails", ExchangeKind::Direct, None).unwrap();
        broker.declare_queue("q", QueueOptions::new()).unwrap();
        broker.bind("q", "emails", "k").unwrap();
        broker.publish("emails", "k", "x", PublishOptions::new()).unwrap();

        assert_eq!(broker.delete_queue("q").unwrap(), 1);
        assert!(broker.queue_info("q").is_err());
        assert_eq!(
            broker.publish("emails", "k", "x", PublishOptions::new()).unwrap(),
            RouteResult::Dropped
        );
        assert!(broker.delete_queue("q").is_err());
    }

    #[test]
    fn test_stream_declaration_rules() {
        let broker = Broker::default();
        let err = broker
            .declare_queue("events", QueueOptions::new().stream(StreamRetention::new()))
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn test_subscribe_outside_runtime_fails() {
        let broker = Broker::default();
        broker.declare_queue("jobs", QueueOptions::new()).unwrap();
        let err = broker
            .subscribe("jobs", ConsumeOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_duplicate_consumer_tag() {
        let broker = Broker::default();
        broker.declare_queue("jobs", QueueOptions::new()).unwrap();
        let _first = broker
            .subscribe("jobs", ConsumeOptions::new().with_tag("c1"))
            .unwrap();
        let err = broker
            .subscribe("jobs", ConsumeOptions::new().with_tag("c1"))
            .err()
            .unwrap();
        assert_eq!(err, BrokerError::ConsumerTagInUse("c1".into()));
    }

    #[tokio::test]
    async fn test_depth_gauges_follow_settlement() {
        let recorder = GaugeRecorder::default();
        let broker = Broker::default();
        broker.declare_queue("jobs", QueueOptions::new()).unwrap();
        for i in 0..3 {
            broker
                .publish("", "jobs", format!("m{i}"), PublishOptions::new())
                .unwrap();
        }
        let mut consumer = broker
            .subscribe("jobs", ConsumeOptions::new().with_tag("c1").with_prefetch(3))
            .unwrap();
        let mut deliveries = Vec::new();
        for _ in 0..3 {
            let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
                .await
                .unwrap()
                .unwrap();
            deliveries.push(delivery);
        }

        ::metrics::with_local_recorder(&recorder, || {
            broker.ack("c1", deliveries[0].tag).unwrap();
            assert_eq!(recorder.depth("jobs"), (Some(0.0), Some(2.0)));

            broker.reject("c1", deliveries[1].tag, true).unwrap();
            assert_eq!(recorder.depth("jobs"), (Some(1.0), Some(1.0)));

            assert_eq!(consumer.cancel().unwrap(), 1);
            assert_eq!(recorder.depth("jobs"), (Some(2.0), Some(0.0)));

            assert_eq!(broker.purge_queue("jobs").unwrap(), 2);
            assert_eq!(recorder.depth("jobs"), (Some(0.0), Some(0.0)));
        });
    }
}
