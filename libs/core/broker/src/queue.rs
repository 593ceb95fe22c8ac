//! Queues: per-queue message log, offsets and the consumers attached to it.
//!
//! Everything that must change together (log, offsets, unacked sets) sits
//! behind one mutex per queue, so a dispatch check-and-update or an ack is a
//! single critical section. Queues never share a lock.

use crate::consumer::ConsumerState;
use crate::error::{BrokerError, Result};
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::stream::{StreamLog, StreamRetention, parse_max_age};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where rejected messages are republished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    /// Replaces the message's routing key when set.
    pub routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// Messages are removed once acknowledged.
    #[default]
    Classic,
    /// Append-only log with offset replay and retention.
    Stream(StreamRetention),
}

/// Queue declaration parameters. Two declarations are compatible only if equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub dead_letter: Option<DeadLetterConfig>,
    pub mode: QueueMode,
    /// Stored as metadata only.
    pub replica_count: Option<u32>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<&str>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterConfig {
            exchange: exchange.into(),
            routing_key: routing_key.map(str::to_string),
        });
        self
    }

    pub fn stream(mut self, retention: StreamRetention) -> Self {
        self.mode = QueueMode::Stream(retention);
        self
    }

    pub fn with_replica_count(mut self, replicas: u32) -> Self {
        self.replica_count = Some(replicas);
        self
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.mode, QueueMode::Stream(_))
    }

    /// Build options from an AMQP-style arguments table.
    ///
    /// Recognised keys: `x-queue-type`, `x-max-length-bytes`, `x-max-age`,
    /// `x-stream-max-segment-size-bytes`, `x-initial-cluster-size`,
    /// `x-dead-letter-exchange`, `x-dead-letter-routing-key`. Other keys are ignored.
    pub fn from_arguments(
        durable: bool,
        arguments: &Map<String, Value>,
        default_segment_size_bytes: u64,
    ) -> Result<Self> {
        let mut options = QueueOptions::new().durable(durable);

        let is_stream = match string_arg(arguments, "x-queue-type")?.as_deref() {
            None | Some("classic") => false,
            Some("stream") => true,
            Some(other) => {
                return Err(BrokerError::invalid(format!(
                    "unsupported queue type '{other}'"
                )));
            }
        };

        let max_length_bytes = u64_arg(arguments, "x-max-length-bytes")?;
        let max_age = string_arg(arguments, "x-max-age")?;
        let segment_size = u64_arg(arguments, "x-stream-max-segment-size-bytes")?;

        if is_stream {
            let segment_size = segment_size.unwrap_or(default_segment_size_bytes);
            let mut retention = StreamRetention::new().with_segment_size_bytes(segment_size);
            if let Some(bytes) = max_length_bytes {
                retention = retention.with_max_length_bytes(bytes);
            }
            if let Some(age) = max_age {
                retention = retention.with_max_age(parse_max_age(&age)?);
            }
            options = options.stream(retention);
        } else if max_length_bytes.is_some() || max_age.is_some() || segment_size.is_some() {
            return Err(BrokerError::invalid("retention arguments require x-queue-type=stream"));
        }

        if let Some(replicas) = u64_arg(arguments, "x-initial-cluster-size")? {
            let replicas = u32::try_from(replicas)
                .map_err(|_| BrokerError::invalid("x-initial-cluster-size is too large"))?;
            options = options.with_replica_count(replicas);
        }

        let dlx = string_arg(arguments, "x-dead-letter-exchange")?;
        let dlx_key = string_arg(arguments, "x-dead-letter-routing-key")?;
        match (dlx, dlx_key) {
            (Some(exchange), key) => options = options.with_dead_letter(exchange, key.as_deref()),
            (None, Some(_)) => {
                return Err(BrokerError::invalid(
                    "x-dead-letter-routing-key requires x-dead-letter-exchange",
                ));
            }
            (None, None) => {}
        }

        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let QueueMode::Stream(retention) = &self.mode {
            if !self.durable {
                return Err(BrokerError::invalid("stream queues must be durable"));
            }
            retention.validate()?;
        }
        Ok(())
    }
}

fn string_arg(arguments: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(BrokerError::invalid(format!("{key} must be a string, got {other}"))),
    }
}

fn u64_arg(arguments: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| {
                BrokerError::invalid(format!(
                    "{key} must be a non-negative integer, got {value}"
                ))
            }),
    }
}

/// A message as held by a queue.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub(crate) offset: u64,
    pub(crate) message: Message,
    pub(crate) enqueued_at: DateTime<Utc>,
}

/// Log of a classic queue: messages stay until acked; `ready` holds the pending region.
#[derive(Debug, Default)]
pub(crate) struct ClassicLog {
    messages: BTreeMap<u64, StoredMessage>,
    ready: BTreeSet<u64>,
    bytes: u64,
}

impl ClassicLog {
    fn push(&mut self, stored: StoredMessage) {
        self.bytes += stored.message.size();
        self.ready.insert(stored.offset);
        self.messages.insert(stored.offset, stored);
    }

    /// Take the oldest pending message. It stays stored until settled.
    pub(crate) fn take_next(&mut self) -> Option<(u64, Message)> {
        let offset = self.ready.pop_first()?;
        let stored = self.messages.get(&offset)?;
        Some((offset, stored.message.clone()))
    }

    pub(crate) fn remove(&mut self, offset: u64) -> Option<StoredMessage> {
        self.ready.remove(&offset);
        let stored = self.messages.remove(&offset)?;
        self.bytes -= stored.message.size();
        Some(stored)
    }

    /// Return an unacked message to the pending region at its original offset.
    pub(crate) fn requeue(&mut self, offset: u64) -> bool {
        match self.messages.get_mut(&offset) {
            Some(stored) => {
                stored.message.delivery_count += 1;
                self.ready.insert(offset);
                true
            }
            None => false,
        }
    }

    fn purge_ready(&mut self) -> usize {
        let ready = std::mem::take(&mut self.ready);
        for offset in &ready {
            if let Some(stored) = self.messages.remove(offset) {
                self.bytes -= stored.message.size();
            }
        }
        ready.len()
    }
}

#[derive(Debug)]
pub(crate) enum Log {
    Classic(ClassicLog),
    Stream(StreamLog),
}

/// Mutable state of one queue, guarded by the queue's mutex.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) log: Log,
    pub(crate) next_offset: u64,
    pub(crate) consumers: HashMap<String, ConsumerState>,
    pub(crate) closed: bool,
}

impl QueueState {
    fn new(mode: &QueueMode) -> Self {
        let log = match mode {
            QueueMode::Classic => Log::Classic(ClassicLog::default()),
            QueueMode::Stream(retention) => Log::Stream(StreamLog::new(retention.clone())),
        };
        Self {
            log,
            next_offset: 0,
            consumers: HashMap::new(),
            closed: false,
        }
    }

    pub(crate) fn append(&mut self, message: Message, now: DateTime<Utc>) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        let stored = StoredMessage {
            offset,
            message,
            enqueued_at: now,
        };
        match &mut self.log {
            Log::Classic(log) => log.push(stored),
            Log::Stream(log) => log.push(stored),
        }
        offset
    }

    pub(crate) fn enforce_retention(&mut self, now: DateTime<Utc>) -> usize {
        match &mut self.log {
            Log::Classic(_) => 0,
            Log::Stream(log) => log.enforce_retention(now),
        }
    }

    pub(crate) fn unacked(&self) -> usize {
        self.consumers.values().map(|c| c.unacked.len()).sum()
    }

    /// Messages waiting to be delivered (classic) or retained (stream).
    pub(crate) fn ready(&self) -> usize {
        match &self.log {
            Log::Classic(log) => log.ready.len(),
            Log::Stream(log) => log.len(),
        }
    }

    fn purge(&mut self) -> Result<usize> {
        match &mut self.log {
            Log::Classic(log) => Ok(log.purge_ready()),
            Log::Stream(_) => Err(BrokerError::invalid("stream queues cannot be purged")),
        }
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        self.consumers.clear();
        let count = match &self.log {
            Log::Classic(log) => log.messages.len(),
            Log::Stream(log) => log.len(),
        };
        self.log = match &self.log {
            Log::Classic(_) => Log::Classic(ClassicLog::default()),
            Log::Stream(_) => Log::Stream(StreamLog::new(StreamRetention::default())),
        };
        count
    }
}

/// Point-in-time statistics for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub stream: bool,
    pub durable: bool,
    pub messages_ready: usize,
    pub messages_unacked: usize,
    pub consumers: usize,
    pub first_offset: Option<u64>,
    pub next_offset: u64,
    pub total_bytes: u64,
    pub segments: usize,
    pub replica_count: Option<u32>,
}

/// A declared queue.
pub(crate) struct Queue {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    notify: Notify,
    pub(crate) metrics: QueueMetrics,
}

impl Queue {
    pub(crate) fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::new(&options.mode)),
            options,
            notify: Notify::new(),
            metrics: QueueMetrics::new(name),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    /// Future resolved by the next [`Queue::wake`]; enable it before checking state.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every scheduler waiting on this queue.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Append a message. Returns `None` if the queue was deleted concurrently.
    pub(crate) fn enqueue(&self, message: Message, now: DateTime<Utc>) -> Option<u64> {
        let size = message.size();
        let (offset, evicted, ready, unacked) = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            let offset = state.append(message, now);
            let evicted = state.enforce_retention(now);
            (offset, evicted, state.ready(), state.unacked())
        };

        self.metrics.message_enqueued(size);
        self.metrics.set_depth(ready, unacked);
        if evicted > 0 {
            self.metrics.messages_evicted(evicted);
            debug!(queue = %self.name, evicted, "Evicted stream segments after append");
        }
        self.wake();
        Some(offset)
    }

    /// Apply stream retention outside of an append. Returns evicted message count.
    pub(crate) fn sweep(&self, now: DateTime<Utc>) -> usize {
        let (evicted, ready, unacked) = {
            let mut state = self.lock();
            let evicted = state.enforce_retention(now);
            (evicted, state.ready(), state.unacked())
        };
        if evicted > 0 {
            self.metrics.messages_evicted(evicted);
            self.metrics.set_depth(ready, unacked);
        }
        evicted
    }

    pub(crate) fn purge(&self) -> Result<usize> {
        let (purged, ready, unacked) = {
            let mut state = self.lock();
            let purged = state.purge()?;
            (purged, state.ready(), state.unacked())
        };
        self.metrics.set_depth(ready, unacked);
        debug!(queue = %self.name, purged, "Purged queue");
        Ok(purged)
    }

    /// Record the current ready/unacked counts on the depth gauges.
    pub(crate) fn refresh_depth(&self, state: &QueueState) {
        self.metrics.set_depth(state.ready(), state.unacked());
    }

    pub(crate) fn close(&self) -> usize {
        let removed = self.lock().close();
        self.wake();
        removed
    }

    pub(crate) fn browse(&self) -> Vec<(u64, Message)> {
        let state = self.lock();
        match &state.log {
            Log::Classic(log) => log
                .messages
                .values()
                .map(|stored| (stored.offset, stored.message.clone()))
                .collect(),
            Log::Stream(log) => log
                .iter()
                .map(|stored| (stored.offset, stored.message.clone()))
                .collect(),
        }
    }

    pub(crate) fn info(&self) -> QueueInfo {
        let state = self.lock();
        let (first_offset, total_bytes, segments) = match &state.log {
            Log::Classic(log) => (log.messages.keys().next().copied(), log.bytes, 0),
            Log::Stream(log) => (log.first_offset(), log.total_bytes(), log.segment_count()),
        };
        QueueInfo {
            name: self.name.clone(),
            stream: self.options.is_stream(),
            durable: self.options.durable,
            messages_ready: state.ready(),
            messages_unacked: state.unacked(),
            consumers: state.consumers.len(),
            first_offset,
            next_offset: state.next_offset,
            total_bytes,
            segments,
            replica_count: self.options.replica_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_stream_arguments() {
        let options = QueueOptions::from_arguments(
            true,
            &args(json!({
                "x-queue-type": "stream",
                "x-max-length-bytes": 524_288_000u64,
                "x-max-age": "7D",
                "x-stream-max-segment-size-bytes": 10_485_760u64,
                "x-initial-cluster-size": 3
            })),
            500_000_000,
        )
        .unwrap();

        let QueueMode::Stream(retention) = &options.mode else {
            panic!("expected a stream queue");
        };
        assert_eq!(retention.max_length_bytes, Some(524_288_000));
        assert_eq!(retention.max_age, Some(chrono::TimeDelta::days(7)));
        assert_eq!(retention.segment_size_bytes, 10_485_760);
        assert_eq!(options.replica_count, Some(3));
        options.validate().unwrap();
    }

    #[test]
    fn test_stream_segment_default_comes_from_caller() {
        let arguments = args(json!({"x-queue-type": "stream"}));
        let options = QueueOptions::from_arguments(true, &arguments, 1024).unwrap();
        let expected = StreamRetention::new().with_segment_size_bytes(1024);
        assert_eq!(options.mode, QueueMode::Stream(expected));
    }

    #[test]
    fn test_dead_letter_arguments() {
        let options = QueueOptions::from_arguments(
            true,
            &args(json!({
                "x-dead-letter-exchange": "dlx_exchange",
                "x-dead-letter-routing-key": "main_queue"
            })),
            500_000_000,
        )
        .unwrap();
        assert_eq!(
            options.dead_letter,
            Some(DeadLetterConfig {
                exchange: "dlx_exchange".into(),
                routing_key: Some("main_queue".into()),
            })
        );
    }

    #[test]
    fn test_invalid_arguments() {
        let cases = [
            json!({"x-queue-type": "quorum"}),
            json!({"x-max-length-bytes": 10}),
            json!({"x-queue-type": "stream", "x-max-age": "soon"}),
            json!({"x-dead-letter-routing-key": "k"}),
            json!({"x-dead-letter-exchange": 5}),
        ];
        for case in cases {
            assert!(
                QueueOptions::from_arguments(true, &args(case.clone()), 1).is_err(),
                "{case} should be rejected"
            );
        }
    }

    #[test]
    fn test_streams_must_be_durable() {
        let options = QueueOptions::new().stream(StreamRetention::new());
        assert!(options.validate().is_err());
        assert!(options.durable(true).validate().is_ok());
    }

    #[test]
    fn test_offsets_are_never_reused() {
        let queue = Queue::new("jobs", QueueOptions::new());
        let now = Utc::now();
        assert_eq!(queue.enqueue(Message::new("", "jobs", "a"), now), Some(0));
        assert_eq!(queue.enqueue(Message::new("", "jobs", "b"), now), Some(1));

        assert_eq!(queue.purge().unwrap(), 2);
        assert_eq!(queue.enqueue(Message::new("", "jobs", "c"), now), Some(2));

        let info = queue.info();
        assert_eq!(info.messages_ready, 1);
        assert_eq!(info.first_offset, Some(2));
        assert_eq!(info.next_offset, 3);
    }

    #[test]
    fn test_closed_queue_rejects_appends() {
        let queue = Queue::new("jobs", QueueOptions::new());
        queue.enqueue(Message::new("", "jobs", "a"), Utc::now());
        assert_eq!(queue.close(), 1);
        assert_eq!(queue.enqueue(Message::new("", "jobs", "b"), Utc::now()), None);
    }

    #[test]
    fn test_stream_queue_cannot_be_purged() {
        let queue = Queue::new(
            "events",
            QueueOptions::new().durable(true).stream(StreamRetention::new()),
        );
        assert!(queue.purge().is_err());
    }
}
