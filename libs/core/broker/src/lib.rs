//! In-process message broker core.
//!
//! Provides exchange-to-queue routing with alternate-exchange fallback,
//! prefetch-bounded delivery with manual acknowledgment, dead-lettering on
//! rejection, and offset-addressable replay for append-only stream queues.
//!
//! # Architecture
//!
//! ```text
//!  publish ──▶ RoutingTable ──▶ Queue (log) ──▶ scheduler ──▶ Subscription
//!                 │    ▲            ▲      (per consumer,        │
//!         no match│    │            │       prefetch window)     │ ack / reject
//!                 ▼    │            │                            ▼
//!          alternate ──┘            └──── requeue ◀──────── settlement
//!                                                                │
//!                                     dead-letter exchange ◀─────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use broker::{Broker, ConsumeOptions, ExchangeKind, PublishOptions, QueueOptions};
//!
//! let broker = Broker::default();
//! broker.declare_exchange("emails", ExchangeKind::Direct, None)?;
//! broker.declare_queue("email.notifications", QueueOptions::new().durable(true))?;
//! broker.bind("email.notifications", "emails", "notification")?;
//!
//! broker.publish("emails", "notification", "hello", PublishOptions::new())?;
//!
//! let mut subscription = broker.subscribe(
//!     "email.notifications",
//!     ConsumeOptions::new().with_prefetch(1),
//! )?;
//! while let Some(delivery) = subscription.recv().await {
//!     subscription.ack(&delivery)?;
//! }
//! ```

mod ack;
mod broker;
mod consumer;
mod error;
mod exchange;
mod message;
pub mod metrics;
mod queue;
mod retention;
mod retry;
mod stream;
mod worker;

pub use broker::Broker;
pub use consumer::{ConsumeOptions, Subscription};
pub use core_config::broker::{BrokerConfig, DEFAULT_SEGMENT_SIZE_BYTES};
pub use error::{BrokerError, ErrorCategory, ProcessingError, ResourceKind, Result};
pub use exchange::{
    Binding, DEFAULT_EXCHANGE, Exchange, ExchangeKind, REPLY_CODE_NO_ROUTE, REPLY_TEXT_NO_ROUTE,
    RouteResult, RoutingTable, topic_matches,
};
pub use message::{
    DEATH_HEADER, DeathReason, DeathRecord, Delivery, DeliveryTag, Headers, Message,
    ORIGINAL_ROUTING_KEY_HEADER, PublishOptions, RETRY_COUNT_HEADER,
};
pub use queue::{DeadLetterConfig, QueueInfo, QueueMode, QueueOptions};
pub use retry::{RetryOutcome, RetryPolicy, RetryPublisher};
pub use stream::{StreamOffset, StreamRetention, parse_max_age};
pub use worker::{ConsumerWorker, Processor, WorkerStats};
