//! Retry by republishing through a retry exchange.
//!
//! A retry exchange is an ordinary exchange bound back to the origin queue.
//! The republished copy is a new message in that queue, so its per-queue
//! `delivery_count` starts again at 0. The number of retries so far travels in
//! the `x-retry-count` header instead, and a [`RetryPolicy`] decides when to
//! stop.

use crate::broker::Broker;
use crate::error::Result;
use crate::exchange::RouteResult;
use crate::message::{Message, PublishOptions};
use tracing::{info, warn};

/// Upper bound on republish attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_retries: None }
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    /// Whether a message that was already retried `attempts` times may go again.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries.is_none_or(|max| attempts < max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Republished { attempt: u32, route: RouteResult },
    /// The policy's ceiling was reached; nothing was published.
    Exhausted { attempts: u32 },
}

/// Republishes messages to a retry exchange under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryPublisher {
    broker: Broker,
    exchange: String,
    policy: RetryPolicy,
}

impl RetryPublisher {
    pub fn new(broker: Broker, exchange: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Republish a copy of `message`.
    ///
    /// The routing key defaults to `x-original-routing-key` when present, else
    /// the message's own key.
    pub fn retry(&self, message: &Message, routing_key: Option<&str>) -> Result<RetryOutcome> {
        let attempts = message.headers.retry_count.unwrap_or(0);
        if !self.policy.allows(attempts) {
            warn!(
                message_id = %message.id,
                attempts,
                exchange = %self.exchange,
                "Retry limit reached, not republishing"
            );
            return Ok(RetryOutcome::Exhausted { attempts });
        }

        let routing_key = routing_key
            .or(message.headers.original_routing_key.as_deref())
            .unwrap_or(&message.routing_key);

        let mut headers = message.headers.clone();
        headers.retry_count = Some(attempts + 1);
        let route = self.broker.publish(
            &self.exchange,
            routing_key,
            message.body.clone(),
            PublishOptions::new()
                .with_headers(headers)
                .persistent(message.persistent),
        )?;

        info!(
            message_id = %message.id,
            exchange = %self.exchange,
            routing_key = %routing_key,
            attempt = attempts + 1,
            outcome = route.outcome(),
            "Republished for retry"
        );
        Ok(RetryOutcome::Republished {
            attempt: attempts + 1,
            route,
        })
    }
}
