//! Error types for broker operations and consumer-side processing.

use strum::Display;
use thiserror::Error;

/// Kind of broker resource named by an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Exchange,
    Queue,
    Binding,
    Consumer,
}

/// Errors returned synchronously by [`Broker`](crate::Broker) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Referenced exchange, queue, binding or consumer is not declared.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// Redeclaration with parameters that differ from the existing resource.
    #[error("{kind} '{name}' already declared with different parameters: {reason}")]
    AlreadyDeclaredConflict {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    /// Ack/reject for a tag that is not outstanding for the consumer.
    #[error("unknown delivery tag {tag} for consumer '{consumer}'")]
    UnknownDeliveryTag { consumer: String, tag: u64 },

    /// Requested stream position was evicted or lies beyond the tail.
    #[error("offset {requested} is not available on queue '{queue}'")]
    OffsetNotFound { queue: String, requested: String },

    /// Mandatory publish that matched no queue.
    #[error(
        "message to exchange '{exchange}' with routing key '{routing_key}' returned: {reply_code} {reply_text}"
    )]
    ReturnedUnroutable {
        exchange: String,
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },

    #[error("consumer tag '{0}' is already in use")]
    ConsumerTagInUse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl BrokerError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(
        kind: ResourceKind,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::AlreadyDeclaredConflict {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_tag(consumer: impl Into<String>, tag: u64) -> Self {
        Self::UnknownDeliveryTag {
            consumer: consumer.into(),
            tag,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error categories decide whether a failed delivery is requeued or dead-lettered.
///
/// - **Transient**: temporary failure, requeue after an exponential backoff
/// - **Permanent**: unrecoverable, reject without requeue (dead-letter if configured)
/// - **RateLimited**: upstream throttling, requeue with longer delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorCategory {
    /// Redeliveries allowed before the message is dead-lettered instead.
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorCategory::Transient => 3,
            ErrorCategory::Permanent => 0,
            ErrorCategory::RateLimited => 5,
        }
    }

    fn backoff_bounds_ms(&self) -> (u64, u64) {
        match self {
            ErrorCategory::Transient => (1_000, 30_000),
            ErrorCategory::Permanent => (0, 0),
            ErrorCategory::RateLimited => (5_000, 120_000),
        }
    }

    /// Backoff before the `redeliveries`-th requeue, doubling up to the category cap.
    pub fn backoff_delay_ms(&self, redeliveries: u32) -> u64 {
        let (base, max) = self.backoff_bounds_ms();
        base.saturating_mul(2u64.saturating_pow(redeliveries)).min(max)
    }

    pub fn should_retry(&self, redeliveries: u32) -> bool {
        redeliveries < self.max_retries()
    }
}

/// Failure reported by a [`Processor`](crate::Processor) for one delivery.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// Body could not be decoded; never worth a redelivery.
    #[error("malformed body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient { .. } => ErrorCategory::Transient,
            ProcessingError::Permanent { .. } | ProcessingError::Decode(_) => {
                ErrorCategory::Permanent
            }
            ProcessingError::RateLimited { .. } => ErrorCategory::RateLimited,
        }
    }

    pub fn should_retry(&self, redeliveries: u32) -> bool {
        self.category().should_retry(redeliveries)
    }

    /// Backoff before requeueing; an explicit retry-after hint wins.
    pub fn backoff_delay_ms(&self, redeliveries: u32) -> u64 {
        match self {
            ProcessingError::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => *ms,
            other => other.category().backoff_delay_ms(redeliveries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_messages_name_the_resource() {
        let err = BrokerError::not_found(ResourceKind::Exchange, "emails");
        assert_eq!(err.to_string(), "exchange 'emails' not found");

        let err = BrokerError::unknown_tag("c1", 9);
        assert_eq!(err.to_string(), "unknown delivery tag 9 for consumer 'c1'");
    }

    #[test]
    fn test_category_backoff_doubles_and_caps() {
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(0), 1_000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(2), 4_000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(10), 30_000);
        assert_eq!(ErrorCategory::RateLimited.backoff_delay_ms(3), 40_000);
        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(4), 0);
    }

    #[test]
    fn test_retry_budget_per_category() {
        let transient = ProcessingError::transient("smtp timeout");
        assert!(transient.should_retry(0));
        assert!(transient.should_retry(2));
        assert!(!transient.should_retry(3));

        assert!(!ProcessingError::permanent("bad address").should_retry(0));
        assert!(ProcessingError::rate_limited("slow down", None).should_retry(4));
    }

    #[test]
    fn test_decode_errors_are_permanent() {
        let err: ProcessingError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_retry_after_hint_overrides_backoff() {
        let err = ProcessingError::rate_limited("429", Some(750));
        assert_eq!(err.backoff_delay_ms(4), 750);
        assert_eq!(ErrorCategory::RateLimited.to_string(), "rate_limited");
    }
}
