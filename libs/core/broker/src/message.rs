//! Messages, their typed headers, and deliveries handed to consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Identifies one delivery to one consumer; increases per consumer from 1.
pub type DeliveryTag = u64;

pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
pub const DEATH_HEADER: &str = "x-death";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum DeathReason {
    Rejected,
}

/// One `x-death` entry, appended each time a message is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub reason: DeathReason,
    pub queue: String,
    pub count: u32,
    pub time: DateTime<Utc>,
    pub exchange: String,
    #[serde(rename = "routing-keys")]
    pub routing_keys: Vec<String>,
}

/// Message headers: reserved keys are typed, everything else lives in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(
        rename = "x-original-routing-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub original_routing_key: Option<String>,

    #[serde(rename = "x-death", default, skip_serializing_if = "Vec::is_empty")]
    pub death: Vec<DeathRecord>,

    #[serde(
        rename = "x-retry-count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_count: Option<u32>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_original_routing_key(mut self, key: impl Into<String>) -> Self {
        self.original_routing_key = Some(key.into());
        self
    }

    /// Set an application header. Reserved keys are routed to their typed field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            ORIGINAL_ROUTING_KEY_HEADER => {
                self.original_routing_key = value.as_str().map(str::to_string);
            }
            RETRY_COUNT_HEADER => {
                self.retry_count = value.as_u64().and_then(|n| u32::try_from(n).ok());
            }
            DEATH_HEADER => {
                if let Ok(records) = serde_json::from_value(value) {
                    self.death = records;
                }
            }
            _ => {
                self.extra.insert(key, value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Count carried by the latest `x-death` entry for `queue`/`reason`, or 0.
    pub fn death_count(&self, queue: &str, reason: DeathReason) -> u32 {
        self.death
            .iter()
            .rev()
            .find(|record| record.queue == queue && record.reason == reason)
            .map_or(0, |record| record.count)
    }

    /// Headers as a JSON table, reserved keys included.
    pub fn to_table(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A published message. The body is opaque to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
    /// Times this message has been redelivered within its current queue.
    pub delivery_count: u32,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: Headers::default(),
            persistent: false,
            timestamp: Utc::now(),
            delivery_count: 0,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Bytes counted against stream retention limits.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 0
    }
}

/// Per-publish flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub headers: Headers,
    pub persistent: bool,
    /// Return the message to the publisher instead of dropping it when unroutable.
    pub mandatory: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }
}

/// A message handed to a consumer, awaiting ack or reject.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub consumer_tag: String,
    pub queue: String,
    pub offset: u64,
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    pub fn delivery_count(&self) -> u32 {
        self.message.delivery_count
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_headers_are_typed() {
        let headers = Headers::new()
            .with("x-original-routing-key", "invalid_key")
            .with("x-retry-count", 2)
            .with("tenant", "acme");

        assert_eq!(headers.original_routing_key.as_deref(), Some("invalid_key"));
        assert_eq!(headers.retry_count, Some(2));
        assert_eq!(headers.get("tenant"), Some(&json!("acme")));
        assert!(headers.get("x-original-routing-key").is_none());
    }

    #[test]
    fn test_headers_table_uses_wire_names() {
        let mut headers = Headers::new().with_original_routing_key("orders");
        headers.death.push(DeathRecord {
            reason: DeathReason::Rejected,
            queue: "orders".into(),
            count: 1,
            time: Utc::now(),
            exchange: "shop".into(),
            routing_keys: vec!["orders".into()],
        });

        let table = headers.to_table();
        assert_eq!(table["x-original-routing-key"], json!("orders"));
        assert_eq!(table["x-death"][0]["reason"], json!("rejected"));
        assert_eq!(table["x-death"][0]["routing-keys"], json!(["orders"]));
        assert!(table.get("x-retry-count").is_none());

        let parsed: Headers = serde_json::from_value(table).unwrap();
        assert_eq!(parsed, headers);
    }

    #[test]
    fn test_death_count_uses_latest_matching_entry() {
        let record = |queue: &str, count| DeathRecord {
            reason: DeathReason::Rejected,
            queue: queue.into(),
            count,
            time: Utc::now(),
            exchange: String::new(),
            routing_keys: vec![],
        };
        let mut headers = Headers::new();
        assert_eq!(headers.death_count("work", DeathReason::Rejected), 0);

        headers.death = vec![record("work", 1), record("other", 5), record("work", 2)];
        assert_eq!(headers.death_count("work", DeathReason::Rejected), 2);
        assert_eq!(headers.death_count("other", DeathReason::Rejected), 5);
    }

    #[test]
    fn test_message_defaults() {
        let message = Message::new("emails", "notification", "hello");
        assert_eq!(message.size(), 5);
        assert_eq!(message.body_str(), Some("hello"));
        assert!(!message.is_redelivery());
        assert!(!message.persistent);
    }
}
