//! Exchanges, bindings and the routing table.
//!
//! Routing resolves `(exchange, routing_key)` to a set of queue names. When the
//! owning exchange matches nothing, its alternate exchange is consulted, then
//! that exchange's alternate, and so on. Dangling or cyclic alternates end the
//! walk as "no route".

use crate::error::{BrokerError, ResourceKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

/// Name of the implicit exchange every queue is bound to under its own name.
pub const DEFAULT_EXCHANGE: &str = "";

pub const REPLY_CODE_NO_ROUTE: u16 = 312;
pub const REPLY_TEXT_NO_ROUTE: &str = "NO_ROUTE";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Every bound queue, key ignored.
    Fanout,
    /// Dot-separated words; `*` matches one word, `#` zero or more.
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub alternate: Option<String>,
    bindings: Vec<Binding>,
}

impl Exchange {
    fn new(name: &str, kind: ExchangeKind, alternate: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            alternate: alternate.map(str::to_string),
            bindings: Vec::new(),
        }
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Queues whose bindings match `routing_key`, in binding order, without duplicates.
    pub fn matching_queues(&self, routing_key: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|binding| match self.kind {
                ExchangeKind::Direct => binding.pattern == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
            })
            .filter(|binding| seen.insert(binding.queue.as_str()))
            .map(|binding| binding.queue.clone())
            .collect()
    }
}

/// Outcome of routing one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    /// Matched bindings on the target exchange.
    Delivered(Vec<String>),
    /// Matched only through the alternate exchange chain.
    FallenBack(Vec<String>),
    /// Mandatory publish with no route.
    Returned { reply_code: u16, reply_text: String },
    /// Non-mandatory publish with no route.
    Dropped,
}

impl RouteResult {
    pub(crate) fn no_route(mandatory: bool) -> Self {
        if mandatory {
            RouteResult::Returned {
                reply_code: REPLY_CODE_NO_ROUTE,
                reply_text: REPLY_TEXT_NO_ROUTE.to_string(),
            }
        } else {
            RouteResult::Dropped
        }
    }

    /// Queues the message was (or will be) appended to.
    pub fn queues(&self) -> &[String] {
        match self {
            RouteResult::Delivered(queues) | RouteResult::FallenBack(queues) => queues,
            RouteResult::Returned { .. } | RouteResult::Dropped => &[],
        }
    }

    pub fn is_routed(&self) -> bool {
        !self.queues().is_empty()
    }

    /// Metric/log label.
    pub fn outcome(&self) -> &'static str {
        match self {
            RouteResult::Delivered(_) => "delivered",
            RouteResult::FallenBack(_) => "fallen_back",
            RouteResult::Returned { .. } => "returned",
            RouteResult::Dropped => "dropped",
        }
    }

    /// Turn a `Returned` outcome into [`BrokerError::ReturnedUnroutable`].
    pub fn require_routed(self, exchange: &str, routing_key: &str) -> Result<Self> {
        match self {
            RouteResult::Returned {
                reply_code,
                reply_text,
            } => Err(BrokerError::ReturnedUnroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reply_code,
                reply_text,
            }),
            other => Ok(other),
        }
    }
}

/// Exchange definitions and their bindings.
#[derive(Debug, Default)]
pub struct RoutingTable {
    exchanges: HashMap<String, Exchange>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        name == DEFAULT_EXCHANGE || self.exchanges.contains_key(name)
    }

    /// Declare an exchange. Identical redeclaration is a no-op.
    pub fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        alternate: Option<&str>,
    ) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::invalid("the default exchange cannot be declared"));
        }

        if let Some(existing) = self.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::conflict(
                    ResourceKind::Exchange,
                    name,
                    format!("declared as {}, requested {}", existing.kind, kind),
                ));
            }
            if existing.alternate.as_deref() != alternate {
                return Err(BrokerError::conflict(
                    ResourceKind::Exchange,
                    name,
                    format!(
                        "alternate exchange is {:?}, requested {:?}",
                        existing.alternate, alternate
                    ),
                ));
            }
            debug!(exchange = %name, "Exchange already declared");
            return Ok(());
        }

        info!(exchange = %name, kind = %kind, alternate = ?alternate, "Declared exchange");
        self.exchanges
            .insert(name.to_string(), Exchange::new(name, kind, alternate));
        Ok(())
    }

    pub fn delete_exchange(&mut self, name: &str) -> Result<()> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::invalid("the default exchange cannot be deleted"));
        }
        self.exchanges
            .remove(name)
            .map(|_| info!(exchange = %name, "Deleted exchange"))
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Exchange, name))
    }

    /// Add a binding. Returns `false` when the binding already existed.
    ///
    /// The caller checks that `queue` is declared.
    pub fn bind(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<bool> {
        let exchange = self.exchange_mut(exchange)?;
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if exchange.bindings.contains(&binding) {
            return Ok(false);
        }
        debug!(exchange = %exchange.name, queue = %queue, pattern = %pattern, "Bound queue");
        exchange.bindings.push(binding);
        Ok(true)
    }

    pub fn unbind(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<()> {
        let exchange = self.exchange_mut(exchange)?;
        let before = exchange.bindings.len();
        exchange
            .bindings
            .retain(|b| !(b.queue == queue && b.pattern == pattern));
        if exchange.bindings.len() == before {
            return Err(BrokerError::not_found(
                ResourceKind::Binding,
                format!("{} -> {queue} ({pattern})", exchange.name),
            ));
        }
        Ok(())
    }

    /// Drop every binding that targets `queue`; used when the queue is deleted.
    pub fn remove_queue_bindings(&mut self, queue: &str) -> usize {
        self.exchanges
            .values_mut()
            .map(|exchange| {
                let before = exchange.bindings.len();
                exchange.bindings.retain(|b| b.queue != queue);
                before - exchange.bindings.len()
            })
            .sum()
    }

    /// Resolve a publish to its destination queues.
    ///
    /// `queue_exists` answers for the default exchange, whose bindings are implicit.
    pub fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        queue_exists: impl Fn(&str) -> bool,
    ) -> Result<RouteResult> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(if queue_exists(routing_key) {
                RouteResult::Delivered(vec![routing_key.to_string()])
            } else {
                RouteResult::no_route(mandatory)
            });
        }

        let owner = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Exchange, exchange))?;

        let queues = owner.matching_queues(routing_key);
        if !queues.is_empty() {
            return Ok(RouteResult::Delivered(queues));
        }

        let mut visited = HashSet::from([owner.name.as_str()]);
        let mut next = owner.alternate.as_deref();
        while let Some(name) = next {
            if !visited.insert(name) {
                warn!(exchange = %exchange, alternate = %name, "Alternate exchange cycle");
                break;
            }
            let Some(alternate) = self.exchanges.get(name) else {
                warn!(exchange = %exchange, alternate = %name, "Alternate exchange not declared");
                break;
            };
            let queues = alternate.matching_queues(routing_key);
            if !queues.is_empty() {
                return Ok(RouteResult::FallenBack(queues));
            }
            next = alternate.alternate.as_deref();
        }

        Ok(RouteResult::no_route(mandatory))
    }

    fn exchange_mut(&mut self, name: &str) -> Result<&mut Exchange> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::invalid(
                "bindings on the default exchange are implicit",
            ));
        }
        self.exchanges
            .get_mut(name)
            .ok_or_else(|| BrokerError::not_found(ResourceKind::Exchange, name))
    }
}

/// AMQP-style topic matching over dot-separated words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}
