//! Segmented log backing stream queues.
//!
//! A stream never removes messages on ack. Messages are only evicted by the
//! retention policy, one whole segment at a time, oldest first. The newest
//! (active) segment is never evicted.

use crate::error::{BrokerError, Result};
use crate::queue::StoredMessage;
use chrono::{DateTime, TimeDelta, Utc};
use core_config::broker::DEFAULT_SEGMENT_SIZE_BYTES;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Age/size limits of a stream queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRetention {
    pub max_length_bytes: Option<u64>,
    pub max_age: Option<TimeDelta>,
    pub segment_size_bytes: u64,
}

impl Default for StreamRetention {
    fn default() -> Self {
        Self {
            max_length_bytes: None,
            max_age: None,
            segment_size_bytes: DEFAULT_SEGMENT_SIZE_BYTES,
        }
    }
}

impl StreamRetention {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length_bytes(mut self, bytes: u64) -> Self {
        self.max_length_bytes = Some(bytes);
        self
    }

    pub fn with_max_age(mut self, age: TimeDelta) -> Self {
        self.max_age = Some(age);
        self
    }

    /// Parse and set `max_age` from a string such as `"7D"` or `"12h"`.
    pub fn with_max_age_str(self, age: &str) -> Result<Self> {
        Ok(self.with_max_age(parse_max_age(age)?))
    }

    pub fn with_segment_size_bytes(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.segment_size_bytes == 0 {
            return Err(BrokerError::invalid("segment size must be greater than zero"));
        }
        if self.max_age.is_some_and(|age| age <= TimeDelta::zero()) {
            return Err(BrokerError::invalid("max age must be positive"));
        }
        Ok(())
    }
}

/// Parse a retention age: a positive integer followed by `D` (days), `h`, `m` or `s`.
pub fn parse_max_age(value: &str) -> Result<TimeDelta> {
    let value = value.trim();
    let invalid = || {
        BrokerError::invalid(format!(
            "invalid max age '{value}', expected e.g. 7D, 12h, 30m, 45s"
        ))
    };

    let unit = value.chars().last().ok_or_else(invalid)?;
    let amount: i64 = value[..value.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let age = match unit {
        'D' | 'd' => TimeDelta::try_days(amount),
        'h' => TimeDelta::try_hours(amount),
        'm' => TimeDelta::try_minutes(amount),
        's' => TimeDelta::try_seconds(amount),
        _ => None,
    };
    age.ok_or_else(invalid)
}

/// Where a stream consumer starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOffset {
    /// Oldest retained message.
    First,
    /// Newest retained message.
    Last,
    /// Only messages published after subscribing (the default).
    Next,
    /// Absolute offset.
    Offset(u64),
    /// First message published at or after this instant.
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamOffset::First => f.write_str("first"),
            StreamOffset::Last => f.write_str("last"),
            StreamOffset::Next => f.write_str("next"),
            StreamOffset::Offset(offset) => write!(f, "{offset}"),
            StreamOffset::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl FromStr for StreamOffset {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "first" => Ok(StreamOffset::First),
            "last" => Ok(StreamOffset::Last),
            "next" => Ok(StreamOffset::Next),
            other => {
                if let Ok(offset) = other.parse::<u64>() {
                    return Ok(StreamOffset::Offset(offset));
                }
                DateTime::parse_from_rfc3339(other)
                    .map(|ts| StreamOffset::Timestamp(ts.with_timezone(&Utc)))
                    .map_err(|_| BrokerError::invalid(format!("invalid stream offset '{other}'")))
            }
        }
    }
}

#[derive(Debug)]
struct Segment {
    messages: VecDeque<StoredMessage>,
    bytes: u64,
}

impl Segment {
    fn first_offset(&self) -> Option<u64> {
        self.messages.front().map(|m| m.offset)
    }
}

/// Offset-addressable, segmented view over a stream queue's messages.
#[derive(Debug)]
pub(crate) struct StreamLog {
    retention: StreamRetention,
    segments: VecDeque<Segment>,
    total_bytes: u64,
    /// Publish time of the newest evicted message.
    evicted_through: Option<DateTime<Utc>>,
}

impl StreamLog {
    pub(crate) fn new(retention: StreamRetention) -> Self {
        Self {
            retention,
            segments: VecDeque::new(),
            total_bytes: 0,
            evicted_through: None,
        }
    }

    pub(crate) fn push(&mut self, stored: StoredMessage) {
        let size = stored.message.size();
        let needs_segment = self
            .segments
            .back()
            .is_none_or(|segment| segment.bytes >= self.retention.segment_size_bytes);
        if needs_segment {
            self.segments.push_back(Segment {
                messages: VecDeque::new(),
                bytes: 0,
            });
        }
        if let Some(segment) = self.segments.back_mut() {
            segment.bytes += size;
            segment.messages.push_back(stored);
        }
        self.total_bytes += size;
    }

    pub(crate) fn first_offset(&self) -> Option<u64> {
        self.segments.front().and_then(Segment::first_offset)
    }

    pub(crate) fn last_offset(&self) -> Option<u64> {
        self.segments
            .back()
            .and_then(|segment| segment.messages.back())
            .map(|m| m.offset)
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.iter().map(|s| s.messages.len()).sum()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn locate(&self, offset: u64) -> Option<(usize, usize)> {
        let index = self
            .segments
            .partition_point(|segment| segment.first_offset().is_some_and(|first| first <= offset));
        let segment_index = index.checked_sub(1)?;
        let segment = &self.segments[segment_index];
        let first = segment.first_offset()?;
        let position = usize::try_from(offset - first).ok()?;
        (position < segment.messages.len()).then_some((segment_index, position))
    }

    pub(crate) fn get(&self, offset: u64) -> Option<&StoredMessage> {
        let (segment, position) = self.locate(offset)?;
        self.segments[segment].messages.get(position)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.segments.iter().flat_map(|segment| segment.messages.iter())
    }

    /// Resolve a consumer's starting offset. `tail` is the next offset to be assigned.
    ///
    /// Explicit offsets and timestamps must name something already written:
    /// an offset at or past `tail`, or a timestamp after `now`, is not found.
    pub(crate) fn cursor_for(
        &self,
        queue: &str,
        requested: Option<&StreamOffset>,
        tail: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let not_found = |requested: &StreamOffset| BrokerError::OffsetNotFound {
            queue: queue.to_string(),
            requested: requested.to_string(),
        };

        match requested {
            None | Some(StreamOffset::Next) => Ok(tail),
            Some(StreamOffset::First) => Ok(self.first_offset().unwrap_or(tail)),
            Some(StreamOffset::Last) => Ok(self.last_offset().unwrap_or(tail)),
            Some(requested @ StreamOffset::Offset(offset)) => {
                let oldest = self.first_offset().unwrap_or(tail);
                if *offset < oldest || *offset >= tail {
                    Err(not_found(requested))
                } else {
                    Ok(*offset)
                }
            }
            Some(requested @ StreamOffset::Timestamp(ts)) => {
                if *ts > now || self.evicted_through.is_some_and(|evicted| *ts <= evicted) {
                    return Err(not_found(requested));
                }
                Ok(self
                    .iter()
                    .find(|m| m.enqueued_at >= *ts)
                    .map_or(tail, |m| m.offset))
            }
        }
    }

    fn over_limits(&self, now: DateTime<Utc>) -> bool {
        let over_size = self
            .retention
            .max_length_bytes
            .is_some_and(|max| self.total_bytes > max);
        let over_age = match (self.retention.max_age, self.oldest_enqueued_at()) {
            (Some(max_age), Some(oldest)) => now - oldest > max_age,
            _ => false,
        };
        over_size || over_age
    }

    fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.segments
            .front()
            .and_then(|segment| segment.messages.front())
            .map(|m| m.enqueued_at)
    }

    /// Evict whole segments, oldest first, until the log is within its limits.
    ///
    /// Returns the number of messages evicted.
    pub(crate) fn enforce_retention(&mut self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while self.segments.len() > 1 && self.over_limits(now) {
            let Some(segment) = self.segments.pop_front() else {
                break;
            };
            self.total_bytes -= segment.bytes;
            evicted += segment.messages.len();
            if let Some(newest) = segment.messages.back() {
                self.evicted_through = Some(newest.enqueued_at);
            }
        }
        evicted
    }
}
