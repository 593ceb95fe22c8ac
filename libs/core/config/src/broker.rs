use crate::{env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Default stream segment size (500 MB).
pub const DEFAULT_SEGMENT_SIZE_BYTES: u64 = 500_000_000;

/// Default interval of the stream retention sweep.
pub const DEFAULT_RETENTION_SWEEP: Duration = Duration::from_secs(30);

/// Channel capacity used for consumers with an unbounded prefetch window.
pub const DEFAULT_UNBOUNDED_BUFFER: usize = 256;

/// Process-wide broker settings.
///
/// Per-queue behaviour (retention limits, dead-letter targets) is declared with
/// the queue; this only carries the engine defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How often stream queues are checked against their age/size limits.
    pub retention_sweep_interval: Duration,

    /// Segment size applied when a stream declaration does not set one.
    pub default_segment_size_bytes: u64,

    /// Delivery channel capacity for consumers declared with prefetch 0.
    pub unbounded_prefetch_buffer: usize,
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_sweep_interval(mut self, interval: Duration) -> Self {
        self.retention_sweep_interval = interval;
        self
    }

    pub fn with_default_segment_size_bytes(mut self, bytes: u64) -> Self {
        self.default_segment_size_bytes = bytes;
        self
    }

    pub fn with_unbounded_prefetch_buffer(mut self, capacity: usize) -> Self {
        self.unbounded_prefetch_buffer = capacity.max(1);
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retention_sweep_interval: DEFAULT_RETENTION_SWEEP,
            default_segment_size_bytes: DEFAULT_SEGMENT_SIZE_BYTES,
            unbounded_prefetch_buffer: DEFAULT_UNBOUNDED_BUFFER,
        }
    }
}

impl FromEnv for BrokerConfig {
    /// Reads:
    /// - `BROKER_RETENTION_SWEEP_MS` (default 30000)
    /// - `BROKER_DEFAULT_SEGMENT_BYTES` (default 500000000)
    /// - `BROKER_UNBOUNDED_BUFFER` (default 256)
    fn from_env() -> Result<Self, ConfigError> {
        let sweep_ms = env_parse(
            "BROKER_RETENTION_SWEEP_MS",
            DEFAULT_RETENTION_SWEEP.as_millis() as u64,
        )?;
        if sweep_ms == 0 {
            return Err(ConfigError::ParseError {
                key: "BROKER_RETENTION_SWEEP_MS".to_string(),
                details: "interval must be greater than zero".to_string(),
            });
        }

        let segment = env_parse("BROKER_DEFAULT_SEGMENT_BYTES", DEFAULT_SEGMENT_SIZE_BYTES)?;
        let buffer = env_parse("BROKER_UNBOUNDED_BUFFER", DEFAULT_UNBOUNDED_BUFFER)?;

        Ok(Self::default()
            .with_retention_sweep_interval(Duration::from_millis(sweep_ms))
            .with_default_segment_size_bytes(segment)
            .with_unbounded_prefetch_buffer(buffer))
    }
}
