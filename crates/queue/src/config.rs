//! Queue configuration
//!
//! [`QueueConfig`] is read once when a [`QueueService`](crate::QueueService)
//! is built and shared read-only by the poller, dispatcher and reaper.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// How the poller discovers work
///
/// The set is closed: each variant only changes the claim filter and what
/// wakes the poller up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    /// Entries are dispatched on the node that created them; timer polling
    StickyPolling,
    /// Like `StickyPolling`, plus an immediate wake-up on local commits
    StickyEvents,
    /// Any node claims any available entry; timer polling
    Polling,
}

impl DispatchMode {
    /// Whether claims are restricted to entries created by the local node
    pub fn is_sticky(self) -> bool {
        matches!(self, DispatchMode::StickyPolling | DispatchMode::StickyEvents)
    }

    /// Whether commit notifications wake the poller
    pub fn wakes_on_commit(self) -> bool {
        matches!(self, DispatchMode::StickyEvents)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::StickyPolling => "STICKY_POLLING",
            DispatchMode::StickyEvents => "STICKY_EVENTS",
            DispatchMode::Polling => "POLLING",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STICKY_POLLING" => Ok(DispatchMode::StickyPolling),
            "STICKY_EVENTS" => Ok(DispatchMode::StickyEvents),
            "POLLING" => Ok(DispatchMode::Polling),
            other => Err(ConfigError::InvalidValue {
                key: "dispatch_mode".into(),
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration errors
///
/// Any of these keeps the service from entering `RUNNING`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Two settings contradict each other
    #[error("invalid bounds: {0}")]
    InvalidBounds(String),

    /// A setting that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A table identifier is not a plain SQL identifier
    #[error("invalid table identifier: {0:?}")]
    InvalidIdentifier(String),

    /// An environment value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// No entry store was supplied and the in-memory flag is off
    #[error("no entry store configured (set in_memory or provide a store)")]
    MissingStore,
}

/// Persistent queue configuration
///
/// # Example
///
/// ```
/// use everruns_queue::{DispatchMode, QueueConfig};
/// use std::time::Duration;
///
/// let config = QueueConfig::default()
///     .with_dispatch_mode(DispatchMode::Polling)
///     .with_max_failure_retries(5)
///     .with_in_flight_bounds(10, 200)
///     .with_polling_interval(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Claim filter and wake-up policy
    pub dispatch_mode: DispatchMode,

    /// Handler failures tolerated before an entry is marked `FAILED`
    pub max_failure_retries: u32,

    /// Below this many in-flight entries the poller re-polls without sleeping
    pub min_in_flight_entries: usize,

    /// Hard bound on claimed-but-unfinished entries held by this node
    pub max_in_flight_entries: usize,

    /// Upper bound on entries claimed in one poll cycle
    pub max_entries_claimed: usize,

    /// Time a handler gets before its invocation is abandoned
    #[serde(with = "duration_millis")]
    pub claim_timeout: Duration,

    /// Sleep between poll cycles
    #[serde(with = "duration_millis")]
    pub polling_interval: Duration,

    /// Global pause switch: no claims are made while set
    pub processing_off: bool,

    /// Capacity of the in-memory buffer between poller and dispatchers
    pub event_queue_capacity: usize,

    /// Number of dispatcher workers
    pub max_dispatch_threads: usize,

    /// Number of poller tasks claiming in parallel
    pub lifecycle_dispatch_threads: usize,

    /// Concurrent outcome writes (processed/retry/failed + archival)
    pub lifecycle_complete_threads: usize,

    /// Primary entry table
    pub table_name: String,

    /// Append-only history table
    pub history_table_name: String,

    /// Claims older than this are considered abandoned
    #[serde(with = "duration_millis")]
    pub reap_threshold: Duration,

    /// Interval between reaper sweeps
    #[serde(with = "duration_millis")]
    pub reap_schedule: Duration,

    /// Maximum entries reclaimed by one reaper sweep
    pub max_redispatch_count: usize,

    /// Use the in-memory entry store instead of the database
    pub in_memory: bool,

    /// Backoff applied to `available_time` after a retryable failure
    pub retry: RetryPolicy,

    /// Grace period for draining dispatchers on stop
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Polling,
            max_failure_retries: 3,
            min_in_flight_entries: 1,
            max_in_flight_entries: 100,
            max_entries_claimed: 10,
            claim_timeout: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(3),
            processing_off: false,
            event_queue_capacity: 1000,
            max_dispatch_threads: 10,
            lifecycle_dispatch_threads: 1,
            lifecycle_complete_threads: 2,
            table_name: "queue_entries".to_string(),
            history_table_name: "queue_entries_history".to_string(),
            reap_threshold: Duration::from_secs(10 * 60),
            reap_schedule: Duration::from_secs(3 * 60),
            max_redispatch_count: 10,
            in_memory: false,
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `QUEUE_*` environment variables
    ///
    /// Unset variables keep their default. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            })
        }

        let mut config = Self::default();

        if let Some(v) = lookup("QUEUE_DISPATCH_MODE") {
            config.dispatch_mode = v.parse()?;
        }
        if let Some(v) = lookup("QUEUE_MAX_FAILURE_RETRIES") {
            config.max_failure_retries = parse("QUEUE_MAX_FAILURE_RETRIES", v)?;
        }
        if let Some(v) = lookup("QUEUE_MIN_IN_FLIGHT_ENTRIES") {
            config.min_in_flight_entries = parse("QUEUE_MIN_IN_FLIGHT_ENTRIES", v)?;
        }
        if let Some(v) = lookup("QUEUE_MAX_IN_FLIGHT_ENTRIES") {
            config.max_in_flight_entries = parse("QUEUE_MAX_IN_FLIGHT_ENTRIES", v)?;
        }
        if let Some(v) = lookup("QUEUE_MAX_ENTRIES_CLAIMED") {
            config.max_entries_claimed = parse("QUEUE_MAX_ENTRIES_CLAIMED", v)?;
        }
        if let Some(v) = lookup("QUEUE_CLAIM_TIMEOUT_MS") {
            config.claim_timeout = Duration::from_millis(parse("QUEUE_CLAIM_TIMEOUT_MS", v)?);
        }
        if let Some(v) = lookup("QUEUE_POLLING_INTERVAL_MS") {
            config.polling_interval =
                Duration::from_millis(parse("QUEUE_POLLING_INTERVAL_MS", v)?);
        }
        if let Some(v) = lookup("QUEUE_PROCESSING_OFF") {
            config.processing_off = parse("QUEUE_PROCESSING_OFF", v)?;
        }
        if let Some(v) = lookup("QUEUE_EVENT_QUEUE_CAPACITY") {
            config.event_queue_capacity = parse("QUEUE_EVENT_QUEUE_CAPACITY", v)?;
        }
        if let Some(v) = lookup("QUEUE_MAX_DISPATCH_THREADS") {
            config.max_dispatch_threads = parse("QUEUE_MAX_DISPATCH_THREADS", v)?;
        }
        if let Some(v) = lookup("QUEUE_LIFECYCLE_DISPATCH_THREADS") {
            config.lifecycle_dispatch_threads = parse("QUEUE_LIFECYCLE_DISPATCH_THREADS", v)?;
        }
        if let Some(v) = lookup("QUEUE_LIFECYCLE_COMPLETE_THREADS") {
            config.lifecycle_complete_threads = parse("QUEUE_LIFECYCLE_COMPLETE_THREADS", v)?;
        }
        if let Some(v) = lookup("QUEUE_TABLE_NAME") {
            config.table_name = v;
        }
        if let Some(v) = lookup("QUEUE_HISTORY_TABLE_NAME") {
            config.history_table_name = v;
        }
        if let Some(v) = lookup("QUEUE_REAP_THRESHOLD_MS") {
            config.reap_threshold = Duration::from_millis(parse("QUEUE_REAP_THRESHOLD_MS", v)?);
        }
        if let Some(v) = lookup("QUEUE_REAP_SCHEDULE_MS") {
            config.reap_schedule = Duration::from_millis(parse("QUEUE_REAP_SCHEDULE_MS", v)?);
        }
        if let Some(v) = lookup("QUEUE_MAX_REDISPATCH_COUNT") {
            config.max_redispatch_count = parse("QUEUE_MAX_REDISPATCH_COUNT", v)?;
        }
        if let Some(v) = lookup("QUEUE_IN_MEMORY") {
            config.in_memory = parse("QUEUE_IN_MEMORY", v)?;
        }
        if let Some(v) = lookup("QUEUE_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout =
                Duration::from_millis(parse("QUEUE_SHUTDOWN_TIMEOUT_MS", v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the dispatch mode
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set the maximum number of handler failures before `FAILED`
    pub fn with_max_failure_retries(mut self, retries: u32) -> Self {
        self.max_failure_retries = retries;
        self
    }

    /// Set the minimum and maximum in-flight entries
    pub fn with_in_flight_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_in_flight_entries = min;
        self.max_in_flight_entries = max;
        self
    }

    /// Set the number of entries claimed per poll cycle
    pub fn with_max_entries_claimed(mut self, max: usize) -> Self {
        self.max_entries_claimed = max;
        self
    }

    /// Set the claim timeout
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Pause or resume claiming
    pub fn with_processing_off(mut self, off: bool) -> Self {
        self.processing_off = off;
        self
    }

    /// Set the buffer capacity
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the number of dispatcher workers
    pub fn with_max_dispatch_threads(mut self, threads: usize) -> Self {
        self.max_dispatch_threads = threads;
        self
    }

    /// Set lifecycle thread counts (poller tasks, concurrent outcome writes)
    pub fn with_lifecycle_threads(mut self, dispatch: usize, complete: usize) -> Self {
        self.lifecycle_dispatch_threads = dispatch;
        self.lifecycle_complete_threads = complete;
        self
    }

    /// Set primary and history table names
    pub fn with_table_names(
        mut self,
        table_name: impl Into<String>,
        history_table_name: impl Into<String>,
    ) -> Self {
        self.table_name = table_name.into();
        self.history_table_name = history_table_name.into();
        self
    }

    /// Set reaper threshold and schedule
    pub fn with_reaper(mut self, threshold: Duration, schedule: Duration) -> Self {
        self.reap_threshold = threshold;
        self.reap_schedule = schedule;
        self
    }

    /// Set the maximum entries reclaimed per reaper sweep
    pub fn with_max_redispatch_count(mut self, count: usize) -> Self {
        self.max_redispatch_count = count;
        self
    }

    /// Use the in-memory entry store
    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_in_flight_entries", self.max_in_flight_entries),
            ("max_entries_claimed", self.max_entries_claimed),
            ("event_queue_capacity", self.event_queue_capacity),
            ("max_dispatch_threads", self.max_dispatch_threads),
            ("lifecycle_dispatch_threads", self.lifecycle_dispatch_threads),
            ("lifecycle_complete_threads", self.lifecycle_complete_threads),
            ("max_redispatch_count", self.max_redispatch_count),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let durations = [
            ("claim_timeout", self.claim_timeout),
            ("polling_interval", self.polling_interval),
            ("reap_threshold", self.reap_threshold),
            ("reap_schedule", self.reap_schedule),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.min_in_flight_entries > self.max_in_flight_entries {
            return Err(ConfigError::InvalidBounds(format!(
                "min_in_flight_entries ({}) exceeds max_in_flight_entries ({})",
                self.min_in_flight_entries, self.max_in_flight_entries
            )));
        }

        // A reaper faster than the handler timeout would steal live claims.
        if self.reap_threshold < self.claim_timeout {
            return Err(ConfigError::InvalidBounds(format!(
                "reap_threshold ({:?}) is shorter than claim_timeout ({:?})",
                self.reap_threshold, self.claim_timeout
            )));
        }

        self.retry.validate()?;

        validate_identifier(&self.table_name)?;
        validate_identifier(&self.history_table_name)?;
        if self.table_name == self.history_table_name {
            return Err(ConfigError::InvalidBounds(
                "table_name and history_table_name must differ".into(),
            ));
        }

        Ok(())
    }
}

/// Check that a table name is a plain (optionally schema-qualified) SQL identifier
///
/// Table names are interpolated into queries, so only `[A-Za-z_][A-Za-z0-9_]*`
/// segments of at most 63 bytes are accepted.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() > 2 {
        return Err(ConfigError::InvalidIdentifier(name.to_string()));
    }

    for segment in segments {
        let mut chars = segment.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_start || !valid_rest || segment.len() > 63 {
            return Err(ConfigError::InvalidIdentifier(name.to_string()));
        }
    }

    Ok(())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
