use std::time::Duration;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use crate::error::ConfigError;

/// Upper bound accepted for [`ServiceConfig::max_batch_size`].
pub const MAX_BATCH_SIZE_LIMIT: usize = 10_000;

/// How results are paired with callers once batches leave the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResultOrdering {
    /// One worker lane; batches complete strictly in the order they were flushed.
    #[default]
    Ordered,

    /// Several worker lanes; a batch's results are delivered as soon as its
    /// lane finishes, regardless of older batches still in flight.
    Unordered,
}

/// # ServiceConfig
///
/// Tuning knobs for a [`BatchService`](crate::BatchService).
///
/// ```rust
/// use std::time::Duration;
/// use griddle::ServiceConfig;
///
/// let config = ServiceConfig::default()
///     .with_max_batch_size(200)
///     .with_timeout(Duration::from_millis(5))
///     .with_max_queue_size(2);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServiceConfig {
    /// Upper bound on items per batch and on buffer occupancy
    pub max_batch_size: usize,

    /// Longest a partial buffer waits, measured from its first item, before it is flushed
    pub timeout: Duration,

    /// Upper bound on batches in flight between flush and result delivery
    pub max_queue_size: usize,

    /// Result delivery order
    pub ordering: ResultOrdering,

    /// Number of worker threads running the processor
    pub worker_lanes: usize,

    /// Cadence at which blocked submits and deferred flushes retry
    pub retry_interval: Duration,

    /// How long `start` waits for every worker lane to report ready
    pub startup_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            timeout: Duration::from_millis(10),
            max_queue_size: 4,
            ordering: ResultOrdering::Ordered,
            worker_lanes: 1,
            retry_interval: Duration::from_millis(1),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl ServiceConfig {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Switches to unordered delivery across `lanes` worker threads.
    pub fn unordered(mut self, lanes: usize) -> Self {
        self.ordering = ResultOrdering::Unordered;
        self.worker_lanes = lanes;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Checks every bound the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE_LIMIT {
            return Err(ConfigError::BatchSize {
                got: self.max_batch_size,
                max: MAX_BATCH_SIZE_LIMIT,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        // Both the in-flight semaphore and the bounded channels are sized by it.
        if self.max_queue_size > Semaphore::MAX_PERMITS {
            return Err(ConfigError::QueueSize {
                got: self.max_queue_size,
                max: Semaphore::MAX_PERMITS,
            });
        }
        if self.worker_lanes == 0 {
            return Err(ConfigError::ZeroWorkerLanes);
        }
        if self.ordering == ResultOrdering::Ordered && self.worker_lanes != 1 {
            return Err(ConfigError::OrderedRequiresSingleLane { lanes: self.worker_lanes });
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::ZeroRetryInterval);
        }
        Ok(())
    }
}
