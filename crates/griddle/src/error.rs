//! Error types surfaced by the batching service.
//!
//! [`ServiceError`] is what callers see: it is returned directly for usage
//! errors and is the error half of every resolved [`ResultHandle`](crate::ResultHandle).
//! It is `Clone` because a single worker failure is fanned out to every
//! handle of the batch that caused it.

use std::fmt;
use thiserror::Error;
use crate::service::ServiceState;

/// Rejected [`ServiceConfig`](crate::ServiceConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_batch_size must be within 1..={max}, got {got}")]
    BatchSize { got: usize, max: usize },

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("max_queue_size must be at least 1")]
    ZeroQueueSize,

    #[error("max_queue_size must be at most {max}, got {got}")]
    QueueSize { got: usize, max: usize },

    #[error("worker_lanes must be at least 1")]
    ZeroWorkerLanes,

    #[error("ordered results require exactly one worker lane, got {lanes}")]
    OrderedRequiresSingleLane { lanes: usize },

    #[error("retry_interval must be greater than zero")]
    ZeroRetryInterval,
}

/// Failure reported by a [`Vectorized`](crate::Vectorized) implementation.
///
/// Processors return this from any of their three stages; the worker tags it
/// with the [`Stage`] it came from before it reaches callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessError {
    message: String,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The processor stage a batch failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocess,
    Transform,
    Postprocess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preprocess => "preprocess",
            Stage::Transform => "transform",
            Stage::Postprocess => "postprocess",
        };
        f.write_str(name)
    }
}

/// Broken pairing between worker output and pending result handles.
///
/// These never describe a bad request; they mean the pipeline itself lost
/// track of which handles belong to which batch, so the service stops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("batch {batch} produced {outputs} outputs for {handles} handles")]
    LengthMismatch { batch: u64, outputs: usize, handles: usize },

    #[error("received output for batch {received} while batch {expected} was next")]
    OutOfOrder { expected: u64, received: u64 },

    #[error("received output for unknown batch {batch}")]
    UnknownBatch { batch: u64 },
}

/// Errors returned to callers of the service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service is {0}, not running")]
    NotRunning(ServiceState),

    #[error("service has already been started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("worker lane {lane} failed to start: {message}")]
    WorkerStartup { lane: usize, message: String },

    /// The whole batch this item travelled in failed. Every item of that
    /// batch receives the same error, even if only one of them caused it.
    #[error("batch failed during {stage}: {source}")]
    Batch {
        stage: Stage,
        #[source]
        source: ProcessError,
    },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("worker lane {lane} crashed: {message}")]
    WorkerCrashed { lane: usize, message: String },

    /// A controller-side batch hook panicked. The batch it was applied to is
    /// lost, so the service stops.
    #[error("batch {stage} hook panicked: {message}")]
    HookPanicked { stage: Stage, message: String },

    #[error("batch queue closed while the service was running")]
    PipelineClosed,

    #[error("service stopped before a result was produced")]
    Stopped,
}

impl ServiceError {
    /// Whether this error took the whole service down rather than a single batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::Protocol(_)
                | ServiceError::WorkerCrashed { .. }
                | ServiceError::HookPanicked { .. }
                | ServiceError::PipelineClosed
        )
    }
}
