use crate::error::{ServiceError, Stage, ProcessError};

/// A batch payload on its way to a worker lane.
pub(crate) struct WorkerRequest<I> {
    pub(crate) batch: u64,
    pub(crate) payload: Vec<I>,
}

/// What a batch turned into inside a worker lane.
pub(crate) type BatchOutcome<O> = Result<Vec<O>, (Stage, ProcessError)>;

/// Messages a worker lane sends back to the controller.
pub(crate) enum WorkerMessage<O> {
    /// The lane built its processor and is listening.
    Ready { lane: usize },

    /// The lane could not build its processor and exited.
    StartupFailed { lane: usize, message: String },

    /// One batch went through all three stages, successfully or not.
    Completed { lane: usize, batch: u64, outcome: BatchOutcome<O> },

    /// The processor panicked while handling `batch`; the lane exited.
    Crashed { lane: usize, batch: u64, message: String },
}

impl<O> WorkerMessage<O> {
    pub(crate) fn lane(&self) -> usize {
        match self {
            WorkerMessage::Ready { lane }
            | WorkerMessage::StartupFailed { lane, .. }
            | WorkerMessage::Completed { lane, .. }
            | WorkerMessage::Crashed { lane, .. } => *lane,
        }
    }
}

/// Converts a stage failure into the error every caller of the batch sees.
pub(crate) fn batch_failure((stage, source): (Stage, ProcessError)) -> ServiceError {
    ServiceError::Batch { stage, source }
}
