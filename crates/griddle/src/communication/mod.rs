mod batch;
mod message;
mod pending;
mod result_handle;
mod shutdown;

pub use result_handle::{Outcome, ResultHandle};

pub(crate) use batch::{FlushReason, PendingRecord, SealedBatch};
pub(crate) use message::{batch_failure, BatchOutcome, WorkerMessage, WorkerRequest};
pub(crate) use pending::{pending_queue, PendingReceiver, PendingSender};
pub(crate) use result_handle::{result_channel, ResultSlot};
pub(crate) use shutdown::ShutdownSignal;
