use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use super::preprocessor::{apply_hook, BatchHook};
use super::stats::BatchStats;
use crate::communication::{batch_failure, BatchOutcome, PendingReceiver, ShutdownSignal, WorkerMessage};
use crate::error::{ServiceError, Stage};

/// # Postprocessor
///
/// Consumes worker output, pairs each finished batch with its pending record
/// and delivers the results.
///
/// A protocol violation, a crashed lane or a panicking hook is fatal: the postprocessor records
/// the error as the shutdown cause and settles every outstanding handle with
/// it, so no caller is left waiting on a service that can no longer answer.
pub(crate) struct Postprocessor<O> {
    outbound: mpsc::Receiver<WorkerMessage<O>>,
    pending: PendingReceiver<O>,
    hook: Option<BatchHook<O>>,
    shutdown: ShutdownSignal,
    stats: Arc<BatchStats>,
}

impl<O: Send + 'static> Postprocessor<O> {
    pub(crate) fn new(
        outbound: mpsc::Receiver<WorkerMessage<O>>,
        pending: PendingReceiver<O>,
        hook: Option<BatchHook<O>>,
        shutdown: ShutdownSignal,
        stats: Arc<BatchStats>,
    ) -> Self {
        Self { outbound, pending, hook, shutdown, stats }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                biased;
                cause = shutdown.triggered() => {
                    self.settle_outstanding(&cause);
                    return;
                }
                message = self.outbound.recv() => message,
            };

            let result = match message {
                Some(message) => self.handle(message),
                None => Err(ServiceError::WorkerCrashed {
                    lane: 0,
                    message: "every worker lane has exited".to_string(),
                }),
            };

            if let Err(fatal) = result {
                error!(error = %fatal, "fatal pipeline error, shutting down");
                self.shutdown.trigger(fatal);
                // The first recorded cause may be an earlier one.
                let cause = self.shutdown.cause().unwrap_or(ServiceError::Stopped);
                self.settle_outstanding(&cause);
                return;
            }
        }
    }

    /// Delivers one worker message. Returns the fatal error, if any.
    fn handle(&mut self, message: WorkerMessage<O>) -> Result<(), ServiceError> {
        match message {
            WorkerMessage::Completed { lane, batch, outcome } => self.deliver(lane, batch, outcome),
            WorkerMessage::Crashed { lane, batch, message } => {
                // Every other batch is still settled on the way out, this one included.
                debug!(lane, batch, "worker lane crashed mid-batch");
                Err(ServiceError::WorkerCrashed { lane, message })
            }
            WorkerMessage::Ready { lane } => {
                warn!(lane, "unexpected ready message after startup");
                Ok(())
            }
            WorkerMessage::StartupFailed { lane, message } => {
                warn!(lane, %message, "unexpected startup failure after startup");
                Ok(())
            }
        }
    }

    fn deliver(&mut self, lane: usize, batch: u64, outcome: BatchOutcome<O>) -> Result<(), ServiceError> {
        let record = self.pending.claim(batch)?;

        match outcome {
            Ok(mut outputs) => {
                if let Some(hook) = &self.hook {
                    outputs = match apply_hook(hook, Stage::Postprocess, outputs) {
                        Ok(outputs) => outputs,
                        Err(fatal) => {
                            self.shutdown.trigger(fatal.clone());
                            record.fail(&fatal);
                            return Err(fatal);
                        }
                    };
                }
                match record.complete(outputs) {
                    Ok(delivered) => {
                        self.stats.record_completed(delivered);
                        trace!(lane, batch, delivered, "delivered batch results");
                        Ok(())
                    }
                    Err((violation, record)) => {
                        let fatal = ServiceError::from(violation);
                        // Stop first, so no caller sees the failure while the
                        // service still reports itself running.
                        self.shutdown.trigger(fatal.clone());
                        record.fail(&fatal);
                        Err(fatal)
                    }
                }
            }
            Err(failure) => {
                let error = batch_failure(failure);
                warn!(lane, batch, len = record.len(), error = %error, "batch failed");
                record.fail(&error);
                self.stats.record_failed_batch();
                Ok(())
            }
        }
    }

    fn settle_outstanding(&mut self, cause: &ServiceError) {
        self.outbound.close();
        let records = self.pending.drain();
        if records.is_empty() {
            return;
        }
        let mut settled = 0;
        for record in records {
            settled += record.fail(cause);
        }
        debug!(settled, cause = %cause, "settled outstanding handles");
    }
}
