use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use crate::communication::{PendingSender, SealedBatch, ShutdownSignal, WorkerRequest};
use crate::error::{ServiceError, Stage};
use crate::worker::panic_message;

/// Controller-side hook applied to a whole batch payload before it reaches a
/// worker lane.
pub(crate) type BatchHook<T> = Arc<dyn Fn(Vec<T>) -> Vec<T> + Send + Sync>;

/// Runs `hook` on `batch`, turning a panic into [`ServiceError::HookPanicked`].
pub(crate) fn apply_hook<T>(
    hook: &BatchHook<T>,
    stage: Stage,
    batch: Vec<T>,
) -> Result<Vec<T>, ServiceError> {
    panic::catch_unwind(AssertUnwindSafe(|| hook(batch))).map_err(|payload| {
        ServiceError::HookPanicked { stage, message: panic_message(payload.as_ref()) }
    })
}

/// # Preprocessor
///
/// Drains the batch queue, parks each batch's result slots in the pending
/// queue and forwards the payload to the worker lanes.
///
/// The record is always registered before the payload is sent, so by the time
/// a worker can possibly answer, the postprocessor can already find the slots
/// the answer belongs to.
pub(crate) struct Preprocessor<I, O> {
    batches: mpsc::Receiver<SealedBatch<I, O>>,
    pending: PendingSender<O>,
    workers: mpsc::Sender<WorkerRequest<I>>,
    hook: Option<BatchHook<I>>,
    shutdown: ShutdownSignal,
}

impl<I, O> Preprocessor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(
        batches: mpsc::Receiver<SealedBatch<I, O>>,
        pending: PendingSender<O>,
        workers: mpsc::Sender<WorkerRequest<I>>,
        hook: Option<BatchHook<I>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self { batches, pending, workers, hook, shutdown }
    }

    /// Runs until shutdown or until the batcher is gone.
    pub(crate) async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        loop {
            let batch = tokio::select! {
                biased;
                cause = shutdown.triggered() => {
                    self.abandon_queued(&cause);
                    return;
                }
                batch = self.batches.recv() => match batch {
                    Some(batch) => batch,
                    None => {
                        debug!("batch queue closed, preprocessor exiting");
                        return;
                    }
                },
            };

            if let Err(cause) = self.forward(batch).await {
                // Keeps an earlier cause if one was already recorded.
                self.shutdown.trigger(cause);
                let cause = self.shutdown.cause().unwrap_or(ServiceError::Stopped);
                self.abandon_queued(&cause);
                return;
            }
        }
    }

    async fn forward(&mut self, batch: SealedBatch<I, O>) -> Result<(), ServiceError> {
        let id = batch.id();
        trace!(batch = id, len = batch.len(), reason = batch.reason().as_str(), "forwarding batch");
        let (mut payload, record) = batch.into_parts();
        if let Some(hook) = &self.hook {
            payload = match apply_hook(hook, Stage::Preprocess, payload) {
                Ok(payload) => payload,
                Err(fatal) => {
                    error!(batch = id, error = %fatal, "batch hook panicked, shutting down");
                    self.shutdown.trigger(fatal.clone());
                    record.fail(&fatal);
                    return Err(fatal);
                }
            };
        }

        if let Err(record) = self.pending.register(record) {
            warn!(batch = id, "postprocessor gone, failing batch");
            record.fail(&ServiceError::Stopped);
            return Err(ServiceError::Stopped);
        }

        let request = WorkerRequest { batch: id, payload };
        tokio::select! {
            biased;
            cause = self.shutdown.triggered() => Err(cause),
            sent = self.workers.send(request) => match sent {
                Ok(()) => {
                    trace!(batch = id, "batch handed to worker lanes");
                    Ok(())
                }
                // The record is already parked; the postprocessor settles it
                // once it notices every lane is gone.
                Err(_) => {
                    warn!(batch = id, "no worker lane is accepting batches");
                    Err(ServiceError::Stopped)
                }
            },
        }
    }

    /// Settles every batch still waiting in the batch queue.
    fn abandon_queued(&mut self, cause: &ServiceError) {
        self.batches.close();
        let mut abandoned = 0;
        while let Ok(batch) = self.batches.try_recv() {
            batch.abandon(cause);
            abandoned += 1;
        }
        if abandoned > 0 {
            debug!(abandoned, "abandoned queued batches");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use crate::communication::{pending_queue, result_channel, FlushReason, ResultHandle};
    use crate::config::ResultOrdering;

    fn sealed(id: u64, items: Vec<i32>, permits: &Arc<Semaphore>) -> (SealedBatch<i32, i32>, Vec<ResultHandle<i32>>) {
        let (slots, handles): (Vec<_>, Vec<_>) = items.iter().map(|_| result_channel()).unzip();
        let permit = permits.clone().try_acquire_owned().unwrap();
        (SealedBatch::new(id, items, slots, permit, FlushReason::Size), handles)
    }

    #[tokio::test]
    async fn test_registers_record_before_forwarding() {
        let permits = Arc::new(Semaphore::new(4));
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let (pending_tx, mut pending_rx) = pending_queue::<i32>(ResultOrdering::Ordered);
        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        let hook: BatchHook<i32> = Arc::new(|batch: Vec<i32>| batch.into_iter().map(|x| x + 100).collect());
        let shutdown = ShutdownSignal::new();

        let task = tokio::spawn(
            Preprocessor::new(batch_rx, pending_tx, worker_tx, Some(hook), shutdown.clone()).run(),
        );

        let (batch, _handles) = sealed(0, vec![1, 2, 3], &permits);
        batch_tx.send(batch).await.ok().unwrap();

        let request = worker_rx.recv().await.unwrap();
        assert_eq!(request.batch, 0);
        assert_eq!(request.payload, vec![101, 102, 103]);
        assert_eq!(pending_rx.claim(0).map(|record| record.len()), Ok(3));

        drop(batch_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_abandons_queued_batches() {
        let permits = Arc::new(Semaphore::new(4));
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let (pending_tx, mut pending_rx) = pending_queue::<i32>(ResultOrdering::Ordered);
        // room for one request only, and nobody reads it
        let (worker_tx, _worker_rx) = mpsc::channel(1);
        let shutdown = ShutdownSignal::new();

        let (first, _first_handles) = sealed(0, vec![1], &permits);
        let (second, second_handles) = sealed(1, vec![2], &permits);
        let (third, third_handles) = sealed(2, vec![3], &permits);
        batch_tx.send(first).await.ok().unwrap();
        batch_tx.send(second).await.ok().unwrap();
        batch_tx.send(third).await.ok().unwrap();

        let task = tokio::spawn(
            Preprocessor::new(batch_rx, pending_tx, worker_tx, None, shutdown.clone()).run(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger(ServiceError::Stopped);
        task.await.unwrap();

        // never left the batch queue
        for handle in third_handles {
            assert_eq!(handle.await, Err(ServiceError::Stopped));
        }
        assert_eq!(permits.available_permits(), 2, "the abandoned batch releases its permit");

        // already registered, so they wait for the postprocessor to settle them
        let parked = pending_rx.drain();
        assert_eq!(parked.iter().map(|record| record.id()).collect::<Vec<_>>(), vec![0, 1]);
        for record in parked {
            record.fail(&ServiceError::Stopped);
        }
        for handle in second_handles {
            assert_eq!(handle.await, Err(ServiceError::Stopped));
        }
    }

    #[tokio::test]
    async fn test_panicking_hook_stops_the_pipeline() {
        let permits = Arc::new(Semaphore::new(4));
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let (pending_tx, mut pending_rx) = pending_queue::<i32>(ResultOrdering::Ordered);
        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        let hook: BatchHook<i32> = Arc::new(|_batch: Vec<i32>| -> Vec<i32> { panic!("hook boom") });
        let shutdown = ShutdownSignal::new();

        let (first, first_handles) = sealed(0, vec![1, 2], &permits);
        let (second, second_handles) = sealed(1, vec![3], &permits);
        batch_tx.send(first).await.ok().unwrap();
        batch_tx.send(second).await.ok().unwrap();

        Preprocessor::new(batch_rx, pending_tx, worker_tx, Some(hook), shutdown.clone())
            .run()
            .await;

        let fatal = ServiceError::HookPanicked { stage: Stage::Preprocess, message: "hook boom".into() };
        assert_eq!(shutdown.cause(), Some(fatal.clone()));
        for handle in first_handles.into_iter().chain(second_handles) {
            assert_eq!(handle.await, Err(fatal.clone()));
        }
        assert!(worker_rx.try_recv().is_err(), "nothing reaches the lanes");
        assert!(pending_rx.drain().is_empty());
        assert_eq!(permits.available_permits(), 4);
    }
}
