use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::communication::{result_channel, FlushReason, ResultHandle, ResultSlot, SealedBatch, ShutdownSignal};
use crate::error::ServiceError;
use crate::service::ServiceState;
use super::stats::BatchStats;

/// Buffer limits the batcher enforces.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatcherSettings {
    pub(crate) max_batch_size: usize,
    pub(crate) timeout: Duration,
    pub(crate) retry_interval: Duration,
}

/// Everything the batcher mutates. Only ever touched under the mutex, and
/// the mutex is never held across an `.await`, so a flush is one
/// uninterrupted step no matter which task triggers it.
struct BufferState<I, O> {
    items: Vec<I>,
    slots: Vec<ResultSlot<O>>,
    /// Bumped on every flush so a timer armed for an older buffer is ignored
    epoch: u64,
    next_batch: u64,
    timer: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    closed: Option<ServiceError>,
}

impl<I, O> BufferState<I, O> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Settles every buffered item with `cause` and empties the buffer.
    fn abandon(&mut self, cause: &ServiceError) -> usize {
        self.items.clear();
        mem::take(&mut self.slots)
            .into_iter()
            .map(|slot| slot.resolve(Err(cause.clone())))
            .count()
    }
}

enum FlushOutcome {
    Empty,
    Sealed,
    /// No in-flight capacity or no room on the batch queue
    Deferred,
    /// The preprocessor is gone
    Closed,
}

/// # Batcher
///
/// Accumulates submitted items and seals them into batches.
///
/// A buffer is flushed when it reaches `max_batch_size`, or when `timeout`
/// has passed since its first item arrived. A flush needs one in-flight
/// permit and one free slot on the batch queue; when either is missing the
/// flush is retried after `retry_interval` rather than waiting, so
/// [`submit`](Self::submit) never blocks on downstream work. Submitters only
/// wait while the buffer itself is full.
pub(crate) struct Batcher<I, O> {
    settings: BatcherSettings,
    state: Mutex<BufferState<I, O>>,
    batches: mpsc::Sender<SealedBatch<I, O>>,
    in_flight: Arc<Semaphore>,
    /// Woken whenever a flush empties the buffer
    space: Notify,
    stats: Arc<BatchStats>,
    shutdown: ShutdownSignal,
}

impl<I, O> Batcher<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(
        settings: BatcherSettings,
        batches: mpsc::Sender<SealedBatch<I, O>>,
        in_flight: Arc<Semaphore>,
        stats: Arc<BatchStats>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            state: Mutex::new(BufferState {
                items: Vec::with_capacity(settings.max_batch_size),
                slots: Vec::with_capacity(settings.max_batch_size),
                epoch: 0,
                next_batch: 0,
                timer: None,
                retry: None,
                closed: None,
            }),
            batches,
            in_flight,
            space: Notify::new(),
            stats,
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState<I, O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers `item` and returns the handle its result will arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotRunning`] once the batcher has been closed.
    pub(crate) async fn submit(self: &Arc<Self>, item: I) -> Result<ResultHandle<O>, ServiceError> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed.is_some() {
                    return Err(ServiceError::NotRunning(ServiceState::Stopped));
                }
                if state.items.len() < self.settings.max_batch_size {
                    let (slot, handle) = result_channel();
                    state.items.push(item);
                    state.slots.push(slot);
                    self.stats.record_submit();

                    if state.items.len() == 1 {
                        self.arm_timer(&mut state);
                    }
                    if state.items.len() >= self.settings.max_batch_size {
                        state.cancel_timer();
                        self.flush_or_defer(&mut state, FlushReason::Size);
                    }
                    return Ok(handle);
                }
            }

            trace!("buffer full, waiting for a flush");
            let _ = tokio::time::timeout(self.settings.retry_interval, space).await;
        }
    }

    /// Stops accepting items and settles everything still buffered with `cause`.
    pub(crate) fn close(&self, cause: ServiceError) -> usize {
        let abandoned = {
            let mut state = self.lock();
            state.cancel_timer();
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            let abandoned = state.abandon(&cause);
            if state.closed.is_none() {
                state.closed = Some(cause);
            }
            abandoned
        };
        self.space.notify_waiters();
        if abandoned > 0 {
            debug!(abandoned, "settled buffered items on close");
        }
        abandoned
    }

    /// Closes the batcher once the service shutdown fires.
    pub(crate) async fn close_on(self: Arc<Self>) {
        let cause = self.shutdown.triggered().await;
        self.close(cause);
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.lock().items.len()
    }

    fn arm_timer(self: &Arc<Self>, state: &mut BufferState<I, O>) {
        let batcher = Arc::clone(self);
        let epoch = state.epoch;
        let timeout = self.settings.timeout;
        state.cancel_timer();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            batcher.on_timeout(epoch);
        }));
    }

    fn on_timeout(self: &Arc<Self>, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch || state.closed.is_some() {
            return;
        }
        // This task is the timer; drop its own handle instead of aborting it.
        state.timer = None;
        self.flush_or_defer(&mut state, FlushReason::Timeout);
    }

    fn on_retry(self: &Arc<Self>) {
        let mut state = self.lock();
        state.retry = None;
        if state.closed.is_none() {
            self.flush_or_defer(&mut state, FlushReason::Retry);
        }
    }

    fn flush_or_defer(self: &Arc<Self>, state: &mut BufferState<I, O>, reason: FlushReason) {
        match self.try_flush(state, reason) {
            FlushOutcome::Empty | FlushOutcome::Sealed => {}
            FlushOutcome::Deferred => self.schedule_retry(state),
            FlushOutcome::Closed => {
                // Without a preprocessor nothing buffered can ever complete.
                self.shutdown.trigger(ServiceError::PipelineClosed);
                let cause = self.shutdown.cause().unwrap_or(ServiceError::PipelineClosed);
                warn!(cause = %cause, "batch queue closed, abandoning buffered items");
                state.abandon(&cause);
                state.closed = Some(cause);
                self.space.notify_waiters();
            }
        }
    }

    fn try_flush(&self, state: &mut BufferState<I, O>, reason: FlushReason) -> FlushOutcome {
        if state.items.is_empty() {
            return FlushOutcome::Empty;
        }
        let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
            return FlushOutcome::Deferred;
        };
        let queue_slot = match self.batches.try_reserve() {
            Ok(queue_slot) => queue_slot,
            Err(TrySendError::Full(())) => return FlushOutcome::Deferred,
            Err(TrySendError::Closed(())) => return FlushOutcome::Closed,
        };

        let items = mem::replace(&mut state.items, Vec::with_capacity(self.settings.max_batch_size));
        let slots = mem::replace(&mut state.slots, Vec::with_capacity(self.settings.max_batch_size));
        let id = state.next_batch;
        state.next_batch += 1;
        state.epoch += 1;
        state.cancel_timer();

        let len = items.len();
        queue_slot.send(SealedBatch::new(id, items, slots, permit, reason));
        self.stats.record_flush(reason, len);
        self.space.notify_waiters();
        debug!(batch = id, len, reason = reason.as_str(), "flushed batch");
        FlushOutcome::Sealed
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut BufferState<I, O>) {
        if state.retry.is_some() {
            return;
        }
        trace!(buffered = state.items.len(), "flush deferred by backpressure");
        let batcher = Arc::clone(self);
        let delay = self.settings.retry_interval;
        state.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            batcher.on_retry();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    struct Harness {
        batcher: Arc<Batcher<i32, i32>>,
        batches: mpsc::Receiver<SealedBatch<i32, i32>>,
        in_flight: Arc<Semaphore>,
        stats: Arc<BatchStats>,
        shutdown: ShutdownSignal,
    }

    fn harness(max_batch_size: usize, timeout_ms: u64, max_queue_size: usize) -> Harness {
        let (tx, batches) = mpsc::channel(max_queue_size);
        let in_flight = Arc::new(Semaphore::new(max_queue_size));
        let stats = Arc::new(BatchStats::default());
        let settings = BatcherSettings {
            max_batch_size,
            timeout: Duration::from_millis(timeout_ms),
            retry_interval: Duration::from_millis(1),
        };
        let shutdown = ShutdownSignal::new();
        let batcher = Arc::new(Batcher::new(settings, tx, in_flight.clone(), stats.clone(), shutdown.clone()));
        Harness { batcher, batches, in_flight, stats, shutdown }
    }

    fn payload(batch: SealedBatch<i32, i32>) -> Vec<i32> {
        batch.into_parts().0
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_flushes_immediately() {
        let mut h = harness(3, 100, 4);
        let mut handles = Vec::new();
        for item in 1..=3 {
            handles.push(h.batcher.submit(item).await.unwrap());
        }

        let batch = h.batches.try_recv().ok().unwrap();
        assert_eq!(batch.reason(), FlushReason::Size);
        assert_eq!(batch.id(), 0);
        assert_eq!(payload(batch), vec![1, 2, 3]);
        assert_eq!(h.batcher.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_buffer_flushes_on_timeout() {
        let mut h = harness(3, 100, 4);
        let mut handles = Vec::new();
        for item in 1..=5 {
            handles.push(h.batcher.submit(item).await.unwrap());
        }

        let first = h.batches.recv().await.unwrap();
        assert_eq!(first.reason(), FlushReason::Size);
        assert_eq!(payload(first), vec![1, 2, 3]);

        time::sleep(Duration::from_millis(50)).await;
        assert!(h.batches.try_recv().is_err(), "partial buffer must wait for the timeout");

        time::sleep(Duration::from_millis(60)).await;
        let second = h.batches.try_recv().ok().unwrap();
        assert_eq!(second.reason(), FlushReason::Timeout);
        assert_eq!(second.id(), 1);
        assert_eq!(payload(second), vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_flush_next_buffer() {
        let mut h = harness(2, 100, 4);
        let mut handles = Vec::new();

        handles.push(h.batcher.submit(1).await.unwrap());
        time::sleep(Duration::from_millis(60)).await;
        handles.push(h.batcher.submit(2).await.unwrap());
        assert_eq!(payload(h.batches.try_recv().ok().unwrap()), vec![1, 2]);

        // new buffer, its own timer fires at t=160ms, not t=100ms
        handles.push(h.batcher.submit(3).await.unwrap());
        time::sleep(Duration::from_millis(50)).await;
        assert!(h.batches.try_recv().is_err());

        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(payload(h.batches.try_recv().ok().unwrap()), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_deferred_without_in_flight_capacity() {
        let mut h = harness(2, 100, 1);
        let mut handles = Vec::new();
        for item in 1..=2 {
            handles.push(h.batcher.submit(item).await.unwrap());
        }
        let first = h.batches.try_recv().ok().unwrap();
        assert_eq!(h.in_flight.available_permits(), 0);

        // the next full buffer cannot be sealed while `first` holds the only permit
        for item in 3..=4 {
            handles.push(h.batcher.submit(item).await.unwrap());
        }
        time::sleep(Duration::from_millis(10)).await;
        assert!(h.batches.try_recv().is_err());
        assert_eq!(h.batcher.buffered(), 2);

        // a fifth submit waits for space instead of overfilling the buffer
        let blocked = tokio::spawn({
            let batcher = h.batcher.clone();
            async move { batcher.submit(5).await }
        });
        time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        drop(first);
        time::sleep(Duration::from_millis(5)).await;
        let second = h.batches.try_recv().ok().unwrap();
        assert_eq!(second.reason(), FlushReason::Retry);
        assert_eq!(payload(second), vec![3, 4]);

        let fifth = blocked.await.unwrap();
        assert!(fifth.is_ok());
        assert_eq!(h.batcher.buffered(), 1);
        assert_eq!(h.stats.snapshot().largest_batch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_settles_buffer_and_rejects_submits() {
        let mut h = harness(10, 1_000, 4);
        let handle = h.batcher.submit(1).await.unwrap();

        assert_eq!(h.batcher.close(ServiceError::Stopped), 1);
        assert_eq!(handle.await, Err(ServiceError::Stopped));
        assert_eq!(
            h.batcher.submit(2).await.err(),
            Some(ServiceError::NotRunning(ServiceState::Stopped))
        );

        time::sleep(Duration::from_secs(2)).await;
        assert!(h.batches.try_recv().is_err(), "closing cancels the pending timer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_on_shutdown_signal() {
        let h = harness(10, 1_000, 4);
        let watcher = tokio::spawn(h.batcher.clone().close_on());
        let handle = h.batcher.submit(7).await.unwrap();

        let crash = ServiceError::WorkerCrashed { lane: 0, message: "boom".into() };
        h.shutdown.trigger(crash.clone());
        watcher.await.unwrap();

        assert_eq!(handle.await, Err(crash));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_batch_queue_triggers_shutdown() {
        let h = harness(2, 1_000, 4);
        drop(h.batches);
        let first = h.batcher.submit(1).await.unwrap();
        let second = h.batcher.submit(2).await.unwrap();

        assert_eq!(h.shutdown.cause(), Some(ServiceError::PipelineClosed));
        assert_eq!(first.await, Err(ServiceError::PipelineClosed));
        assert_eq!(second.await, Err(ServiceError::PipelineClosed));
        assert_eq!(
            h.batcher.submit(3).await.err(),
            Some(ServiceError::NotRunning(ServiceState::Stopped))
        );
        assert_eq!(h.in_flight.available_permits(), 4);
    }
}
