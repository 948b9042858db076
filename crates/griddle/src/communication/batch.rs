use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;
use super::result_handle::ResultSlot;
use crate::error::{ProtocolViolation, ServiceError};

/// Why a buffer was sealed into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushReason {
    /// The buffer reached `max_batch_size`
    Size,
    /// The timer armed by the buffer's first item fired
    Timeout,
    /// An earlier flush was deferred by backpressure and has now gone through
    Retry,
}

impl FlushReason {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Retry => "retry",
        }
    }
}

/// # SealedBatch
///
/// Items flushed from the batcher's buffer, paired position-for-position with
/// the slots that will receive their results.
///
/// The batch also carries the in-flight permit acquired at flush time; the
/// permit moves into the [`PendingRecord`] and is released only once the
/// batch's results have been delivered.
pub(crate) struct SealedBatch<I, O> {
    /// Monotonic identifier assigned at flush
    id: u64,

    /// Items in submission order
    items: Vec<I>,

    /// Result destinations, `slots[i]` belongs to `items[i]`
    slots: Vec<ResultSlot<O>>,

    /// In-flight capacity held by this batch
    permit: OwnedSemaphorePermit,

    reason: FlushReason,
}

impl<I, O> SealedBatch<I, O> {
    pub(crate) fn new(
        id: u64,
        items: Vec<I>,
        slots: Vec<ResultSlot<O>>,
        permit: OwnedSemaphorePermit,
        reason: FlushReason,
    ) -> Self {
        debug_assert_eq!(items.len(), slots.len());
        Self { id, items, slots, permit, reason }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn reason(&self) -> FlushReason {
        self.reason
    }

    /// Separates the payload from its result destinations.
    pub(crate) fn into_parts(self) -> (Vec<I>, PendingRecord<O>) {
        let record = PendingRecord {
            id: self.id,
            slots: self.slots,
            _permit: self.permit,
        };
        (self.items, record)
    }

    /// Abandons the batch, settling every slot with `cause`.
    pub(crate) fn abandon(self, cause: &ServiceError) {
        let (_, record) = self.into_parts();
        record.fail(cause);
    }
}

/// # PendingRecord
///
/// Result slots of one batch waiting for the worker's output.
pub(crate) struct PendingRecord<O> {
    id: u64,
    slots: Vec<ResultSlot<O>>,
    _permit: OwnedSemaphorePermit,
}

impl<O> PendingRecord<O> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Resolves `slots[i]` with `outputs[i]`.
    ///
    /// # Errors
    ///
    /// A length mismatch resolves nothing and hands the record back so the
    /// caller can fail it with the violation.
    pub(crate) fn complete(self, outputs: Vec<O>) -> Result<usize, (ProtocolViolation, Self)> {
        if outputs.len() != self.slots.len() {
            let violation = ProtocolViolation::LengthMismatch {
                batch: self.id,
                outputs: outputs.len(),
                handles: self.slots.len(),
            };
            return Err((violation, self));
        }
        let (id, expected) = (self.id, self.slots.len());
        let delivered = self
            .slots
            .into_iter()
            .zip(outputs)
            .map(|(slot, output)| slot.resolve(Ok(output)))
            .filter(|delivered| *delivered)
            .count();
        if delivered < expected {
            debug!(batch = id, delivered, expected, "callers dropped result handles before delivery");
        }
        Ok(delivered)
    }

    /// Settles every slot with the same error.
    pub(crate) fn fail(self, error: &ServiceError) -> usize {
        self.slots
            .into_iter()
            .map(|slot| slot.resolve(Err::<O, _>(error.clone())))
            .filter(|delivered| *delivered)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use crate::communication::result_channel;

    fn sealed(id: u64, items: Vec<i32>, permits: &Arc<Semaphore>) -> (SealedBatch<i32, i32>, Vec<crate::ResultHandle<i32>>) {
        let (slots, handles): (Vec<_>, Vec<_>) = items.iter().map(|_| result_channel()).unzip();
        let permit = permits.clone().try_acquire_owned().unwrap();
        (SealedBatch::new(id, items, slots, permit, FlushReason::Size), handles)
    }

    #[tokio::test]
    async fn test_complete_resolves_positionally() {
        let permits = Arc::new(Semaphore::new(1));
        let (batch, handles) = sealed(7, vec![1, 2, 3], &permits);
        assert_eq!(batch.id(), 7);
        assert_eq!(batch.len(), 3);

        let (items, record) = batch.into_parts();
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(permits.available_permits(), 0);

        let outputs = items.iter().map(|i| i * 10).collect();
        assert_eq!(record.complete(outputs).ok(), Some(3));
        assert_eq!(permits.available_permits(), 1, "permit released after delivery");

        let results = futures::future::join_all(handles).await;
        assert_eq!(results, vec![Ok(10), Ok(20), Ok(30)]);
    }

    #[tokio::test]
    async fn test_complete_rejects_length_mismatch() {
        let permits = Arc::new(Semaphore::new(1));
        let (batch, handles) = sealed(2, vec![1, 2], &permits);
        let (_, record) = batch.into_parts();

        let (violation, record) = match record.complete(vec![1]) {
            Err(rejected) => rejected,
            Ok(_) => panic!("mismatched outputs must be rejected"),
        };
        assert_eq!(violation, ProtocolViolation::LengthMismatch { batch: 2, outputs: 1, handles: 2 });
        assert_eq!(record.len(), 2);

        let error = ServiceError::from(violation);
        assert_eq!(record.fail(&error), 2);
        for result in futures::future::join_all(handles).await {
            assert_eq!(result, Err(error.clone()));
        }
    }

    #[tokio::test]
    async fn test_abandon_settles_every_slot() {
        let permits = Arc::new(Semaphore::new(1));
        let (batch, handles) = sealed(0, vec![4, 5], &permits);
        batch.abandon(&ServiceError::Stopped);

        assert_eq!(permits.available_permits(), 1);
        for result in futures::future::join_all(handles).await {
            assert_eq!(result, Err(ServiceError::Stopped));
        }
    }

    #[test]
    fn test_flush_reason_labels() {
        assert_eq!(FlushReason::Size.as_str(), "size");
        assert_eq!(FlushReason::Timeout.as_str(), "timeout");
        assert_eq!(FlushReason::Retry.as_str(), "retry");
    }
}
