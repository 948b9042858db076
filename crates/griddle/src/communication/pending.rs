//! The Pending-Results Queue: result slots parked between the preprocessor
//! and the postprocessor while their batch is inside a worker lane.
//!
//! In ordered mode this is a FIFO, and the n-th record must match the n-th
//! outbound batch. In unordered mode records are keyed by batch id because
//! lanes finish in any order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use super::batch::PendingRecord;
use crate::config::ResultOrdering;
use crate::error::ProtocolViolation;

type RecordMap<O> = Arc<Mutex<HashMap<u64, PendingRecord<O>>>>;

pub(crate) fn pending_queue<O>(ordering: ResultOrdering) -> (PendingSender<O>, PendingReceiver<O>) {
    match ordering {
        ResultOrdering::Ordered => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                PendingSender::Ordered(tx),
                PendingReceiver { inner: PendingInner::Ordered(rx), stash: Vec::new() },
            )
        }
        ResultOrdering::Unordered => {
            let records: RecordMap<O> = Arc::default();
            (
                PendingSender::Unordered(records.clone()),
                PendingReceiver { inner: PendingInner::Unordered(records), stash: Vec::new() },
            )
        }
    }
}

/// Write side, owned by the preprocessor.
pub(crate) enum PendingSender<O> {
    Ordered(mpsc::UnboundedSender<PendingRecord<O>>),
    Unordered(RecordMap<O>),
}

impl<O> PendingSender<O> {
    /// Parks `record` until its batch comes back.
    ///
    /// # Errors
    ///
    /// Hands the record back if the postprocessor is gone.
    pub(crate) fn register(&self, record: PendingRecord<O>) -> Result<(), PendingRecord<O>> {
        match self {
            PendingSender::Ordered(tx) => tx.send(record).map_err(|rejected| rejected.0),
            PendingSender::Unordered(records) => {
                let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
                records.insert(record.id(), record);
                Ok(())
            }
        }
    }
}

enum PendingInner<O> {
    Ordered(mpsc::UnboundedReceiver<PendingRecord<O>>),
    Unordered(RecordMap<O>),
}

/// Read side, owned by the postprocessor.
pub(crate) struct PendingReceiver<O> {
    inner: PendingInner<O>,
    /// Records pulled out of order, kept so they are settled on drain
    stash: Vec<PendingRecord<O>>,
}

impl<O> PendingReceiver<O> {
    /// Takes the record belonging to `batch`.
    ///
    /// Records are always registered before their payload is handed to a
    /// worker, so the record for a finished batch is already present.
    ///
    /// # Errors
    ///
    /// A missing or out-of-order record is a [`ProtocolViolation`].
    pub(crate) fn claim(&mut self, batch: u64) -> Result<PendingRecord<O>, ProtocolViolation> {
        match &mut self.inner {
            PendingInner::Ordered(rx) => match rx.try_recv() {
                Ok(record) if record.id() == batch => Ok(record),
                Ok(record) => {
                    let expected = record.id();
                    self.stash.push(record);
                    Err(ProtocolViolation::OutOfOrder { expected, received: batch })
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    Err(ProtocolViolation::UnknownBatch { batch })
                }
            },
            PendingInner::Unordered(records) => records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&batch)
                .ok_or(ProtocolViolation::UnknownBatch { batch }),
        }
    }

    /// Removes every parked record, oldest first where order is known.
    pub(crate) fn drain(&mut self) -> Vec<PendingRecord<O>> {
        let mut drained = std::mem::take(&mut self.stash);
        match &mut self.inner {
            PendingInner::Ordered(rx) => {
                rx.close();
                while let Ok(record) = rx.try_recv() {
                    drained.push(record);
                }
            }
            PendingInner::Unordered(records) => {
                let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
                let mut parked: Vec<_> = records.drain().map(|(_, record)| record).collect();
                parked.sort_by_key(PendingRecord::id);
                drained.extend(parked);
            }
        }
        drained
    }
}
