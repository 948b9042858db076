//! # Controller pipeline
//!
//! The tokio side of the service. Items flow through three cooperating
//! stages that only ever talk through channels:
//!
//! * [`batcher`] - buffers submitted items and seals them into batches, on
//!   size or on the per-buffer timer, deferring a flush while downstream
//!   capacity is exhausted.
//!
//! * [`preprocessor`] - moves sealed batches off the batch queue, parks their
//!   result slots and hands the payload to a worker lane.
//!
//! * [`postprocessor`] - pairs worker output with the parked slots and
//!   delivers results, escalating protocol violations and crashed lanes to a
//!   service-wide shutdown.
//!
//! [`task`] wraps the spawned loops so the service can join them on stop,
//! and [`stats`] holds the counters surfaced through
//! [`BatchService::stats`](crate::BatchService::stats).
pub(crate) mod batcher;
pub(crate) mod postprocessor;
pub(crate) mod preprocessor;
pub(crate) mod stats;
pub(crate) mod task;
