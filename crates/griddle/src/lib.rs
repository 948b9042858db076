//! # Griddle
//!
//! An asynchronous **request batching** service: callers submit single items
//! and await single results, while the service groups concurrent submissions
//! into batches and runs them through a vectorized computation.
//!
//! ## Overview
//!
//! Many computations are far cheaper per item when run over many items at
//! once: a neural network forward pass, a matrix multiplication, a bulk
//! lookup. Griddle lets independent callers share that economy without
//! coordinating with each other. Each caller sees a plain
//! `submit → result` interface; batching happens behind it.
//!
//! ## Architecture
//!
//! ```text
//! submit ─▶ Batcher ─▶ batch queue ─▶ Preprocessor ─▶ worker lanes
//!                                         │               │
//!                                         ▼               ▼
//!                                  pending results ─▶ Postprocessor ─▶ ResultHandle
//! ```
//!
//! * The **batcher** buffers items and seals a batch when the buffer reaches
//!   `max_batch_size`, or when `timeout` has passed since its first item.
//! * The **preprocessor** parks each batch's result handles and hands the
//!   payload to a worker lane.
//! * **Worker lanes** are dedicated threads, each owning one processor
//!   built by a factory. They run `preprocess → transform → postprocess`
//!   one batch at a time.
//! * The **postprocessor** pairs outputs with the parked handles by
//!   position and resolves them.
//!
//! At most `max_queue_size` batches are in flight at once. When that limit
//! is reached, flushing is deferred and submitters wait for buffer space;
//! nothing is dropped.
//!
//! ### Ordering
//!
//! With [`ResultOrdering::Ordered`] (the default) a single lane processes
//! batches in flush order and results come back FIFO end-to-end.
//! [`ResultOrdering::Unordered`] runs several lanes and delivers each batch
//! as soon as its lane finishes.
//!
//! ### Failures
//!
//! A processor error fails the whole batch it occurred in: every caller of
//! that batch receives the same [`ServiceError::Batch`]. A protocol violation,
//! a crashed lane or a panicking batch hook stops the service, and every
//! outstanding handle is settled with that error. After [`BatchService::stop`] no handle is left
//! hanging; each reports [`ServiceError::Stopped`].
//!
//! ## Features
//!
//! - **serde** - `Serialize`/`Deserialize` for [`ServiceConfig`]
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use griddle::{BatchService, BatchSubmitter, ProcessError, ServiceConfig, Vectorized};
//!
//! struct Embed;
//!
//! impl Vectorized for Embed {
//!     type Input = String;
//!     type Output = usize;
//!
//!     fn transform(&mut self, batch: &[String]) -> Result<Vec<usize>, ProcessError> {
//!         Ok(batch.iter().map(String::len).collect())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() -> Result<(), griddle::ServiceError> {
//! let config = ServiceConfig::default()
//!     .with_max_batch_size(64)
//!     .with_timeout(Duration::from_millis(5));
//! let service = BatchService::new(config, || Ok(Embed))?;
//! service.start().await?;
//!
//! let lengths = service
//!     .submit_all(vec!["one".to_string(), "three".to_string()])
//!     .await;
//! assert_eq!(lengths, vec![Ok(3), Ok(5)]);
//!
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

mod communication;
mod config;
mod core;
mod error;
mod processor;
mod service;
mod worker;

pub use communication::{Outcome, ResultHandle};
pub use config::{ResultOrdering, ServiceConfig, MAX_BATCH_SIZE_LIMIT};
pub use crate::core::stats::StatsSnapshot;
pub use error::{ConfigError, ProcessError, ProtocolViolation, ServiceError, Stage};
pub use processor::Vectorized;
pub use service::{BatchService, BatchSubmitter, ServiceState};
