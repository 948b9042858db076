//! Worker lanes: the isolated side of the pipeline.
//!
//! Each lane is a dedicated OS thread that owns one processor instance and
//! talks to the controller only through an inbound and an outbound channel.
//! Everything crossing that boundary is moved, never shared.
//!
//! Lanes share the host process: an unwinding panic is contained and reported
//! as a crash, but an abort inside a lane takes the whole process down.

mod lane;
mod pool;

pub(crate) use lane::{panic_message, ProcessorFactory};
pub(crate) use pool::WorkerPool;
