use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::debug;
use super::lane::{run_lane, LaneChannels, ProcessorFactory};
use crate::communication::{WorkerMessage, WorkerRequest};
use crate::processor::Vectorized;

/// The OS threads running a service's worker lanes.
pub(crate) struct WorkerPool {
    lanes: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `lanes` threads, each building its own processor from `factory`.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to create a thread. Lanes spawned before the
    /// failure exit on their own once `inbound`'s sender is dropped.
    pub(crate) fn spawn<P: Vectorized>(
        lanes: usize,
        factory: ProcessorFactory<P>,
        inbound: mpsc::Receiver<WorkerRequest<P::Input>>,
        outbound: mpsc::Sender<WorkerMessage<P::Output>>,
    ) -> io::Result<Self> {
        let inbound = Arc::new(Mutex::new(inbound));
        let mut handles = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let channels = LaneChannels {
                inbound: inbound.clone(),
                outbound: outbound.clone(),
            };
            let factory = factory.clone();
            let handle = thread::Builder::new()
                .name(format!("griddle-lane-{lane}"))
                .spawn(move || run_lane(lane, factory, channels))?;
            handles.push(handle);
        }

        Ok(Self { lanes: handles })
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.len()
    }

    /// Lanes whose thread has not exited yet.
    pub(crate) fn live_lanes(&self) -> usize {
        self.lanes.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Lets go of the lane threads.
    ///
    /// Threads cannot be killed; once the inbound channel is closed each lane
    /// exits after the batch it is currently running, and its result is
    /// discarded.
    pub(crate) fn release(self) {
        let live = self.live_lanes();
        if live > 0 {
            debug!(live, "detaching worker lanes still finishing a batch");
        }
    }
}
