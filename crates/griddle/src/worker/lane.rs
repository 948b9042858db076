use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use crate::communication::{BatchOutcome, WorkerMessage, WorkerRequest};
use crate::error::{ProcessError, Stage};
use crate::processor::Vectorized;

/// Builds one processor instance inside a worker lane.
pub(crate) type ProcessorFactory<P> = Arc<dyn Fn() -> Result<P, ProcessError> + Send + Sync>;

/// The two one-directional channels a lane talks through.
///
/// Lanes of the same pool share the inbound receiver; whichever lane is idle
/// takes the next batch.
pub(crate) struct LaneChannels<I, O> {
    pub(crate) inbound: Arc<Mutex<mpsc::Receiver<WorkerRequest<I>>>>,
    pub(crate) outbound: mpsc::Sender<WorkerMessage<O>>,
}

/// Entry point of a worker lane.
///
/// Builds the processor, announces readiness, then runs
/// `preprocess → transform → postprocess` for one batch at a time until the
/// inbound channel closes or the controller stops listening.
pub(crate) fn run_lane<P: Vectorized>(
    lane: usize,
    factory: ProcessorFactory<P>,
    channels: LaneChannels<P::Input, P::Output>,
) {
    let LaneChannels { inbound, outbound } = channels;

    let mut processor = match panic::catch_unwind(AssertUnwindSafe(|| (*factory)())) {
        Ok(Ok(processor)) => processor,
        Ok(Err(err)) => {
            let _ = outbound.blocking_send(WorkerMessage::StartupFailed { lane, message: err.to_string() });
            return;
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let _ = outbound.blocking_send(WorkerMessage::StartupFailed { lane, message });
            return;
        }
    };

    if outbound.blocking_send(WorkerMessage::Ready { lane }).is_err() {
        return;
    }
    debug!(lane, "worker lane listening");

    loop {
        let request = {
            let mut inbound = inbound.lock().unwrap_or_else(PoisonError::into_inner);
            inbound.blocking_recv()
        };
        let Some(WorkerRequest { batch, payload }) = request else {
            break;
        };

        let size = payload.len();
        let message = match panic::catch_unwind(AssertUnwindSafe(|| run_stages(&mut processor, payload))) {
            Ok(outcome) => {
                trace!(lane, batch, size, ok = outcome.is_ok(), "batch processed");
                WorkerMessage::Completed { lane, batch, outcome }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(lane, batch, %message, "processor panicked");
                WorkerMessage::Crashed { lane, batch, message }
            }
        };

        let crashed = matches!(message, WorkerMessage::Crashed { .. });
        if outbound.blocking_send(message).is_err() || crashed {
            break;
        }
    }
    debug!(lane, "worker lane exiting");
}

fn run_stages<P: Vectorized>(processor: &mut P, batch: Vec<P::Input>) -> BatchOutcome<P::Output> {
    let prepared = processor.preprocess(batch).map_err(|err| (Stage::Preprocess, err))?;
    let outputs = processor.transform(&prepared).map_err(|err| (Stage::Transform, err))?;
    processor.postprocess(prepared, outputs).map_err(|err| (Stage::Postprocess, err))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Echo;

    impl Vectorized for Echo {
        type Input = i32;
        type Output = i32;

        fn preprocess(&mut self, batch: Vec<i32>) -> Result<Vec<i32>, ProcessError> {
            if batch.contains(&-1) {
                return Err(ProcessError::new("negative input"));
            }
            Ok(batch)
        }

        fn transform(&mut self, batch: &[i32]) -> Result<Vec<i32>, ProcessError> {
            if batch.contains(&0) {
                panic!("zero reached the kernel");
            }
            Ok(batch.iter().map(|value| value + 100).collect())
        }
    }

    fn spawn_lane(
        factory: ProcessorFactory<Echo>,
    ) -> (mpsc::Sender<WorkerRequest<i32>>, mpsc::Receiver<WorkerMessage<i32>>, thread::JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(2);
        let (outbound_tx, outbound_rx) = mpsc::channel(2);
        let channels = LaneChannels {
            inbound: Arc::new(Mutex::new(inbound_rx)),
            outbound: outbound_tx,
        };
        let handle = thread::spawn(move || run_lane(0, factory, channels));
        (inbound_tx, outbound_rx, handle)
    }

    #[tokio::test]
    async fn test_lane_reports_ready_then_processes() {
        let (inbound, mut outbound, handle) = spawn_lane(Arc::new(|| Ok::<_, ProcessError>(Echo)));
        assert!(matches!(outbound.recv().await, Some(WorkerMessage::Ready { lane: 0 })));

        inbound.send(WorkerRequest { batch: 4, payload: vec![1, 2] }).await.ok().unwrap();
        match outbound.recv().await {
            Some(WorkerMessage::Completed { lane, batch, outcome }) => {
                assert_eq!(lane, 0);
                assert_eq!(batch, 4);
                assert_eq!(outcome, Ok(vec![101, 102]));
            }
            _ => panic!("expected a completed batch"),
        }

        drop(inbound);
        assert!(outbound.recv().await.is_none());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_stage_failure_is_reported_not_fatal() {
        let (inbound, mut outbound, _handle) = spawn_lane(Arc::new(|| Ok::<_, ProcessError>(Echo)));
        assert!(matches!(outbound.recv().await, Some(WorkerMessage::Ready { .. })));

        inbound.send(WorkerRequest { batch: 0, payload: vec![5, -1] }).await.ok().unwrap();
        inbound.send(WorkerRequest { batch: 1, payload: vec![5] }).await.ok().unwrap();

        match outbound.recv().await {
            Some(WorkerMessage::Completed { outcome, .. }) => {
                assert_eq!(outcome, Err((Stage::Preprocess, ProcessError::new("negative input"))));
            }
            _ => panic!("expected a failed batch"),
        }
        match outbound.recv().await {
            Some(WorkerMessage::Completed { outcome, .. }) => assert_eq!(outcome, Ok(vec![105])),
            _ => panic!("lane should keep serving after a stage failure"),
        }
    }

    #[tokio::test]
    async fn test_panic_crashes_lane() {
        let (inbound, mut outbound, handle) = spawn_lane(Arc::new(|| Ok::<_, ProcessError>(Echo)));
        assert!(matches!(outbound.recv().await, Some(WorkerMessage::Ready { .. })));

        inbound.send(WorkerRequest { batch: 9, payload: vec![0] }).await.ok().unwrap();
        match outbound.recv().await {
            Some(WorkerMessage::Crashed { batch, message, .. }) => {
                assert_eq!(batch, 9);
                assert_eq!(message, "zero reached the kernel");
            }
            _ => panic!("expected a crash report"),
        }
        assert!(outbound.recv().await.is_none());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_factory_error_reported() {
        let (_inbound, mut outbound, handle) =
            spawn_lane(Arc::new(|| Err::<Echo, _>(ProcessError::new("weights missing"))));
        match outbound.recv().await {
            Some(WorkerMessage::StartupFailed { lane, message }) => {
                assert_eq!(lane, 0);
                assert_eq!(message, "weights missing");
            }
            _ => panic!("expected a startup failure"),
        }
        handle.join().unwrap();
    }
}
