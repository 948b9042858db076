//! Module for handling the controller's background tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// A handle for one long-running background task of the service.
///
/// The task is expected to watch the service's shutdown signal and return on
/// its own; [`join`](Self::join) waits for that, and only aborts the task if
/// it overruns the grace period. Dropping the handle detaches the task.
///
/// # Example
///
/// ```ignore
/// let task = BackgroundTask::spawn("postprocessor", async move {
///     postprocessor.run().await;
/// });
///
/// shutdown.trigger(ServiceError::Stopped);
/// task.join(Duration::from_secs(1)).await;
/// ```
pub(crate) struct BackgroundTask {
    /// Name used in log output
    name: &'static str,

    /// Handle to the spawned task, `None` once joined
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub(crate) fn spawn<F>(name: &'static str, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: Some(tokio::spawn(task)),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits up to `grace` for the task to return, then aborts it.
    pub(crate) async fn join(mut self, grace: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(task = self.name, error = %err, "background task ended abnormally"),
            Err(_) => {
                warn!(task = self.name, ?grace, "background task overran shutdown grace, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use tokio::time;

    #[tokio::test]
    async fn test_join_waits_for_cooperative_exit() {
        let stop = Arc::new(Notify::new());
        let exited = Arc::new(AtomicBool::new(false));

        let task = BackgroundTask::spawn("cooperative", {
            let stop = stop.clone();
            let exited = exited.clone();
            async move {
                stop.notified().await;
                exited.store(true, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        stop.notify_one();
        task.join(Duration::from_secs(1)).await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_aborts_overrunning_task() {
        let exited = Arc::new(AtomicBool::new(false));
        let task = BackgroundTask::spawn("stubborn", {
            let exited = exited.clone();
            async move {
                time::sleep(Duration::from_secs(60)).await;
                exited.store(true, Ordering::SeqCst);
            }
        });

        task.join(Duration::from_millis(50)).await;
        time::sleep(Duration::from_secs(120)).await;
        assert!(!exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_detaches_task() {
        let exited = Arc::new(AtomicBool::new(false));
        {
            let _task = BackgroundTask::spawn("detached", {
                let exited = exited.clone();
                async move {
                    time::sleep(Duration::from_millis(10)).await;
                    exited.store(true, Ordering::SeqCst);
                }
            });
        }

        time::sleep(Duration::from_millis(50)).await;
        assert!(exited.load(Ordering::SeqCst));
    }
}
