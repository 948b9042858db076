use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use crate::communication::{pending_queue, ResultHandle, ShutdownSignal, WorkerMessage};
use crate::config::ServiceConfig;
use crate::core::batcher::{Batcher, BatcherSettings};
use crate::core::postprocessor::Postprocessor;
use crate::core::preprocessor::{BatchHook, Preprocessor};
use crate::core::stats::{BatchStats, StatsSnapshot};
use crate::core::task::BackgroundTask;
use crate::error::{ProcessError, ServiceError};
use crate::processor::Vectorized;
use crate::worker::{ProcessorFactory, WorkerPool};

/// How long `stop` waits for each background loop before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`BatchService`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted,
    Running,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::NotStarted => "not started",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        })
    }
}

/// What `start` needs and nothing else.
struct Launch<P: Vectorized> {
    factory: ProcessorFactory<P>,
    pre_hook: Option<BatchHook<P::Input>>,
    post_hook: Option<BatchHook<P::Output>>,
}

/// Everything owned by a running service.
struct Active<I, O> {
    batcher: Arc<Batcher<I, O>>,
    shutdown: ShutdownSignal,
    tasks: Vec<BackgroundTask>,
    workers: WorkerPool,
}

enum Lifecycle<P: Vectorized> {
    NotStarted(Launch<P>),
    Starting,
    Running(Active<P::Input, P::Output>),
    /// Carries the error that brought the service down, if it was not an
    /// orderly stop.
    Stopped(Option<ServiceError>),
}

impl<P: Vectorized> Lifecycle<P> {
    fn state(&self) -> ServiceState {
        match self {
            Lifecycle::NotStarted(_) | Lifecycle::Starting => ServiceState::NotStarted,
            Lifecycle::Running(active) if active.shutdown.is_triggered() => ServiceState::Stopped,
            Lifecycle::Running(_) => ServiceState::Running,
            Lifecycle::Stopped(_) => ServiceState::Stopped,
        }
    }
}

/// # BatchService
///
/// The service controller: owns the worker lanes, the batcher and the two
/// transfer loops as one lifecycle unit.
///
/// Callers hand in single items and get single results back. Behind the
/// scenes items are grouped into batches of at most `max_batch_size`, run
/// through a [`Vectorized`] processor on dedicated worker threads, and the
/// outputs are routed back to the caller that submitted each item.
///
/// ## Lifecycle
///
/// `NotStarted → Running → Stopped`. [`start`](Self::start) blocks until
/// every worker lane has built its processor and reported ready.
/// [`stop`](Self::stop) settles every outstanding [`ResultHandle`] with
/// [`ServiceError::Stopped`]. A protocol violation, a crashed lane or a
/// panicking batch hook stops the service on its own, and outstanding
/// handles are settled with that error instead.
///
/// Dropping a running service shuts it down without waiting. Dropping a
/// `start` future before it resolves leaves the service `Stopped`.
///
/// # Example
///
/// ```rust
/// use griddle::{BatchService, BatchSubmitter, ProcessError, ServiceConfig, Vectorized};
///
/// struct Square;
///
/// impl Vectorized for Square {
///     type Input = u32;
///     type Output = u32;
///
///     fn transform(&mut self, batch: &[u32]) -> Result<Vec<u32>, ProcessError> {
///         Ok(batch.iter().map(|value| value * value).collect())
///     }
/// }
///
/// # #[tokio::main(flavor = "multi_thread")]
/// # async fn main() -> Result<(), griddle::ServiceError> {
/// let service = BatchService::new(ServiceConfig::default(), || Ok(Square))?;
/// service.start().await?;
///
/// assert_eq!(service.submit_one(12).await?, 144);
///
/// service.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct BatchService<P: Vectorized> {
    config: ServiceConfig,
    lifecycle: Mutex<Lifecycle<P>>,
    stats: Arc<BatchStats>,
}

impl<P: Vectorized> BatchService<P> {
    /// Creates a service that is not yet running.
    ///
    /// # Parameters
    ///
    /// * `config` - Batching limits, validated here
    /// * `factory` - Builds one processor per worker lane, on that lane's thread
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] if `config` is invalid.
    pub fn new<F>(config: ServiceConfig, factory: F) -> Result<Self, ServiceError>
    where
        F: Fn() -> Result<P, ProcessError> + Send + Sync + 'static,
    {
        config.validate()?;
        let launch = Launch {
            factory: Arc::new(factory),
            pre_hook: None,
            post_hook: None,
        };
        Ok(Self {
            config,
            lifecycle: Mutex::new(Lifecycle::NotStarted(launch)),
            stats: Arc::new(BatchStats::default()),
        })
    }

    /// Installs a hook run on every batch payload on the controller side,
    /// before it is handed to a worker lane.
    pub fn with_batch_preprocess<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<P::Input>) -> Vec<P::Input> + Send + Sync + 'static,
    {
        match self.lifecycle_mut() {
            Lifecycle::NotStarted(launch) => launch.pre_hook = Some(Arc::new(hook)),
            _ => warn!("batch preprocess hook ignored, service already started"),
        }
        self
    }

    /// Installs a hook run on every batch of outputs on the controller side,
    /// before results are delivered.
    ///
    /// The hook must keep one output per input; a length change is a
    /// protocol violation and stops the service.
    pub fn with_batch_postprocess<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<P::Output>) -> Vec<P::Output> + Send + Sync + 'static,
    {
        match self.lifecycle_mut() {
            Lifecycle::NotStarted(launch) => launch.post_hook = Some(Arc::new(hook)),
            _ => warn!("batch postprocess hook ignored, service already started"),
        }
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The error that stopped the service on its own, if any.
    pub fn failure(&self) -> Option<ServiceError> {
        match &*self.lock() {
            Lifecycle::Running(active) => active.shutdown.cause().filter(ServiceError::is_fatal),
            Lifecycle::Stopped(failure) => failure.clone(),
            _ => None,
        }
    }

    /// Spawns the worker lanes, waits for each to report ready, then starts
    /// the pipeline loops.
    ///
    /// # Errors
    ///
    /// * [`ServiceError::AlreadyStarted`] unless the service is `NotStarted`
    /// * [`ServiceError::WorkerStartup`] if a lane fails to build its
    ///   processor or misses the `startup_timeout`; the service is then
    ///   `Stopped`
    pub async fn start(&self) -> Result<(), ServiceError> {
        let launch = {
            let mut lifecycle = self.lock();
            match mem::replace(&mut *lifecycle, Lifecycle::Starting) {
                Lifecycle::NotStarted(launch) => launch,
                other => {
                    *lifecycle = other;
                    return Err(ServiceError::AlreadyStarted);
                }
            }
        };

        let guard = StartGuard { lifecycle: &self.lifecycle, armed: true };
        match self.launch(launch).await {
            Ok(active) => {
                guard.finish(Lifecycle::Running(active));
                info!(
                    lanes = self.config.worker_lanes,
                    max_batch_size = self.config.max_batch_size,
                    ordering = ?self.config.ordering,
                    "batch service running"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "batch service failed to start");
                guard.finish(Lifecycle::Stopped(Some(err.clone())));
                Err(err)
            }
        }
    }

    async fn launch(&self, launch: Launch<P>) -> Result<Active<P::Input, P::Output>, ServiceError> {
        let config = &self.config;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_queue_size);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(config.max_queue_size);

        let workers = WorkerPool::spawn(config.worker_lanes, launch.factory, inbound_rx, outbound_tx)
            .map_err(|err| ServiceError::WorkerStartup { lane: 0, message: err.to_string() })?;
        await_ready(&mut outbound_rx, workers.len(), config.startup_timeout).await?;

        let shutdown = ShutdownSignal::new();
        let (batch_tx, batch_rx) = mpsc::channel(config.max_queue_size);
        let (pending_tx, pending_rx) = pending_queue(config.ordering);
        let settings = BatcherSettings {
            max_batch_size: config.max_batch_size,
            timeout: config.timeout,
            retry_interval: config.retry_interval,
        };
        let in_flight = Arc::new(Semaphore::new(config.max_queue_size));
        let batcher = Arc::new(Batcher::new(settings, batch_tx, in_flight, self.stats.clone(), shutdown.clone()));

        let preprocessor = Preprocessor::new(batch_rx, pending_tx, inbound_tx, launch.pre_hook, shutdown.clone());
        let postprocessor = Postprocessor::new(
            outbound_rx,
            pending_rx,
            launch.post_hook,
            shutdown.clone(),
            self.stats.clone(),
        );

        let tasks = vec![
            BackgroundTask::spawn("batcher", batcher.clone().close_on()),
            BackgroundTask::spawn("preprocessor", preprocessor.run()),
            BackgroundTask::spawn("postprocessor", postprocessor.run()),
        ];

        Ok(Active { batcher, shutdown, tasks, workers })
    }

    /// Stops the service and settles every outstanding handle.
    ///
    /// Lanes still in the middle of a batch are detached; their results are
    /// discarded. Calling `stop` on a stopped service does nothing.
    pub async fn stop(&self) {
        let active = {
            let mut lifecycle = self.lock();
            match mem::replace(&mut *lifecycle, Lifecycle::Stopped(None)) {
                Lifecycle::Running(active) => {
                    active.shutdown.trigger(ServiceError::Stopped);
                    let failure = active.shutdown.cause().filter(ServiceError::is_fatal);
                    *lifecycle = Lifecycle::Stopped(failure);
                    active
                }
                Lifecycle::Starting => {
                    *lifecycle = Lifecycle::Starting;
                    warn!("stop called while starting, ignoring");
                    return;
                }
                Lifecycle::Stopped(failure) => {
                    *lifecycle = Lifecycle::Stopped(failure);
                    return;
                }
                Lifecycle::NotStarted(_) => return,
            }
        };

        let finished = active.tasks.iter().filter(|task| task.is_finished()).count();
        debug!(finished, total = active.tasks.len(), "joining background tasks");
        for task in active.tasks {
            task.join(SHUTDOWN_GRACE).await;
        }
        active.workers.release();
        info!("batch service stopped");
    }

    /// Submits one item and returns the handle its result will arrive on.
    ///
    /// Suspends only while the batcher's buffer is full.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotRunning`] if the service is not `Running`.
    pub async fn submit(&self, item: P::Input) -> Result<ResultHandle<P::Output>, ServiceError> {
        let batcher = {
            let lifecycle = self.lock();
            match &*lifecycle {
                Lifecycle::Running(active) if !active.shutdown.is_triggered() => active.batcher.clone(),
                other => return Err(ServiceError::NotRunning(other.state())),
            }
        };
        batcher.submit(item).await
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<P>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<P> {
        self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Vectorized> Drop for BatchService<P> {
    fn drop(&mut self) {
        if let Lifecycle::Running(active) = self.lifecycle_mut() {
            if active.shutdown.trigger(ServiceError::Stopped) {
                debug!("batch service dropped while running, shutting down");
            }
        }
    }
}

/// Moves a service abandoned mid-`start` from `Starting` to `Stopped`, so a
/// dropped `start` future cannot leave it half started.
struct StartGuard<'a, P: Vectorized> {
    lifecycle: &'a Mutex<Lifecycle<P>>,
    armed: bool,
}

impl<P: Vectorized> StartGuard<'_, P> {
    fn finish(mut self, outcome: Lifecycle<P>) {
        self.armed = false;
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

impl<P: Vectorized> Drop for StartGuard<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*lifecycle, Lifecycle::Starting) {
            warn!("start cancelled before every worker lane was ready");
            *lifecycle = Lifecycle::Stopped(Some(ServiceError::WorkerStartup {
                lane: 0,
                message: "start was cancelled during the ready handshake".to_string(),
            }));
        }
    }
}

/// Waits for `lanes` ready sentinels.
async fn await_ready<O>(
    outbound: &mut mpsc::Receiver<WorkerMessage<O>>,
    lanes: usize,
    limit: Duration,
) -> Result<(), ServiceError> {
    let mut ready = 0;
    let handshake = async {
        while ready < lanes {
            match outbound.recv().await {
                Some(WorkerMessage::Ready { lane }) => {
                    ready += 1;
                    debug!(lane, "worker lane ready");
                }
                Some(WorkerMessage::StartupFailed { lane, message }) => {
                    return Err(ServiceError::WorkerStartup { lane, message });
                }
                Some(other) => warn!(lane = other.lane(), "unexpected worker message during startup"),
                None => {
                    return Err(ServiceError::WorkerStartup {
                        lane: ready,
                        message: "worker lane exited before reporting ready".to_string(),
                    });
                }
            }
        }
        Ok(())
    };

    let outcome = tokio::time::timeout(limit, handshake).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(ServiceError::WorkerStartup {
            lane: ready,
            message: format!("no ready sentinel within {limit:?}"),
        }),
    }
}

/// Caller-facing entry point of a batching service.
#[async_trait]
pub trait BatchSubmitter<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Submits one item and waits for its result.
    async fn submit_one(&self, item: I) -> Result<O, ServiceError>;

    /// Submits every item concurrently and returns the results in input
    /// order. Each item fails or succeeds on its own.
    async fn submit_all(&self, items: Vec<I>) -> Vec<Result<O, ServiceError>> {
        join_all(items.into_iter().map(|item| self.submit_one(item))).await
    }
}

#[async_trait]
impl<P: Vectorized> BatchSubmitter<P::Input, P::Output> for BatchService<P> {
    async fn submit_one(&self, item: P::Input) -> Result<P::Output, ServiceError> {
        self.submit(item).await?.await
    }
}
