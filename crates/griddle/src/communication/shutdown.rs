use std::sync::Arc;
use tokio::sync::watch;
use crate::error::ServiceError;

/// # ShutdownSignal
///
/// A broadcast, first-writer-wins stop signal shared by every background
/// task of a running service.
///
/// The recorded cause is what outstanding result handles are settled with:
/// [`ServiceError::Stopped`] for an orderly `stop`, or the fatal error that
/// brought the service down.
#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    cause: Arc<watch::Sender<Option<ServiceError>>>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        let (cause, _) = watch::channel(None);
        Self { cause: Arc::new(cause) }
    }

    /// Records `cause` and wakes every waiter. Returns `false` if the signal
    /// had already been triggered, in which case the first cause is kept.
    pub(crate) fn trigger(&self, cause: ServiceError) -> bool {
        self.cause.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    pub(crate) fn cause(&self) -> Option<ServiceError> {
        self.cause.borrow().clone()
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.cause.borrow().is_some()
    }

    /// Suspends until the signal fires and returns its cause.
    pub(crate) async fn triggered(&self) -> ServiceError {
        let mut rx = self.cause.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(cause) => (*cause).clone().unwrap_or(ServiceError::Stopped),
            Err(_) => ServiceError::Stopped,
        }
    }
}
