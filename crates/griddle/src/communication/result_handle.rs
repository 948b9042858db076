use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use crate::error::ServiceError;

/// Outcome delivered to a single caller.
pub type Outcome<T> = Result<T, ServiceError>;

/// Creates a linked slot/handle pair for one submitted item.
pub(crate) fn result_channel<T>() -> (ResultSlot<T>, ResultHandle<T>) {
    let (sender, receiver) = oneshot::channel();
    (ResultSlot { sender }, ResultHandle { receiver, settled: None })
}

/// # ResultSlot
///
/// The write side of a [`ResultHandle`]. Resolving consumes the slot, so a
/// handle can be assigned at most once. Dropping an unresolved slot settles
/// the handle with [`ServiceError::Stopped`].
pub(crate) struct ResultSlot<T> {
    sender: oneshot::Sender<Outcome<T>>,
}

impl<T> ResultSlot<T> {
    /// Delivers `outcome`, returning `false` if the caller already dropped its handle.
    pub(crate) fn resolve(self, outcome: Outcome<T>) -> bool {
        self.sender.send(outcome).is_ok()
    }
}

/// # ResultHandle
///
/// An awaitable, single-assignment container for one item's eventual result.
///
/// The handle can be consumed with `.await`, or observed in place with
/// [`wait`](Self::wait) as many times as needed. Once settled, the result is
/// also readable without suspending through [`try_result`](Self::try_result).
///
/// If the service stops before the item was processed, the handle settles
/// with [`ServiceError::Stopped`] (or with the error that brought the
/// service down) instead of pending forever.
pub struct ResultHandle<T> {
    /// The underlying channel receiver
    receiver: oneshot::Receiver<Outcome<T>>,

    /// Cached outcome once the receiver has completed
    settled: Option<Outcome<T>>,
}

// Neither field is structurally pinned.
impl<T> Unpin for ResultHandle<T> {}

impl<T> ResultHandle<T> {
    /// Suspends until the result is available and returns a reference to it.
    ///
    /// Calling this again after settlement returns immediately.
    pub async fn wait(&mut self) -> &Outcome<T> {
        let outcome = match self.settled.take() {
            Some(outcome) => outcome,
            None => (&mut self.receiver).await.unwrap_or(Err(ServiceError::Stopped)),
        };
        self.settled.insert(outcome)
    }

    /// Returns the result if it has been assigned, without suspending.
    pub fn try_result(&mut self) -> Option<&Outcome<T>> {
        if self.settled.is_none() {
            let outcome = match self.receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => Err(ServiceError::Stopped),
            };
            self.settled = Some(outcome);
        }
        self.settled.as_ref()
    }

    pub fn is_settled(&mut self) -> bool {
        self.try_result().is_some()
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.settled.take() {
            return Poll::Ready(outcome);
        }
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ServiceError::Stopped)))
    }
}
