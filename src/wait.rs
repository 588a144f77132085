//! Awaiting a [`Future`] from `async` Rust.
use std::future::IntoFuture;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{CycleError, Future};

/// Resolves to the outcome of a [`Future`] once it settles.
///
/// Returned by [`Future::wait`]. Polling reads the settled value directly, so
/// a [`Wait`] makes progress without the future's scheduler being drained.
///
/// # Examples
///
/// ```
/// use future_chain::{Future, MicrotaskQueue};
/// use futures::executor::block_on;
///
/// let queue = MicrotaskQueue::new();
/// let future = Future::<String>::resolved(&queue.handle(), "Hi".into());
/// assert_eq!(block_on(future.wait()).unwrap(), "Hi");
/// ```
#[derive(Debug)]
pub struct Wait<T, E> {
    future: Future<T, E>,
}

impl<T, E> Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    /// Returns a [`std::future::Future`] that completes with this future's
    /// outcome.
    pub fn wait(&self) -> Wait<T, E> {
        Wait {
            future: self.clone(),
        }
    }
}

impl<T, E> std::future::Future for Wait<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.future.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T, E> IntoFuture for Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Wait<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Wait { future: self }
    }
}
