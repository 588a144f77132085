//! The resolution procedure: settling a [`Future`] with a value that may
//! itself be a pending computation.
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::{CycleError, Future};

const LOG: &str = "future_chain::resolution";

/// Anything that can register continuations for its eventual outcome.
///
/// Resolving a [`Future`] with a [`Thenable`] makes the future adopt the
/// thenable's outcome instead of being fulfilled with the thenable itself.
/// Implementations need not be [`Future`]s.
pub trait Thenable<T, E> {
    /// Register the continuations. At most one of them takes effect, the first
    /// time either is called; later calls are ignored.
    ///
    /// `on_fulfilled` may be handed another pending computation, which is
    /// unwrapped in turn. Returning `Err` before either callback was called
    /// rejects the adopting future with that error.
    fn register(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(Resolution<T, E>)>,
        on_rejected: Box<dyn FnOnce(E)>,
    ) -> Result<(), E>;

    /// An identity shared with the [`Future`] this thenable would settle, if
    /// any. Used to reject self-resolution.
    fn identity(&self) -> Option<*const ()> {
        None
    }
}

/// A value to settle a [`Future`] with: either a plain value or a pending
/// computation to adopt.
pub enum Resolution<T, E> {
    /// Fulfill with this value.
    Value(T),
    /// Adopt the outcome of this computation.
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    /// Wrap any [`Thenable`].
    pub fn thenable<N>(thenable: N) -> Self
    where
        N: Thenable<T, E> + 'static,
    {
        Resolution::Thenable(Box::new(thenable))
    }
}

impl<T, E> fmt::Debug for Resolution<T, E>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Thenable(_) => f.debug_tuple("Thenable").finish(),
        }
    }
}

impl<T, E> From<Future<T, E>> for Resolution<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    fn from(future: Future<T, E>) -> Self {
        Resolution::Thenable(Box::new(future))
    }
}

impl<T, E> Thenable<T, E> for Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    fn register(
        self: Box<Self>,
        on_fulfilled: Box<dyn FnOnce(Resolution<T, E>)>,
        on_rejected: Box<dyn FnOnce(E)>,
    ) -> Result<(), E> {
        self.subscribe(move |value| on_fulfilled(Resolution::Value(value)), on_rejected);
        Ok(())
    }

    fn identity(&self) -> Option<*const ()> {
        Some(self.id())
    }
}

/// First-call-wins latch shared by the two callbacks handed to a thenable.
///
/// While `register` is still on the stack, an outcome is parked in `stash`
/// and unwrapped by the caller's loop instead of recursing.
struct Latch<T, E> {
    called: bool,
    registering: bool,
    stash: Option<Result<Resolution<T, E>, E>>,
}

fn deliver<T, E>(
    latch: &RefCell<Latch<T, E>>,
    future: &Future<T, E>,
    outcome: Result<Resolution<T, E>, E>,
) where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    {
        let mut latch = latch.borrow_mut();
        if latch.called {
            log::debug!(target: LOG, "thenable.callback.ignored");
            return;
        }
        latch.called = true;
        if latch.registering {
            latch.stash = Some(outcome);
            return;
        }
    }
    match outcome {
        Ok(resolution) => resolve(future, resolution),
        Err(err) => future.settle_rejected(err),
    }
}

/// Settle `future` with `resolution`, adopting the outcome of any thenable.
///
/// Thenables that call back while being registered are unwrapped
/// iteratively; thenables that call back later re-enter here.
pub(crate) fn resolve<T, E>(future: &Future<T, E>, resolution: Resolution<T, E>)
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    let mut next = resolution;
    loop {
        let thenable = match next {
            Resolution::Value(value) => return future.fulfill(value),
            Resolution::Thenable(thenable) => thenable,
        };
        if thenable.identity() == Some(future.id()) {
            log::debug!(target: LOG, "resolve.cycle");
            return future.settle_rejected(E::from(CycleError));
        }

        let latch = Rc::new(RefCell::new(Latch {
            called: false,
            registering: true,
            stash: None,
        }));
        let on_fulfilled = {
            let (latch, future) = (Rc::clone(&latch), future.clone());
            Box::new(move |resolution| deliver(&latch, &future, Ok(resolution)))
        };
        let on_rejected = {
            let (latch, future) = (Rc::clone(&latch), future.clone());
            Box::new(move |err| deliver(&latch, &future, Err(err)))
        };
        let registered = thenable.register(on_fulfilled, on_rejected);

        let stashed = {
            let mut latch = latch.borrow_mut();
            latch.registering = false;
            match (latch.stash.take(), registered) {
                (Some(outcome), _) => outcome,
                (None, Err(err)) if !latch.called => {
                    latch.called = true;
                    Err(err)
                }
                (None, _) => return,
            }
        };
        match stashed {
            Ok(resolution) => {
                log::trace!(target: LOG, "resolve.unwrap");
                next = resolution;
            }
            Err(err) => return future.settle_rejected(err),
        }
    }
}
