//! The [`Future`] state machine and its chaining combinators.
//!
//! A [`Future`] is a handle to a shared, single-threaded state record. The
//! producer holds a [`Resolver`] bound to that record and settles it at most
//! once; any number of consumers hold clones of the [`Future`] and attach
//! continuations. Continuations never run inline: they are handed to the
//! [`Handle`] the future was created with, both when a pending future settles
//! and when a continuation is attached to an already settled one.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::task::Waker;

use crate::resolution::{self, Resolution};
use crate::{CycleError, Error, Handle, Schedule, Task};

const LOG: &str = "future_chain::future";

/// The observable state of a [`Future`].
///
/// `Pending` is the only initial state. `Fulfilled` and `Rejected` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

type Callback<V> = Box<dyn FnOnce(V)>;

struct Reactions<T, E> {
    on_fulfilled: Vec<Callback<T>>,
    on_rejected: Vec<Callback<E>>,
}

enum Stage<T, E> {
    Pending(Reactions<T, E>),
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Stage<T, E> {
    fn state(&self) -> State {
        match self {
            Stage::Pending(_) => State::Pending,
            Stage::Fulfilled(_) => State::Fulfilled,
            Stage::Rejected(_) => State::Rejected,
        }
    }
}

struct Inner<T, E> {
    stage: Stage<T, E>,
    /// A resolver has accepted a value. The stage may still be pending while
    /// a thenable settles.
    locked: bool,
    /// Something has subscribed to or awaited this future.
    handled: bool,
    wakers: Vec<Waker>,
}

impl<T, E> Inner<T, E> {
    /// Rejected, and nothing ever subscribed to or awaited the rejection.
    fn is_unhandled_rejection(&self) -> bool {
        matches!(self.stage, Stage::Rejected(_)) && !self.handled
    }
}

struct Shared<T, E> {
    handle: Handle,
    inner: RefCell<Inner<T, E>>,
    /// Monomorphized [`release`], so dropping needs no bounds on `T`/`E`.
    release: fn(Reactions<T, E>),
}

impl<T, E> Drop for Shared<T, E> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.is_unhandled_rejection() {
            log::warn!(target: LOG, "future rejected without a rejection handler");
        }
        if let Stage::Pending(reactions) = &mut inner.stage {
            if !reactions.on_fulfilled.is_empty() || !reactions.on_rejected.is_empty() {
                let reactions = Reactions {
                    on_fulfilled: std::mem::take(&mut reactions.on_fulfilled),
                    on_rejected: std::mem::take(&mut reactions.on_rejected),
                };
                (self.release)(reactions);
            }
        }
    }
}

thread_local! {
    static RELEASED: RefCell<Vec<Box<dyn Any>>> = const { RefCell::new(Vec::new()) };
    static RELEASING: Cell<bool> = const { Cell::new(false) };
}

/// Drop the callbacks of a future that never settled.
///
/// Callbacks own the resolvers of derived futures, which own their own
/// callbacks, so dropping a long unsettled chain would recurse once per link.
/// Nested drops park their callbacks here and the outermost drop frees them
/// in a loop.
fn release<T: 'static, E: 'static>(reactions: Reactions<T, E>) {
    let parked = RELEASED.try_with(|released| released.borrow_mut().push(Box::new(reactions)));
    if parked.is_err() {
        // Thread-local storage is gone; `reactions` was dropped in place.
        return;
    }
    if RELEASING.with(|releasing| releasing.replace(true)) {
        return;
    }
    loop {
        let next = RELEASED.with(|released| released.borrow_mut().pop());
        match next {
            Some(reactions) => drop(reactions),
            None => break,
        }
    }
    RELEASING.with(|releasing| releasing.set(false));
}

/// A deferred result that settles exactly once.
///
/// ```rust
/// use future_chain::{Error, Future, MicrotaskQueue};
///
/// let queue = MicrotaskQueue::new();
/// let future = Future::<i32>::new(&queue.handle(), |resolver| {
///     resolver.resolve(5);
///     Ok(())
/// });
/// let sum = future.then(|v| Ok(v + 5));
/// let message = Future::<i32>::rejected(&queue.handle(), Error::from("boom"))
///     .then(|v| Ok(v))
///     .catch(|e| Ok(e.to_string().len() as i32));
///
/// // Nothing runs until the host drains its queue.
/// assert!(sum.is_pending());
/// queue.run_until_idle();
/// assert_eq!(sum.value(), Some(10));
/// assert_eq!(message.value(), Some(4));
/// ```
pub struct Future<T, E = Error> {
    shared: Rc<Shared<T, E>>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T, E> fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Future<T, E> {
    /// Returns the current [`State`].
    pub fn state(&self) -> State {
        self.shared.inner.borrow().stage.state()
    }

    /// Returns true if the future has not settled yet.
    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// Returns the [`Handle`] continuations of this future are scheduled on.
    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// Identity of the shared state, used by the self-resolution guard.
    pub(crate) fn id(&self) -> *const () {
        Rc::as_ptr(&self.shared) as *const ()
    }
}

impl<T, E> Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    /// Construct a pending [`Future`] and run `executor` synchronously with
    /// the [`Resolver`] bound to it.
    ///
    /// An `Err` returned by the executor rejects the future, unless the
    /// executor already resolved or rejected it.
    pub fn new<X>(handle: &Handle, executor: X) -> Self
    where
        X: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (resolver, future) = Self::pending(handle);
        if let Err(err) = executor(resolver.clone()) {
            log::trace!(target: LOG, "executor.err");
            resolver.reject(err);
        }
        future
    }

    /// Construct a pending [`Future`] along with the [`Resolver`] that
    /// settles it.
    pub fn pending(handle: &Handle) -> (Resolver<T, E>, Self) {
        let future = Self {
            shared: Rc::new(Shared {
                handle: handle.clone(),
                inner: RefCell::new(Inner {
                    stage: Stage::Pending(Reactions {
                        on_fulfilled: Vec::new(),
                        on_rejected: Vec::new(),
                    }),
                    locked: false,
                    handled: false,
                    wakers: Vec::new(),
                }),
                release: release::<T, E>,
            }),
        };
        let resolver = Resolver {
            future: future.clone(),
        };
        (resolver, future)
    }

    /// Construct a [`Future`] already fulfilled with `value`.
    pub fn resolved(handle: &Handle, value: T) -> Self {
        let (resolver, future) = Self::pending(handle);
        resolver.resolve(value);
        future
    }

    /// Construct a [`Future`] already rejected with `err`.
    pub fn rejected(handle: &Handle, err: E) -> Self {
        let (resolver, future) = Self::pending(handle);
        resolver.reject(err);
        future
    }

    /// Returns the value if the future is fulfilled.
    pub fn value(&self) -> Option<T> {
        match &self.shared.inner.borrow().stage {
            Stage::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the error if the future is rejected.
    pub fn error(&self) -> Option<E> {
        match &self.shared.inner.borrow().stage {
            Stage::Rejected(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Register a pair of callbacks, exactly one of which will eventually be
    /// invoked with the settled value or error.
    ///
    /// If the future is pending the callbacks are queued in registration
    /// order. If it already settled, the matching callback is scheduled on the
    /// [`Handle`] right away. Either way it never runs before this call
    /// returns.
    pub fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        let task = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.handled = true;
            match &mut inner.stage {
                Stage::Pending(reactions) => {
                    reactions.on_fulfilled.push(Box::new(on_fulfilled));
                    reactions.on_rejected.push(Box::new(on_rejected));
                    return;
                }
                Stage::Fulfilled(value) => {
                    let value = value.clone();
                    Task::new(move || on_fulfilled(value))
                }
                Stage::Rejected(err) => {
                    let err = err.clone();
                    Task::new(move || on_rejected(err))
                }
            }
        };
        self.shared.handle.schedule(task);
    }

    /// Chain a continuation on fulfillment.
    ///
    /// Rejections skip `on_fulfilled` and propagate to the returned future
    /// untouched. An `Err` from `on_fulfilled` rejects the returned future.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
    {
        self.chain(move |value| on_fulfilled(value).map(Resolution::Value), Err)
    }

    /// Chain a continuation on fulfillment that may return another pending
    /// computation. The returned future settles the way that computation
    /// does.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(on_fulfilled, Err)
    }

    /// Chain a continuation for each outcome.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.chain(on_fulfilled, on_rejected)
    }

    /// Recover from a rejection.
    ///
    /// Values pass through to the returned future untouched. An `Ok` from
    /// `on_rejected` fulfills the returned future, an `Err` rejects it.
    pub fn catch<R>(&self, on_rejected: R) -> Future<T, E>
    where
        R: FnOnce(E) -> Result<T, E> + 'static,
    {
        self.chain(
            |value| Ok(Resolution::Value(value)),
            move |err| on_rejected(err).map(Resolution::Value),
        )
    }

    /// Recover from a rejection with a handler that may return another
    /// pending computation.
    pub fn or_else<R>(&self, on_rejected: R) -> Future<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.chain(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    fn chain<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        let (resolver, child) = Future::pending(&self.shared.handle);
        let rejection_resolver = resolver.clone();
        self.subscribe(
            move |value| resolver.settle_with(on_fulfilled(value)),
            move |err| rejection_resolver.settle_with(on_rejected(err)),
        );
        child
    }

    /// Claim the right to settle. Returns false if a resolver already
    /// accepted a value or the future is no longer pending.
    fn lock(&self) -> bool {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.locked || !matches!(inner.stage, Stage::Pending(_)) {
            log::debug!(
                target: LOG,
                "settle.ignored state={:?}",
                inner.stage.state()
            );
            return false;
        }
        inner.locked = true;
        true
    }

    /// Transition to `Fulfilled` and schedule the fulfillment callbacks.
    pub(crate) fn fulfill(&self, value: T) {
        let (callbacks, wakers) = {
            let mut inner = self.shared.inner.borrow_mut();
            if !matches!(inner.stage, Stage::Pending(_)) {
                log::debug!(target: LOG, "fulfill.ignored state={:?}", inner.stage.state());
                return;
            }
            let callbacks =
                match std::mem::replace(&mut inner.stage, Stage::Fulfilled(value.clone())) {
                    Stage::Pending(reactions) => reactions.on_fulfilled,
                    _ => Vec::new(),
                };
            (callbacks, std::mem::take(&mut inner.wakers))
        };
        log::trace!(target: LOG, "fulfill callbacks={}", callbacks.len());
        for callback in callbacks {
            let value = value.clone();
            self.shared.handle.schedule(Task::new(move || callback(value)));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Transition to `Rejected` and schedule the rejection callbacks.
    pub(crate) fn settle_rejected(&self, err: E) {
        let (callbacks, wakers) = {
            let mut inner = self.shared.inner.borrow_mut();
            if !matches!(inner.stage, Stage::Pending(_)) {
                log::debug!(target: LOG, "reject.ignored state={:?}", inner.stage.state());
                return;
            }
            let callbacks = match std::mem::replace(&mut inner.stage, Stage::Rejected(err.clone())) {
                Stage::Pending(reactions) => reactions.on_rejected,
                _ => Vec::new(),
            };
            (callbacks, std::mem::take(&mut inner.wakers))
        };
        log::trace!(target: LOG, "reject callbacks={}", callbacks.len());
        for callback in callbacks {
            let err = err.clone();
            self.shared.handle.schedule(Task::new(move || callback(err)));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns the outcome if settled, otherwise parks `waker` until the
    /// future settles.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Result<T, E>> {
        let inner = &mut *self.shared.inner.borrow_mut();
        inner.handled = true;
        match &inner.stage {
            Stage::Fulfilled(value) => Some(Ok(value.clone())),
            Stage::Rejected(err) => Some(Err(err.clone())),
            Stage::Pending(_) => {
                if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
                    inner.wakers.push(waker.clone());
                }
                None
            }
        }
    }
}

/// The producer side of a [`Future`].
///
/// All clones of a [`Resolver`] share one latch: only the first call to
/// [`resolve`](Resolver::resolve), [`resolve_with`](Resolver::resolve_with)
/// or [`reject`](Resolver::reject) has any effect.
pub struct Resolver<T, E = Error> {
    future: Future<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("state", &self.future.state())
            .finish()
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + From<CycleError> + 'static,
{
    /// Fulfill the future with a plain value.
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value));
    }

    /// Resolve the future with a value or another pending computation.
    ///
    /// When given a thenable, the future stays pending and adopts whatever
    /// the thenable settles to. Resolving a future with itself rejects it
    /// with [`CycleError`].
    pub fn resolve_with(&self, resolution: Resolution<T, E>) {
        if self.future.lock() {
            resolution::resolve(&self.future, resolution);
        }
    }

    /// Reject the future.
    pub fn reject(&self, err: E) {
        if self.future.lock() {
            self.future.settle_rejected(err);
        }
    }

    /// Returns the [`Future`] this resolver settles.
    pub fn future(&self) -> Future<T, E> {
        self.future.clone()
    }

    fn settle_with(&self, outcome: Result<Resolution<T, E>, E>) {
        match outcome {
            Ok(resolution) => self.resolve_with(resolution),
            Err(err) => self.reject(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::MicrotaskQueue;

    type Log = Rc<RefCell<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.borrow_mut().push(entry.into());
    }

    #[test]
    fn settles_once() {
        let queue = MicrotaskQueue::new();
        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject(Error::from("late"));
        assert_eq!(future.state(), State::Fulfilled);
        assert_eq!(future.value(), Some(1));
        assert!(future.error().is_none());

        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        resolver.clone().reject(Error::from("first"));
        resolver.resolve(3);
        assert_eq!(future.state(), State::Rejected);
        assert_eq!(future.error().map(|e| e.to_string()), Some("first".into()));
    }

    #[test]
    fn executor_error_rejects() {
        let queue = MicrotaskQueue::new();
        let future = Future::<i32>::new(&queue.handle(), |_| Err(Error::from("setup")));
        assert_eq!(future.state(), State::Rejected);

        // An error after resolving is ignored.
        let future = Future::<i32>::new(&queue.handle(), |resolver| {
            resolver.resolve(7);
            Err(Error::from("too late"))
        });
        assert_eq!(future.value(), Some(7));
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let queue = MicrotaskQueue::new();
        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        let log: Log = Rc::default();
        for i in 0..5 {
            let log = Rc::clone(&log);
            future.subscribe(move |v| push(&log, format!("c{i}:{v}")), |_| {});
        }
        resolver.resolve(9);
        // Settling only queues the callbacks.
        assert!(log.borrow().is_empty());
        assert_eq!(queue.len(), 5);
        queue.run_until_idle();
        assert_eq!(
            *log.borrow(),
            vec!["c0:9", "c1:9", "c2:9", "c3:9", "c4:9"]
        );
    }

    #[test]
    fn late_subscription_is_deferred() {
        let queue = MicrotaskQueue::new();
        let future = Future::<i32>::resolved(&queue.handle(), 4);
        let log: Log = Rc::default();
        {
            let log = Rc::clone(&log);
            future.subscribe(move |v| push(&log, format!("late:{v}")), |_| {});
        }
        assert!(log.borrow().is_empty());
        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec!["late:4"]);
    }

    #[test]
    fn only_matching_callback_fires() {
        let queue = MicrotaskQueue::new();
        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        let log: Log = Rc::default();
        {
            let (ok, err) = (Rc::clone(&log), Rc::clone(&log));
            future.subscribe(
                move |_| push(&ok, "fulfilled"),
                move |e: Error| push(&err, format!("rejected:{e}")),
            );
        }
        resolver.reject(Error::from("nope"));
        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec!["rejected:nope"]);
    }

    #[test]
    fn then_without_rejection_handler_propagates() {
        let queue = MicrotaskQueue::new();
        let child = Future::<i32>::rejected(&queue.handle(), Error::from("E"))
            .then(|v| Ok(v + 1))
            .then(|v| Ok(v * 2));
        queue.run_until_idle();
        assert_eq!(child.error().map(|e| e.to_string()), Some("E".into()));
    }

    #[test]
    fn catch_passes_values_through() {
        let queue = MicrotaskQueue::new();
        let child = Future::<i32>::resolved(&queue.handle(), 3).catch(|_| Ok(0));
        queue.run_until_idle();
        assert_eq!(child.value(), Some(3));
    }

    #[test]
    fn continuation_error_rejects_child() {
        let queue = MicrotaskQueue::new();
        let child: Future<i32> =
            Future::<i32>::resolved(&queue.handle(), 1).then(|_| Err(Error::from("x")));
        queue.run_until_idle();
        assert_eq!(child.error().map(|e| e.to_string()), Some("x".into()));
    }

    #[test]
    fn then_or_else_routes_each_outcome() {
        let queue = MicrotaskQueue::new();
        let handle = queue.handle();
        let ok = Future::<i32>::resolved(&handle, 2).then_or_else(
            |v| Ok(Resolution::Value(format!("ok:{v}"))),
            |e| Ok(Resolution::Value(format!("err:{e}"))),
        );
        let err = Future::<i32>::rejected(&handle, Error::from("bad")).then_or_else(
            |v| Ok(Resolution::Value(format!("ok:{v}"))),
            |e| Ok(Resolution::Value(format!("err:{e}"))),
        );
        queue.run_until_idle();
        assert_eq!(ok.value(), Some("ok:2".to_owned()));
        assert_eq!(err.value(), Some("err:bad".to_owned()));
    }

    #[test]
    fn settling_does_not_run_user_code_inline() {
        let queue = MicrotaskQueue::new();
        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        let log: Log = Rc::default();
        {
            let log = Rc::clone(&log);
            future.then(move |v| {
                push(&log, "continuation");
                Ok(v)
            });
        }
        resolver.resolve(1);
        push(&log, "resolve returned");
        queue.run_until_idle();
        assert_eq!(*log.borrow(), vec!["resolve returned", "continuation"]);
    }

    #[test]
    fn dropping_a_long_unsettled_chain() {
        let queue = MicrotaskQueue::new();
        let (resolver, root) = Future::<i32>::pending(&queue.handle());
        let mut tail = root.clone();
        for _ in 0..200_000 {
            tail = tail.then(|v| Ok(v + 1));
        }
        drop(tail);
        drop(root);
        drop(resolver);
        assert!(queue.is_empty());

        // The parking list is drained, so later chains still resolve.
        let (resolver, root) = Future::<i32>::pending(&queue.handle());
        let tail = root.then(|v| Ok(v + 1)).then(|v| Ok(v * 2));
        resolver.resolve(1);
        queue.run_until_idle();
        assert_eq!(tail.value(), Some(4));
    }

    #[test]
    fn unhandled_rejection_is_reported_only_without_handlers() {
        let queue = MicrotaskQueue::new();
        let handle = queue.handle();
        let unhandled = |future: &Future<i32>| future.shared.inner.borrow().is_unhandled_rejection();

        let ignored = Future::<i32>::rejected(&handle, Error::from("lost"));
        assert!(unhandled(&ignored));

        let subscribed = Future::<i32>::rejected(&handle, Error::from("seen"));
        subscribed.subscribe(|_| {}, |_| {});
        assert!(!unhandled(&subscribed));

        let awaited = Future::<i32>::rejected(&handle, Error::from("awaited"));
        assert!(futures::executor::block_on(awaited.wait()).is_err());
        assert!(!unhandled(&awaited));

        let (resolver, pending) = Future::<i32>::pending(&handle);
        let chained = pending.catch(|_| Ok(0));
        resolver.reject(Error::from("recovered"));
        assert!(!unhandled(&pending));
        queue.run_until_idle();
        assert!(!unhandled(&chained));

        let fulfilled = Future::<i32>::resolved(&handle, 1);
        assert!(!unhandled(&fulfilled));
    }

    #[test]
    fn resolver_and_handle_accessors() {
        let queue = MicrotaskQueue::new();
        let (resolver, future) = Future::<i32>::pending(&queue.handle());
        let sibling = Future::<i32>::resolved(future.handle(), 2).then(|v| Ok(v + 1));
        let doubled = resolver.future().then(|v| Ok(v * 2));

        resolver.resolve(4);
        assert!(sibling.is_pending());
        assert_eq!(queue.run_until_idle(), 2);
        assert_eq!(sibling.value(), Some(3));
        assert_eq!(doubled.value(), Some(8));
    }
}
