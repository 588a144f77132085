use std::fmt;
use std::rc::Rc;

/// [`Schedule`] provides a way to run a [`Task`] later.
///
/// Implementors are the host's run-to-completion scheduler. They must run
/// tasks in the order they were scheduled, each one to completion before the
/// next begins, and never run a task from inside [`Schedule::schedule`].
pub trait Schedule {
    /// Queue a [`Task`] to run once the current synchronous work finishes.
    fn schedule(&self, task: Task);
}

impl<S> Schedule for Rc<S>
where
    S: Schedule + ?Sized,
{
    fn schedule(&self, task: Task) {
        self.as_ref().schedule(task);
    }
}

/// A zero-argument unit of deferred work.
pub struct Task(Box<dyn FnOnce()>);

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").finish()
    }
}

impl Task {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Task(Box::new(f))
    }

    /// Run the task to completion.
    pub fn run(self) {
        (self.0)()
    }
}

/// A handle to a host scheduler.
///
/// Every [`Future`](crate::Future) carries one and routes all callback
/// invocations through it. Futures derived by chaining inherit the handle of
/// the future they were derived from.
#[derive(Clone)]
pub struct Handle {
    scheduler: Rc<dyn Schedule>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl Handle {
    /// Construct a [`Handle`] from any [`Schedule`] implementation.
    pub fn new<S>(scheduler: S) -> Self
    where
        S: Schedule + 'static,
    {
        Handle {
            scheduler: Rc::new(scheduler),
        }
    }

    /// Queue a closure on the underlying scheduler.
    pub fn defer<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.schedule(Task::new(f));
    }
}

impl Schedule for Handle {
    fn schedule(&self, task: Task) {
        self.scheduler.schedule(task);
    }
}
