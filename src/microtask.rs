//! A FIFO queue of deferred [`Task`]s.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::{Handle, Schedule, Task};

const LOG: &str = "future_chain::microtask";

/// [`MicrotaskQueue`] is the smallest host that satisfies [`Schedule`].
///
/// Tasks are queued by futures as they settle and run in the order they were
/// queued when the queue is drained.
///
/// ```rust
/// use future_chain::{Future, MicrotaskQueue};
///
/// let queue = MicrotaskQueue::new();
/// let doubled = Future::<i32>::resolved(&queue.handle(), 21).then(|v| Ok(v * 2));
/// queue.run_until_idle();
/// assert_eq!(doubled.value(), Some(42));
/// ```
#[derive(Clone)]
pub struct MicrotaskQueue {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl Default for MicrotaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl MicrotaskQueue {
    /// Construct an empty [`MicrotaskQueue`].
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Construct an empty [`MicrotaskQueue`] with room for `capacity` tasks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Rc::new(RefCell::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Returns a [`Handle`] which schedules onto this queue.
    pub fn handle(&self) -> Handle {
        Handle::new(self.clone())
    }

    /// Pop the next [`Task`] to run.
    pub fn next(&self) -> Option<Task> {
        self.queue.borrow_mut().pop_front()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Returns true if no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Run tasks until the queue is empty, including any tasks queued while
    /// draining. Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.next() {
            task.run();
            ran += 1;
        }
        if ran > 0 {
            log::trace!(target: LOG, "drain.idle ran={ran}");
        }
        ran
    }

    /// Drop every queued task without running it.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.queue.borrow_mut());
        drop(dropped);
    }
}

impl Schedule for MicrotaskQueue {
    fn schedule(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }
}
