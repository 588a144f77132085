//! A reference run-to-completion host.
//!
//! [`EventLoop`] drives external collaborators the way a single-threaded host
//! would: it runs one macrotask (a queued task or an expired timer) at a time
//! and drains every microtask after each one. Time is virtual; the clock only
//! moves when the loop fires a timer.
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::{Handle, MicrotaskQueue, Task};

const LOG: &str = "future_chain::event_loop";

/// Error returned while driving an [`EventLoop`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// One drain of the microtask queue ran more tasks than allowed, which
    /// usually means a chain keeps scheduling itself.
    #[error("microtask drain exceeded the limit of {limit} tasks")]
    MicrotaskLimit {
        /// The configured limit.
        limit: usize,
    },
}

/// Configuration for an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of microtasks run by a single drain.
    pub microtask_limit: usize,
    /// Initial capacity of the task queues.
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            microtask_limit: usize::MAX,
            queue_capacity: 64,
        }
    }
}

/// Builds an [`EventLoop`].
#[derive(Debug, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    /// Construct a [`Builder`] with the default [`Config`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail a drain with [`RunError::MicrotaskLimit`] after `limit` tasks.
    pub fn microtask_limit(mut self, limit: usize) -> Self {
        self.config.microtask_limit = limit;
        self
    }

    /// Preallocate room for `capacity` tasks in each queue.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Construct the [`EventLoop`].
    pub fn build(self) -> EventLoop {
        EventLoop::with_config(self.config)
    }
}

struct Shared {
    config: Config,
    microtasks: MicrotaskQueue,
    tasks: RefCell<VecDeque<Task>>,
    /// Keyed by deadline, then insertion sequence.
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
    next_timer: Cell<u64>,
    now: Cell<Duration>,
}

/// A single-threaded host with a microtask queue, a task queue and timers on
/// a virtual clock.
///
/// ```rust
/// use std::time::Duration;
/// use future_chain::{EventLoop, Future};
///
/// let event_loop = EventLoop::new();
/// let timers = event_loop.clone();
/// let future = Future::<i32>::new(&event_loop.handle(), move |resolver| {
///     timers.set_timeout(Duration::from_millis(100), move || resolver.resolve(5));
///     Ok(())
/// });
/// let sum = future.then(|v| Ok(v + 5));
///
/// event_loop.run_until(Duration::from_millis(99)).unwrap();
/// assert!(sum.is_pending());
/// event_loop.run().unwrap();
/// assert_eq!(sum.value(), Some(10));
/// ```
#[derive(Clone)]
pub struct EventLoop {
    shared: Rc<Shared>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("now", &self.now())
            .field("microtasks", &self.shared.microtasks.len())
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("timers", &self.shared.timers.borrow().len())
            .finish()
    }
}

impl EventLoop {
    /// Construct an [`EventLoop`] with the default [`Config`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Returns a [`Builder`] for configuring an [`EventLoop`].
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Construct an [`EventLoop`] from a [`Config`].
    pub fn with_config(config: Config) -> Self {
        let shared = Shared {
            config,
            microtasks: MicrotaskQueue::with_capacity(config.queue_capacity),
            tasks: RefCell::new(VecDeque::with_capacity(config.queue_capacity)),
            timers: RefCell::new(BTreeMap::new()),
            next_timer: Cell::new(0),
            now: Cell::new(Duration::ZERO),
        };
        Self {
            shared: Rc::new(shared),
        }
    }

    /// Returns the [`Config`] this loop was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Returns a [`Handle`] that schedules onto the microtask queue.
    pub fn handle(&self) -> Handle {
        self.shared.microtasks.handle()
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.shared.now.get()
    }

    /// Queue a macrotask.
    pub fn queue_task<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.shared.tasks.borrow_mut().push_back(Task::new(f));
    }

    /// Run `f` once `delay` has elapsed on the virtual clock.
    pub fn set_timeout<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + 'static,
    {
        let seq = self.shared.next_timer.get();
        self.shared.next_timer.set(seq + 1);
        let deadline = self.now() + delay;
        log::trace!(target: LOG, "timer.set deadline={deadline:?}");
        self.shared
            .timers
            .borrow_mut()
            .insert((deadline, seq), Task::new(f));
    }

    /// Returns true if there is no queued work of any kind.
    pub fn is_idle(&self) -> bool {
        self.shared.microtasks.is_empty()
            && self.shared.tasks.borrow().is_empty()
            && self.shared.timers.borrow().is_empty()
    }

    /// Run microtasks until the queue is empty.
    pub fn run_microtasks(&self) -> Result<usize, RunError> {
        let limit = self.shared.config.microtask_limit;
        let mut ran = 0;
        while let Some(task) = self.shared.microtasks.next() {
            if ran == limit {
                log::warn!(target: LOG, "microtasks.limit limit={limit}");
                return Err(RunError::MicrotaskLimit { limit });
            }
            task.run();
            ran += 1;
        }
        Ok(ran)
    }

    /// Run one macrotask, then drain microtasks.
    ///
    /// Queued tasks run before timers. When only timers remain, the clock
    /// advances to the earliest deadline. Returns false if there was nothing
    /// to run.
    pub fn turn(&self) -> Result<bool, RunError> {
        self.turn_until(None)
    }

    /// Run until no work remains.
    pub fn run(&self) -> Result<(), RunError> {
        self.run_microtasks()?;
        while self.turn()? {}
        Ok(())
    }

    /// Run until no work remains that is due at or before `deadline`, then
    /// leave the clock at `deadline`.
    pub fn run_until(&self, deadline: Duration) -> Result<(), RunError> {
        self.run_microtasks()?;
        while self.turn_until(Some(deadline))? {}
        if self.now() < deadline {
            self.shared.now.set(deadline);
        }
        Ok(())
    }

    fn turn_until(&self, deadline: Option<Duration>) -> Result<bool, RunError> {
        let task = self.shared.tasks.borrow_mut().pop_front();
        let task = match task {
            Some(task) => task,
            None => match self.pop_timer(deadline) {
                Some(task) => task,
                None => return Ok(false),
            },
        };
        task.run();
        self.run_microtasks()?;
        Ok(true)
    }

    fn pop_timer(&self, deadline: Option<Duration>) -> Option<Task> {
        let mut timers = self.shared.timers.borrow_mut();
        let (&(at, seq), _) = timers.first_key_value()?;
        if deadline.is_some_and(|deadline| at > deadline) {
            return None;
        }
        let task = timers.remove(&(at, seq))?;
        if at > self.now() {
            self.shared.now.set(at);
        }
        log::trace!(target: LOG, "timer.fire at={at:?}");
        Some(task)
    }
}
