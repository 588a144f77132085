//! Chainable deferred results for single-threaded, run-to-completion hosts.
//!
//! A [`Future`] is settled at most once by its producer through a
//! [`Resolver`], and any number of consumers chain continuations onto it with
//! [`Future::then`], [`Future::and_then`], [`Future::catch`] and friends.
//! A continuation may return another pending computation (anything
//! implementing [`Thenable`]); the derived future then adopts its outcome
//! rather than being fulfilled with it.
//!
//! Continuations never run inline. Every invocation is handed to the host's
//! scheduler through a [`Handle`], so a producer's `resolve` returns before any
//! consumer runs, and continuations attached to an already settled future
//! behave exactly like ones attached before it settled.
//!
//! # Components
//! - [`Future`], [`Resolver`], [`State`]: the state machine and its producer.
//! - [`Resolution`], [`Thenable`]: values that may themselves be pending.
//! - [`Schedule`], [`Task`], [`Handle`]: the host scheduler contract.
//! - [`MicrotaskQueue`], [`EventLoop`]: hosts that satisfy that contract.
//! - [`Wait`]: awaiting a [`Future`] from `async` Rust.
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::all
)]
mod error;
pub mod event_loop;
mod future;
mod microtask;
mod resolution;
mod schedule;
mod wait;

pub use error::{CycleError, Error};
pub use event_loop::{EventLoop, RunError};
pub use future::{Future, Resolver, State};
pub use microtask::MicrotaskQueue;
pub use resolution::{Resolution, Thenable};
pub use schedule::{Handle, Schedule, Task};
pub use wait::Wait;
