//! Single-threaded stackful coroutines.
//!
//! `hyphae` runs blocking-style network and timer code on one OS thread. Every
//! coroutine gets its own stack; a coroutine gives up the thread only at an
//! explicit suspension point (a yield, a blocking call, a join or an exit), at
//! which point control switches back to the [`Executor`]. The executor then
//! resumes other ready coroutines, and when nothing is ready, blocks on the OS
//! readiness poller until the earliest pending deadline.
//!
//! # Overview
//!
//! ```no_run
//! use hyphae::{Executor, Deadline};
//! use std::time::Duration;
//!
//! let executor = Executor::new().expect("failed to create executor");
//!
//! let sleeper = executor.spawn("sleeper", |co| {
//!     // a sleep that reaches its deadline reports `TimedOut`.
//!     let res = co.sleep(Duration::from_millis(10));
//!     assert!(matches!(res, Err(hyphae::Error::TimedOut)));
//! });
//!
//! executor.spawn("joiner", move |co| {
//!     assert!(co.join_until(&sleeper, Deadline::after(Duration::from_secs(1))));
//! });
//!
//! executor.run();
//! assert_eq!(executor.allocated(), 0);
//! ```
//!
//! # Components
//!
//! - [`executor`]: the run loop, ready queues, and coroutine lifecycle.
//! - [`coroutine`]: the handle a running coroutine uses to block, and the
//!   [`Handle`] used to cancel, join or wake it from elsewhere.
//! - [`poller`]: per-descriptor interest aggregation over a pluggable
//!   [`poller::Backend`].
//! - [`slot`]: the memory layout of coroutine storage.
//! - [`net`] and [`interrupt`]: conveniences built on the blocking
//!   operations.
//!
//! Each executor belongs to the thread that created it; none of these types
//! are `Send`.
#![cfg(unix)]
#![warn(missing_debug_implementations)]

#[macro_use]
pub(crate) mod util;

mod context;
mod event;
mod sys;
mod wait_queue;

pub mod coroutine;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod net;
pub mod poller;
pub mod slot;
pub mod time;

pub use self::coroutine::{Coroutine, Handle, Id};
pub use self::error::{Error, IoStatus, Result};
pub use self::executor::{Builder, Executor, Stats};
pub use self::poller::Interest;
pub use self::time::Deadline;
