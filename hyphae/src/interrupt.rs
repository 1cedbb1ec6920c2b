//! Waking a blocked coroutine without cancelling it.
use crate::{
    coroutine::{Coroutine, Handle},
    error::{Error, IoStatus, Result},
};
use core::cell::Cell;

/// A one-shot signal that dislodges a coroutine from whatever it is blocked
/// on.
///
/// Unlike cancellation, an interrupt does not stick: the interrupted
/// operation returns [`Error::WokenUp`], and the coroutine's later operations
/// are unaffected. An interrupt that arrives before the wait starts is not
/// lost; the wait returns [`Error::WokenUp`] without blocking.
///
/// ```no_run
/// use hyphae::{interrupt::Interruptible, Executor, Interest};
/// use std::{os::unix::{io::AsRawFd, net::UnixStream}, rc::Rc};
///
/// let executor = Executor::new().unwrap();
/// let (sock, _peer) = UnixStream::pair().unwrap();
///
/// executor.execute(move |co| {
///     let signal = Rc::new(Interruptible::new(co));
///     let remote = signal.clone();
///     co.spawn("interrupter", move |_| remote.interrupt());
///
///     let res = signal.wait(|| co.poll(sock.as_raw_fd(), Interest::READ));
///     assert!(matches!(res, Err(hyphae::Error::WokenUp)));
/// });
/// ```
#[derive(Debug)]
pub struct Interruptible {
    handle: Handle,
    interrupted: Cell<bool>,
}

impl Interruptible {
    /// Returns a signal that interrupts `co`.
    #[must_use]
    pub fn new(co: &Coroutine) -> Self {
        Self {
            handle: co.handle(),
            interrupted: Cell::new(false),
        }
    }

    /// Interrupts the coroutine, rescheduling it if it is blocked.
    pub fn interrupt(&self) {
        if self.interrupted.replace(true) {
            return;
        }
        tracing::trace!(coroutine.id = %self.handle.id(), "interrupt");
        self.handle.wake();
    }

    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupted.get()
    }

    /// Runs the blocking operation `f`, unless the interrupt has already
    /// fired.
    ///
    /// If the interrupt fires while `f` is blocked, the wait fails with
    /// [`Error::WokenUp`] even when `f` itself reports success, as an
    /// externally woken sleep does.
    pub fn wait<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.interrupted.get() {
            return Err(Error::WokenUp);
        }
        match f() {
            Ok(_) if self.interrupted.get() => Err(Error::WokenUp),
            res => res,
        }
    }

    /// Runs the read or write `f`, unless the interrupt has already fired.
    ///
    /// An interrupted transfer keeps the byte count it made before being
    /// woken, with [`Error::WokenUp`] as its status.
    pub fn wait_io(&self, f: impl FnOnce() -> IoStatus) -> IoStatus {
        if self.interrupted.get() {
            return IoStatus::error(0, Error::WokenUp);
        }
        f()
    }
}
