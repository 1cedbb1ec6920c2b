//! Coroutines and the operations they block on.
//!
//! A [`Coroutine`] is what a spawned function receives: a reference to its
//! own coroutine, through which it performs every operation that may suspend
//! it. A [`Handle`] refers to a coroutine from the outside, and is used to
//! cancel it, wake it, or join it.
//!
//! # Blocking operations
//!
//! Every blocking operation comes in three forms: one bounded by an absolute
//! [`Deadline`] (`*_until`), one bounded by a relative timeout (`*_timeout`),
//! and one that waits for as long as it takes. A blocked operation returns
//! [`Error::Cancelled`] if the coroutine is cancelled before or while it
//! waits, [`Error::TimedOut`] if its deadline passes, and
//! [`Error::WokenUp`] if the coroutine is rescheduled by someone else before
//! the operation could complete.
//!
//! Descriptors passed to the I/O operations must be in non-blocking mode.
use crate::{
    error::{Error, Result},
    event::{Event, Registration, Status},
    executor::{Core, Executor},
    poller::Interest,
    slot::SlotPtr,
    time::Deadline,
};
use core::{
    cell::{Cell, RefCell},
    fmt,
    ptr::NonNull,
};
use std::{
    collections::VecDeque,
    io,
    os::unix::io::RawFd,
    rc::{Rc, Weak},
    time::Duration,
};

mod id;
mod io_ops;

pub use self::id::Id;

/// A running coroutine.
///
/// A `&Coroutine` is passed to the function a coroutine was spawned with, and
/// is only ever valid on that coroutine's own stack.
pub struct Coroutine {
    core: NonNull<Core>,
    slot: SlotPtr,
    id: Id,
    name: Rc<str>,
    func: Cell<Option<Box<dyn FnOnce(&Coroutine)>>>,
    cancelled: Cell<bool>,
    exiting: Cell<bool>,
    scheduled: Cell<bool>,
    state: Cell<State>,
    /// Identifies the coroutine's current entry in a ready queue. Entries
    /// carrying any other ticket are stale and skipped.
    ticket: Cell<u64>,
    waiters: RefCell<VecDeque<NonNull<JoinWait>>>,
}

/// A reference to a coroutine that may have finished.
///
/// Handles do not keep their coroutine alive. Once it finishes, every
/// operation on a handle is a no-op, even if the coroutine's storage has
/// since been reused for another coroutine.
#[derive(Clone)]
pub struct Handle {
    core: Weak<Core>,
    slot: SlotPtr,
    generation: u64,
    id: Id,
    name: Rc<str>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Switched onto by the executor and not yet suspended.
    Running,
    /// Queued for the current tick.
    Ready,
    /// Queued for the next tick.
    ReadyNext,
    /// Suspended with at least one pending event.
    Waiting,
    /// Suspended with nothing that will wake it except another coroutine.
    Parked,
    /// Returned, exited or panicked; awaiting deletion.
    Finished,
}

/// A record on a joining coroutine's stack, linked into the joinee's waiter
/// list for as long as the join is outstanding.
struct JoinWait {
    joiner: SlotPtr,
    linked: Cell<bool>,
}

/// Unwound through a coroutine's stack by [`Coroutine::exit`].
pub(crate) struct ExitToken;

// === impl Coroutine ===

impl Coroutine {
    pub(crate) fn new(
        core: NonNull<Core>,
        slot: SlotPtr,
        name: Rc<str>,
        func: Box<dyn FnOnce(&Coroutine)>,
    ) -> Self {
        Self {
            core,
            slot,
            id: Id::next(),
            name,
            func: Cell::new(Some(func)),
            cancelled: Cell::new(false),
            exiting: Cell::new(false),
            scheduled: Cell::new(false),
            state: Cell::new(State::Parked),
            ticket: Cell::new(0),
            waiters: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn core(&self) -> &Core {
        // Safety: the core owns the slot pool, which owns this coroutine.
        unsafe { self.core.as_ref() }
    }

    pub(crate) fn slot(&self) -> SlotPtr {
        self.slot
    }

    pub(crate) fn take_func(&self) -> Option<Box<dyn FnOnce(&Coroutine)>> {
        self.func.take()
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.get()
    }

    pub(crate) fn state(&self) -> State {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket.get()
    }

    pub(crate) fn set_ticket(&self, ticket: u64) {
        self.ticket.set(ticket);
    }

    pub(crate) fn set_scheduled(&self, scheduled: bool) {
        self.scheduled.set(scheduled);
    }

    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.replace(true)
    }

    /// Returns this coroutine's unique [`Id`].
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the name this coroutine was spawned with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a [`Handle`] to this coroutine.
    #[must_use]
    pub fn handle(&self) -> Handle {
        // Safety: the slot is alive while its coroutine is.
        let generation = unsafe { self.slot.as_ref() }.generation();
        Handle {
            core: self.core().weak(),
            slot: self.slot,
            generation,
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Returns the executor this coroutine runs on.
    #[must_use]
    pub fn executor(&self) -> Executor {
        self.core().executor()
    }

    /// Returns `true` if this coroutine has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Returns `true` if this coroutine is queued to run.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.get()
    }

    /// Returns `true` if this coroutine is the one currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core().current() == Some(self.slot)
    }

    /// Cancels this coroutine.
    ///
    /// See [`Handle::cancel`].
    pub fn cancel(&self) {
        self.core().cancel(self.slot);
    }

    /// Spawns a new coroutine on this coroutine's executor.
    ///
    /// The new coroutine first runs on the executor's next tick.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Handle
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        self.core().spawn(name.into(), Box::new(f))
    }

    /// Lets every other coroutine that is ready run before this one
    /// continues.
    pub fn yield_now(&self) {
        if self.is_cancelled() {
            // a cancelled sleep returns without suspending, so reschedule
            // explicitly; otherwise a cancelled coroutine that keeps yielding
            // would never let anything else run.
            self.reschedule_and_switch();
            return;
        }
        let _ = self.sleep_until(Deadline::Immediate);
    }

    /// Stops this coroutine.
    ///
    /// Unwinds the coroutine's stack, running destructors, and then finishes
    /// it exactly as if its function had returned: any coroutines joining it
    /// are woken.
    ///
    /// # Panics
    ///
    /// The unwind must reach the coroutine's entry point. If something
    /// catches it and the coroutine carries on, the executor panics the next
    /// time the coroutine blocks or when its function returns.
    pub fn exit(&self) -> ! {
        tracing::trace!(coroutine.id = %self.id, "exit");
        self.exiting.set(true);
        std::panic::resume_unwind(Box::new(ExitToken))
    }

    /// Sleeps until `deadline`.
    ///
    /// Reaching the deadline is reported as [`Error::TimedOut`]. `Ok(())`
    /// means the coroutine was woken before its deadline: by a
    /// [`Handle::wake`], or by the completion of a coroutine it was joining.
    pub fn sleep_until(&self, deadline: Deadline) -> Result<()> {
        let events = [Event::timer(self.slot, self.core().next_event_id(), deadline)];
        self.wait_for(&events)?;
        match events[0].status() {
            Status::TimedOut => Err(Error::TimedOut),
            _ => Ok(()),
        }
    }

    /// Sleeps for `timeout`. See [`sleep_until`](Self::sleep_until).
    pub fn sleep(&self, timeout: Duration) -> Result<()> {
        self.sleep_until(Deadline::after(timeout))
    }

    /// Sleeps until woken or cancelled.
    pub fn sleep_forever(&self) -> Result<()> {
        self.sleep_until(Deadline::Never)
    }

    /// Waits until `fd` is ready for `interest`.
    pub fn poll_until(&self, fd: RawFd, interest: Interest, deadline: Deadline) -> Result<()> {
        let events = [Event::io(
            self.slot,
            self.core().next_event_id(),
            fd,
            interest,
            deadline,
        )];
        self.wait_for(&events)?;
        status_to_result(events[0].status())
    }

    pub fn poll_timeout(&self, fd: RawFd, interest: Interest, timeout: Duration) -> Result<()> {
        self.poll_until(fd, interest, Deadline::after(timeout))
    }

    pub fn poll(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.poll_until(fd, interest, Deadline::Never)
    }

    /// Waits until any of `fds` is ready for its interest, and returns the
    /// first one that is.
    ///
    /// An error reported on any descriptor fails the whole select. An empty
    /// set of descriptors returns `Ok(None)` immediately.
    pub fn select_until(
        &self,
        fds: &[(RawFd, Interest)],
        deadline: Deadline,
    ) -> Result<Option<RawFd>> {
        if fds.is_empty() {
            return Ok(None);
        }

        let core = self.core();
        let events: Vec<Event> = fds
            .iter()
            .map(|&(fd, interest)| Event::io(self.slot, core.next_event_id(), fd, interest, deadline))
            .collect();
        self.wait_for(&events)?;

        let mut timed_out = false;
        for event in &events {
            match event.status() {
                Status::InProgress => {}
                Status::TimedOut => timed_out = true,
                Status::Ready => return Ok(event.fd().map(|(fd, _)| fd)),
                Status::Failed(errno) => return Err(io::Error::from_raw_os_error(errno).into()),
            }
        }

        if timed_out {
            Err(Error::TimedOut)
        } else {
            Err(Error::WokenUp)
        }
    }

    pub fn select_timeout(
        &self,
        fds: &[(RawFd, Interest)],
        timeout: Duration,
    ) -> Result<Option<RawFd>> {
        self.select_until(fds, Deadline::after(timeout))
    }

    pub fn select(&self, fds: &[(RawFd, Interest)]) -> Result<Option<RawFd>> {
        self.select_until(fds, Deadline::Never)
    }

    /// Waits for the coroutine behind `handle` to finish.
    ///
    /// Returns `true` if it finished. If the deadline passes first, or this
    /// coroutine is cancelled while waiting, the joinee is cancelled and this
    /// coroutine keeps waiting until it has actually finished; `false` is
    /// returned in that case. `false` is also returned if this coroutine is
    /// woken for any other reason before the joinee finishes.
    ///
    /// Joining a coroutine that has already finished returns `true`
    /// immediately.
    ///
    /// # Panics
    ///
    /// If `handle` refers to this coroutine.
    pub fn join_until(&self, handle: &Handle, deadline: Deadline) -> bool {
        let wait = JoinWait {
            joiner: self.slot,
            linked: Cell::new(false),
        };

        let linked = handle.with_coroutine(|target| {
            assert!(
                target.slot != self.slot,
                "coroutine {} ({}) tried to join itself",
                self.id,
                self.name,
            );
            target.waiters.borrow_mut().push_back(NonNull::from(&wait));
            wait.linked.set(true);
        });
        if linked.is_none() {
            return true;
        }

        tracing::trace!(coroutine.id = %self.id, joinee.id = %handle.id, "join");
        let res = self.sleep_until(deadline);

        if !wait.linked.get() {
            return true;
        }

        if matches!(res, Err(Error::TimedOut | Error::Cancelled)) || self.is_cancelled() {
            tracing::debug!(
                coroutine.id = %self.id,
                joinee.id = %handle.id,
                ?res,
                "join abandoned; cancelling joinee",
            );
            handle.cancel();
            // The joinee wakes us when it finishes. Nothing bounds how long
            // that takes.
            while wait.linked.get() {
                self.switch_to_scheduler();
            }
        } else {
            // woken by someone else; the joinee is still alive.
            handle.with_coroutine(|target| {
                let ptr = NonNull::from(&wait);
                target.waiters.borrow_mut().retain(|&w| w != ptr);
            });
            wait.linked.set(false);
        }

        false
    }

    pub fn join_timeout(&self, handle: &Handle, timeout: Duration) -> bool {
        self.join_until(handle, Deadline::after(timeout))
    }

    pub fn join(&self, handle: &Handle) -> bool {
        self.join_until(handle, Deadline::Never)
    }

    /// Registers `events`, suspends until one of them (or anything else)
    /// reschedules this coroutine, then deregisters them.
    fn wait_for(&self, events: &[Event]) -> Result<()> {
        self.assert_not_exited();
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let core = self.core();
        let _registration = Registration::new(core, events)?;
        core.unlink(self.slot);
        self.state.set(State::Waiting);

        self.switch_to_scheduler();

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn reschedule_and_switch(&self) {
        self.core().schedule_execution(self.slot);
        self.switch_to_scheduler();
    }

    /// Gives control back to the executor.
    ///
    /// The coroutine only runs again once something reschedules it.
    ///
    /// # Panics
    ///
    /// If this coroutine is not the one currently running.
    pub(crate) fn switch_to_scheduler(&self) {
        assert!(
            self.is_running(),
            "coroutine {} ({}) switched to the scheduler while not running",
            self.id,
            self.name,
        );
        self.assert_not_exited();
        if self.state.get() == State::Running {
            self.state.set(State::Parked);
        }
        test_trace!(coroutine.id = %self.id, state = ?self.state.get(), "switch to scheduler");
        // Safety: the slot is alive while its coroutine runs.
        unsafe { self.slot.as_ref() }.switch().suspend();
    }

    fn assert_not_exited(&self) {
        assert!(
            !self.exiting.get(),
            "coroutine {} ({}) kept running after exit()",
            self.id,
            self.name,
        );
    }

    /// Reschedules every coroutine joining this one, in the order they
    /// started joining.
    pub(crate) fn wake_all_waiters(&self) {
        loop {
            let Some(wait) = self.waiters.borrow_mut().pop_front() else {
                break;
            };
            // Safety: a join record stays linked, and therefore alive, until
            // it is unlinked here or by its own joiner.
            let wait = unsafe { wait.as_ref() };
            wait.linked.set(false);
            self.core().schedule_execution(wait.joiner);
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state.get())
            .field("cancelled", &self.cancelled.get())
            .field("scheduled", &self.scheduled.get())
            .field("waiters", &self.waiters.borrow().len())
            .finish()
    }
}

pub(crate) fn status_to_result(status: Status) -> Result<()> {
    match status {
        Status::Ready => Ok(()),
        Status::TimedOut => Err(Error::TimedOut),
        Status::Failed(errno) => Err(io::Error::from_raw_os_error(errno).into()),
        Status::InProgress => Err(Error::WokenUp),
    }
}

// === impl Handle ===

impl Handle {
    /// Runs `f` with the coroutine, if it has not finished.
    pub(crate) fn with_coroutine<R>(&self, f: impl FnOnce(&Coroutine) -> R) -> Option<R> {
        let core = self.core.upgrade()?;
        // Safety: slots live as long as the core that owns them.
        let slot = unsafe { self.slot.as_ref() };
        if slot.generation() != self.generation {
            return None;
        }
        let co = slot.coroutine()?;
        if co.state() == State::Finished {
            return None;
        }
        let res = f(co);
        drop(core);
        Some(res)
    }

    /// Returns the [`Id`] of the coroutine.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the name the coroutine was spawned with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if the coroutine has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.with_coroutine(|_| ()).is_none()
    }

    /// Returns `true` if the coroutine has been cancelled and has not yet
    /// finished.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.with_coroutine(Coroutine::is_cancelled)
            .unwrap_or(false)
    }

    /// Cancels the coroutine.
    ///
    /// Cancellation is cooperative: the coroutine's current or next blocking
    /// operation returns [`Error::Cancelled`], and so does every one after
    /// that. If the coroutine is suspended, it is moved to the front of the
    /// line and runs again in the current tick.
    ///
    /// Cancelling twice, or cancelling a finished coroutine, does nothing.
    pub fn cancel(&self) {
        self.with_coroutine(Coroutine::cancel);
    }

    /// Reschedules the coroutine for the next tick without cancelling it.
    ///
    /// A coroutine woken this way while blocked returns from its blocking
    /// operation early: sleeps return `Ok(())`, and descriptor waits return
    /// [`Error::WokenUp`].
    pub fn wake(&self) {
        self.with_coroutine(|co| co.core().wake(co.slot));
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handle {}
