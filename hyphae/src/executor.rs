//! The executor: the run loop that drives every coroutine on a thread.
//!
//! # Ticks
//!
//! The executor runs in *ticks*. At the start of each tick, every coroutine
//! that was scheduled for the next tick is promoted into the current one.
//! The current tick's coroutines are then run in FIFO order until each of
//! them suspends. A coroutine that reschedules itself (for instance, by
//! yielding) lands in the next tick, so it cannot starve the others in the
//! current one.
//!
//! The one exception is cancellation: a cancelled coroutine is pushed into
//! the *current* tick, so it observes its cancellation promptly.
//!
//! Once the current tick is drained, finished coroutines are torn down and
//! their slots recycled. Then, if anything is still waiting, the executor
//! polls the OS for descriptor readiness. It blocks until the earliest
//! pending deadline if nothing is ready to run, and doesn't block at all
//! otherwise. Ready descriptors and expired deadlines wake their coroutines
//! into the next tick.
//!
//! The run loop returns once nothing is ready and nothing is waiting.
use crate::{
    coroutine::{Coroutine, ExitToken, Handle, Id, State},
    event::{Event, Status},
    poller::{PollEvent, Poller},
    slot::{SlotPool, SlotPtr, StackLayout},
    time::Deadline,
    wait_queue::WaitQueue,
};
use core::{
    any::Any,
    cell::{Cell, RefCell, RefMut},
    fmt, mem,
    ptr::NonNull,
};
use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
    time::Instant,
};

mod builder;

pub use self::builder::Builder;

/// Runs coroutines on the current thread.
///
/// `Executor` is a cheap reference-counted handle; clones refer to the same
/// executor. A running coroutine can get one with [`Coroutine::executor`].
#[derive(Clone)]
pub struct Executor {
    core: Rc<Core>,
}

/// Counters describing the work an executor has done.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Stats {
    /// The number of ticks the run loop has completed.
    pub ticks: u64,

    /// The number of coroutines spawned.
    pub spawned: u64,

    /// The number of coroutines that have finished, whether by returning,
    /// exiting, or panicking.
    pub completed: u64,

    /// The number of times a coroutine was switched onto.
    pub switches: u64,

    /// The number of times the executor polled the OS for readiness.
    pub polls: u64,
}

pub(crate) struct Core {
    this: Weak<Core>,
    run_queue: RefCell<RunQueue>,
    wait_queue: RefCell<WaitQueue>,
    poller: RefCell<Poller>,
    poll_events: RefCell<Vec<PollEvent>>,
    pool: RefCell<SlotPool>,
    current: Cell<Option<SlotPtr>>,
    running: Cell<bool>,
    fail_on_error: Cell<bool>,
    layout: StackLayout,
    next_event_id: Cell<u64>,
    next_ticket: Cell<u64>,
    panicked: RefCell<Option<Box<dyn Any + Send>>>,
    stats: Cell<Stats>,
}

#[derive(Default)]
struct RunQueue {
    ready: VecDeque<Entry>,
    next: VecDeque<Entry>,
    to_delete: Vec<SlotPtr>,
}

#[derive(Copy, Clone)]
struct Entry {
    slot: SlotPtr,
    ticket: u64,
}

struct RunGuard<'a>(&'a Cell<bool>);

// === impl Executor ===

impl Executor {
    /// Returns a new executor with the default configuration.
    ///
    /// # Errors
    ///
    /// If the platform's readiness poller could not be created.
    pub fn new() -> io::Result<Self> {
        Builder::new().build()
    }

    /// Returns a [`Builder`] for configuring a new executor.
    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Spawns a coroutine running `f`.
    ///
    /// The coroutine first runs on the executor's next tick.
    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Handle
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        self.core.spawn(name.into(), Box::new(f))
    }

    /// Spawns `f` as a coroutine named `"sys_main"`, then runs the executor.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce(&Coroutine) + 'static,
    {
        self.spawn("sys_main", f);
        self.run();
    }

    /// Runs coroutines until none is ready and none is waiting.
    ///
    /// # Panics
    ///
    /// - If the executor is already running.
    /// - If a coroutine panics while [fail-on-error] is enabled. The
    ///   coroutine's panic is resumed on the caller's stack.
    /// - If the OS poller fails while [fail-on-error] is enabled.
    ///
    /// [fail-on-error]: Builder::fail_on_error
    pub fn run(&self) {
        self.core.run();
    }

    /// Cancels every coroutine that is ready to run or waiting on a deadline
    /// or descriptor.
    ///
    /// Each one observes [`Error::Cancelled`](crate::Error::Cancelled) from
    /// its current or next blocking operation.
    pub fn abort(&self) {
        self.core.abort();
    }

    /// Sets whether a panicking coroutine, or a failing OS poller, brings
    /// down the run loop.
    pub fn set_fail_on_error(&self, fail: bool) {
        self.core.fail_on_error.set(fail);
    }

    #[must_use]
    pub fn fail_on_error(&self) -> bool {
        self.core.fail_on_error.get()
    }

    /// Returns the number of coroutines currently allocated: spawned, and not
    /// yet torn down.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.core.pool.borrow().allocated()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.core.stats.get()
    }

    /// Returns the id of the coroutine currently running, if any.
    #[must_use]
    pub fn running(&self) -> Option<Id> {
        let slot = self.core.current.get()?;
        // Safety: the current slot is alive while it runs.
        unsafe { slot.as_ref() }.coroutine().map(Coroutine::id)
    }

    /// Returns the memory layout of each coroutine this executor spawns.
    #[must_use]
    pub fn stack_layout(&self) -> StackLayout {
        self.core.layout
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { core } = self;
        f.debug_struct("Executor")
            .field("allocated", &core.pool.borrow().allocated())
            .field("waiting", &core.wait_queue.borrow().len())
            .field("poller", &*core.poller.borrow())
            .field("stats", &core.stats.get())
            .field("fail_on_error", &core.fail_on_error.get())
            .finish()
    }
}

// === impl Core ===

impl Core {
    pub(crate) fn new(poller: Poller, layout: StackLayout, fail_on_error: bool) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            run_queue: RefCell::new(RunQueue::default()),
            wait_queue: RefCell::new(WaitQueue::new()),
            poller: RefCell::new(poller),
            poll_events: RefCell::new(Vec::new()),
            pool: RefCell::new(SlotPool::new()),
            current: Cell::new(None),
            running: Cell::new(false),
            fail_on_error: Cell::new(fail_on_error),
            layout,
            next_event_id: Cell::new(0),
            next_ticket: Cell::new(0),
            panicked: RefCell::new(None),
            stats: Cell::new(Stats::default()),
        })
    }

    pub(crate) fn weak(&self) -> Weak<Core> {
        self.this.clone()
    }

    pub(crate) fn executor(&self) -> Executor {
        Executor {
            core: self
                .this
                .upgrade()
                .expect("a coroutine outlived its executor"),
        }
    }

    pub(crate) fn wait_queue(&self) -> RefMut<'_, WaitQueue> {
        self.wait_queue.borrow_mut()
    }

    pub(crate) fn poller(&self) -> RefMut<'_, Poller> {
        self.poller.borrow_mut()
    }

    pub(crate) fn current(&self) -> Option<SlotPtr> {
        self.current.get()
    }

    pub(crate) fn next_event_id(&self) -> u64 {
        let id = self.next_event_id.get();
        self.next_event_id.set(id + 1);
        id
    }

    fn next_ticket(&self) -> u64 {
        let ticket = self.next_ticket.get() + 1;
        self.next_ticket.set(ticket);
        ticket
    }

    fn update_stats(&self, f: impl FnOnce(&mut Stats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub(crate) fn spawn(&self, name: String, func: Box<dyn FnOnce(&Coroutine)>) -> Handle {
        let slot = self.pool.borrow_mut().allocate();
        let coroutine = Coroutine::new(NonNull::from(self), slot, Rc::from(name), func);
        tracing::trace!(
            coroutine.id = %coroutine.id(),
            coroutine.name = coroutine.name(),
            slot = crate::util::fmt::ptr(unsafe { slot.as_ref() }),
            "spawn",
        );

        // Safety: freshly allocated slots are alive and empty.
        let slot_ref = unsafe { slot.as_ref() };
        slot_ref.construct(coroutine, self.layout, move || trampoline(slot));
        self.update_stats(|stats| stats.spawned += 1);

        let handle = slot_ref
            .coroutine()
            .map(Coroutine::handle)
            .expect("slot was just constructed");
        self.schedule_execution(slot);
        handle
    }

    /// Queues a coroutine for the next tick.
    pub(crate) fn schedule_execution(&self, slot: SlotPtr) {
        self.enqueue(slot, State::ReadyNext);
    }

    /// Queues a coroutine for the current tick.
    pub(crate) fn schedule_execution_now(&self, slot: SlotPtr) {
        self.enqueue(slot, State::Ready);
    }

    fn enqueue(&self, slot: SlotPtr, state: State) {
        // Safety: slots live as long as the core.
        let Some(co) = (unsafe { slot.as_ref() }).coroutine() else {
            return;
        };
        if co.state() == State::Finished {
            return;
        }

        let ticket = self.next_ticket();
        co.set_ticket(ticket);
        co.set_scheduled(true);
        co.set_state(state);
        test_trace!(coroutine.id = %co.id(), ?state, "schedule");

        let entry = Entry { slot, ticket };
        let mut run_queue = self.run_queue.borrow_mut();
        match state {
            State::Ready => run_queue.ready.push_back(entry),
            _ => run_queue.next.push_back(entry),
        }
    }

    /// Takes a coroutine out of whichever ready queue it is in.
    pub(crate) fn unlink(&self, slot: SlotPtr) {
        // Safety: slots live as long as the core.
        if let Some(co) = unsafe { slot.as_ref() }.coroutine() {
            co.set_ticket(self.next_ticket());
            co.set_scheduled(false);
        }
    }

    /// Flags a coroutine as cancelled, and if it is not the one running,
    /// moves it into the current tick so it sees the cancellation.
    pub(crate) fn cancel(&self, slot: SlotPtr) {
        // Safety: slots live as long as the core.
        let Some(co) = unsafe { slot.as_ref() }.coroutine() else {
            return;
        };
        if !co.mark_cancelled() {
            return;
        }

        tracing::debug!(coroutine.id = %co.id(), coroutine.name = co.name(), "cancel");
        if self.current.get() != Some(slot) {
            self.schedule_execution_now(slot);
        }
    }

    pub(crate) fn wake(&self, slot: SlotPtr) {
        test_trace!(slot = ?slot, "wake");
        self.schedule_execution(slot);
    }

    pub(crate) fn abort(&self) {
        let mut targets: Vec<SlotPtr> = self.wait_queue.borrow().owners().collect();
        {
            let run_queue = self.run_queue.borrow();
            targets.extend(
                run_queue
                    .ready
                    .iter()
                    .chain(run_queue.next.iter())
                    .filter(|entry| entry.is_live())
                    .map(|entry| entry.slot),
            );
        }

        tracing::debug!(coroutines = targets.len(), "abort");
        for slot in targets {
            self.cancel(slot);
        }
    }

    /// Marks a coroutine finished. Called on the coroutine's own stack, just
    /// before its context returns for the last time.
    fn exit(&self, co: &Coroutine) {
        tracing::trace!(coroutine.id = %co.id(), "finished");
        self.unlink(co.slot());
        co.set_state(State::Finished);
        self.run_queue.borrow_mut().to_delete.push(co.slot());
        self.update_stats(|stats| stats.completed += 1);
    }

    fn coroutine_panicked(&self, co: &Coroutine, payload: Box<dyn Any + Send>) {
        if self.fail_on_error.get() {
            let mut panicked = self.panicked.borrow_mut();
            if panicked.is_none() {
                *panicked = Some(payload);
            }
            return;
        }

        tracing::error!(
            coroutine.id = %co.id(),
            coroutine.name = co.name(),
            panic = panic_message(&*payload),
            "coroutine panicked",
        );
    }

    fn internal_error(&self, error: io::Error) {
        if self.fail_on_error.get() {
            panic!("executor poller failed: {error}");
        }
        tracing::error!(%error, "executor poller failed");
    }

    fn run(&self) {
        assert!(!self.running.replace(true), "executor is already running");
        let _guard = RunGuard(&self.running);

        loop {
            let activated = self.tick();

            self.delete_scheduled();
            if let Some(payload) = self.panicked.borrow_mut().take() {
                panic::resume_unwind(payload);
            }

            let (has_next, waiting) = {
                let run_queue = self.run_queue.borrow();
                (!run_queue.next.is_empty(), !self.wait_queue.borrow().is_empty())
            };
            tracing::trace!(
                tick = self.stats.get().ticks,
                activated,
                has_next,
                waiting,
                "tick complete",
            );

            if !waiting {
                if has_next {
                    continue;
                }
                break;
            }

            self.wait_for_io(has_next);
        }

        tracing::debug!(stats = ?self.stats.get(), "executor idle");
    }

    /// Promotes the next tick into the current one and drains it.
    fn tick(&self) -> usize {
        {
            let mut run_queue = self.run_queue.borrow_mut();
            let next = mem::take(&mut run_queue.next);
            run_queue.ready.extend(next);
        }

        let mut activated = 0;
        loop {
            let entry = self.run_queue.borrow_mut().ready.pop_front();
            let Some(entry) = entry else {
                break;
            };
            if entry.is_live() {
                self.activate(entry.slot);
                activated += 1;
            }
        }

        self.update_stats(|stats| {
            stats.ticks += 1;
            stats.switches += activated as u64;
        });
        activated
    }

    /// Switches onto a coroutine until it suspends or finishes.
    fn activate(&self, slot: SlotPtr) {
        // Safety: slots live as long as the core.
        let slot_ref = unsafe { slot.as_ref() };
        let Some(co) = slot_ref.coroutine() else {
            return;
        };

        let span = tracing::debug_span!(
            "coroutine",
            id = co.id().as_u64(),
            name = co.name(),
        );
        let _enter = span.enter();

        self.current.set(Some(slot));
        co.set_scheduled(false);
        co.set_state(State::Running);
        let finished = slot_ref.resume();
        self.current.set(None);

        debug_assert!(!finished || co.state() == State::Finished);
    }

    fn delete_scheduled(&self) {
        let to_delete = mem::take(&mut self.run_queue.borrow_mut().to_delete);
        for slot in to_delete {
            // Safety: slots live as long as the core.
            unsafe { slot.as_ref() }.destruct();
            self.pool.borrow_mut().release(slot);
        }
    }

    fn wait_for_io(&self, has_next: bool) {
        // events already due are woken without waiting on the poller, and the
        // earliest one still pending bounds how long the poller may block.
        let next = self.expire_due();
        let deadline = if has_next { Deadline::Immediate } else { next };
        test_dbg!(deadline);

        let mut events = self.poll_events.borrow_mut();
        let res = self.poller.borrow_mut().wait(&mut events, deadline);
        self.update_stats(|stats| stats.polls += 1);
        if let Err(error) = res {
            self.internal_error(error);
        }

        for event in events.iter() {
            self.dispatch(event);
        }
        drop(events);

        self.expire_due();
    }

    fn expire_due(&self) -> Deadline {
        self.wait_queue
            .borrow_mut()
            .expire_due(Instant::now(), |event| self.schedule_execution(event.owner()))
    }

    /// Wakes every event waiting on a descriptor the poller reported.
    fn dispatch(&self, ready: &PollEvent) {
        let poller = self.poller.borrow();
        for event in poller.events_for(ready.fd) {
            if event.status() != Status::InProgress {
                continue;
            }
            let status = match ready.error {
                Some(errno) => Status::Failed(errno),
                None if event
                    .fd()
                    .is_some_and(|(_, interest)| interest.intersects(ready.ready)) =>
                {
                    Status::Ready
                }
                None => continue,
            };
            self.wake_event(event, status);
        }
    }

    fn wake_event(&self, event: &Event, status: Status) {
        event.set_status(status);
        self.wait_queue.borrow_mut().remove(event);
        test_trace!(event.id = event.id(), ?status, "wake");
        self.schedule_execution(event.owner());
    }

    #[cfg(test)]
    pub(crate) fn run_queue_len(&self) -> (usize, usize) {
        let run_queue = self.run_queue.borrow();
        (run_queue.ready.len(), run_queue.next.len())
    }
}

/// The first and last code to run on every coroutine's stack.
fn trampoline(slot: SlotPtr) {
    // Safety: a slot is not destructed until its context has returned.
    let slot = unsafe { slot.as_ref() };
    let co = slot
        .coroutine()
        .expect("a coroutine's context outlived the coroutine");
    let core = co.core();

    if let Some(func) = co.take_func() {
        let res = panic::catch_unwind(AssertUnwindSafe(|| func(co)));
        let exited = matches!(&res, Err(payload) if payload.is::<ExitToken>());
        // an exit whose unwind was swallowed cannot be recovered from; fail
        // the whole executor rather than just this coroutine.
        assert!(
            exited || !co.is_exiting(),
            "coroutine {} ({}) kept running after exit()",
            co.id(),
            co.name(),
        );
        if let Err(payload) = res {
            if !exited {
                core.coroutine_panicked(co, payload);
            }
        }
    }

    co.wake_all_waiters();
    core.exit(co);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// === impl Entry ===

impl Entry {
    fn is_live(&self) -> bool {
        // Safety: slots live as long as the core.
        unsafe { self.slot.as_ref() }
            .coroutine()
            .is_some_and(|co| {
                co.ticket() == self.ticket && matches!(co.state(), State::Ready | State::ReadyNext)
            })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
