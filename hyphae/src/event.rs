//! Pending events: the records a blocked coroutine leaves in the wait queue
//! and the poller while it is suspended.
//!
//! An [`Event`] lives on the stack frame of the blocking call that created
//! it. The wait queue and the poller only hold pointers to it, so it must be
//! unlinked from both before that frame returns. A [`Registration`] guard
//! does this on every exit path, including unwinding out of the coroutine.
use crate::{executor::Core, poller::Interest, slot::SlotPtr, time::Deadline, util::fmt};
use core::cell::Cell;
use std::{io, os::unix::io::RawFd};

pub(crate) struct Event {
    owner: SlotPtr,
    id: u64,
    deadline: Deadline,
    fd: Option<(RawFd, Interest)>,
    status: Cell<Status>,
    pub(crate) queued: Cell<bool>,
    pub(crate) polled: Cell<bool>,
}

/// How a pending event completed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    /// Still waiting. An event that is found in this state after its owner
    /// resumes was woken by something other than its own completion.
    InProgress,
    /// The descriptor became ready for the requested operation.
    Ready,
    /// The deadline passed.
    TimedOut,
    /// The poller reported an error on the descriptor.
    Failed(i32),
}

/// Keeps a set of events registered with the executor, and removes them from
/// the wait queue and the poller when dropped.
#[must_use = "events are deregistered as soon as the registration is dropped"]
pub(crate) struct Registration<'a> {
    core: &'a Core,
    events: &'a [Event],
}

// === impl Event ===

impl Event {
    pub(crate) fn timer(owner: SlotPtr, id: u64, deadline: Deadline) -> Self {
        Self {
            owner,
            id,
            deadline,
            fd: None,
            status: Cell::new(Status::InProgress),
            queued: Cell::new(false),
            polled: Cell::new(false),
        }
    }

    pub(crate) fn io(
        owner: SlotPtr,
        id: u64,
        fd: RawFd,
        interest: Interest,
        deadline: Deadline,
    ) -> Self {
        Self {
            fd: Some((fd, interest)),
            ..Self::timer(owner, id, deadline)
        }
    }

    pub(crate) fn owner(&self) -> SlotPtr {
        self.owner
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub(crate) fn fd(&self) -> Option<(RawFd, Interest)> {
        self.fd
    }

    pub(crate) fn status(&self) -> Status {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.queued.get() || self.polled.get()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("deadline", &self.deadline)
            .field("fd", &self.fd)
            .field("status", &self.status.get())
            .field("queued", &self.queued.get())
            .field("polled", &self.polled.get())
            .finish()
    }
}

// === impl Registration ===

impl<'a> Registration<'a> {
    /// Registers every event in `events` with the wait queue, and each
    /// descriptor-bound event with the poller.
    ///
    /// If the poller rejects a descriptor, everything registered so far is
    /// unwound before the error is returned.
    pub(crate) fn new(core: &'a Core, events: &'a [Event]) -> io::Result<Self> {
        for (i, event) in events.iter().enumerate() {
            debug_assert!(!event.is_linked(), "registered an event twice");
            core.wait_queue().register(event);
            if event.fd.is_some() {
                if let Err(error) = core.poller().schedule(event) {
                    tracing::debug!(
                        event.id = event.id,
                        event.addr = fmt::ptr(event),
                        %error,
                        "failed to register with poller",
                    );
                    drop(Registration {
                        core,
                        events: &events[..=i],
                    });
                    return Err(error);
                }
            }
            test_trace!(event = ?event, "registered");
        }
        Ok(Self { core, events })
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for event in self.events {
            if event.queued.get() {
                self.core.wait_queue().remove(event);
            }
            if event.polled.get() {
                if let Err(error) = self.core.poller().remove(event) {
                    // The event is unlinked regardless; only the OS-side
                    // interest mask may be stale.
                    tracing::warn!(
                        event.id = event.id,
                        fd = ?event.fd,
                        %error,
                        "failed to update poller interest",
                    );
                }
            }
            debug_assert!(!event.is_linked());
        }
    }
}
