//! Descriptor readiness.
//!
//! The [`Poller`] tracks, for every descriptor some coroutine is blocked on,
//! the events waiting on it and the union of their [`Interest`]s. Only that
//! union is passed down to the OS-level [`Backend`], and only when it
//! changes, so many coroutines waiting on one descriptor cost a single
//! registration.
use crate::{event::Event, time::Deadline};
use core::{fmt, ptr::NonNull};
use std::{
    collections::{HashMap, VecDeque},
    io,
    os::unix::io::RawFd,
};

#[cfg(target_os = "linux")]
mod epoll;
mod poll;

#[cfg(target_os = "linux")]
pub use self::epoll::Epoll;
pub use self::poll::Poll;

bitflags::bitflags! {
    /// The operations a coroutine is waiting to perform on a descriptor.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Interest: u16 {
        /// The descriptor is readable, or has a pending connection to accept.
        const READ = 1 << 0;
        /// The descriptor is writable, or has finished connecting.
        const WRITE = 1 << 1;
    }
}

/// An OS readiness multiplexer.
///
/// Backends are level-triggered: a descriptor that is still ready is reported
/// again by every call to [`wait`](Backend::wait) until its interest is
/// cleared.
pub trait Backend: fmt::Debug {
    /// Sets the interest mask for `fd`, replacing any previous mask.
    ///
    /// An empty mask removes the descriptor from the backend entirely.
    fn set(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks until at least one descriptor is ready or `deadline` passes,
    /// then appends the ready descriptors to `events`.
    ///
    /// Being interrupted by a signal is not an error; the backend returns
    /// with no events.
    fn wait(&mut self, events: &mut Vec<PollEvent>, deadline: Deadline) -> io::Result<()>;
}

/// Readiness reported by a [`Backend`] for one descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub ready: Interest,
    /// Set if the backend reported an error condition on the descriptor.
    /// Every event waiting on the descriptor fails with this errno.
    pub error: Option<i32>,
}

/// Returns the preferred [`Backend`] for this platform.
pub fn default_for_platform() -> io::Result<Box<dyn Backend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(Epoll::new()?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(Box::new(Poll::new()))
    }
}

pub(crate) struct Poller {
    backend: Box<dyn Backend>,
    lists: HashMap<RawFd, List>,
}

#[derive(Default)]
struct List {
    events: VecDeque<NonNull<Event>>,
    interest: Interest,
}

impl Default for Interest {
    fn default() -> Self {
        Interest::empty()
    }
}

// === impl PollEvent ===

impl PollEvent {
    #[must_use]
    pub fn ready(fd: RawFd, ready: Interest) -> Self {
        Self {
            fd,
            ready,
            error: None,
        }
    }

    #[must_use]
    pub fn error(fd: RawFd, errno: i32) -> Self {
        Self {
            fd,
            ready: Interest::READ | Interest::WRITE,
            error: Some(errno),
        }
    }
}

// === impl Poller ===

impl Poller {
    pub(crate) fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            lists: HashMap::new(),
        }
    }

    /// Adds a descriptor-bound event to its descriptor's list, widening the
    /// backend's interest mask if needed.
    ///
    /// If the backend rejects the new mask, the event is not added.
    pub(crate) fn schedule(&mut self, event: &Event) -> io::Result<()> {
        let (fd, interest) = event
            .fd()
            .expect("only descriptor-bound events can be polled");
        let list = self.lists.entry(fd).or_default();
        let old = list.interest;
        let new = old | interest;
        if new != old {
            if let Err(error) = self.backend.set(fd, new) {
                if list.events.is_empty() {
                    self.lists.remove(&fd);
                }
                return Err(error);
            }
            list.interest = new;
        }

        list.events.push_front(NonNull::from(event));
        event.polled.set(true);
        test_trace!(fd, ?old, ?new, "poller scheduled");
        Ok(())
    }

    /// Removes an event from its descriptor's list, narrowing the backend's
    /// interest mask if nothing else needs it.
    ///
    /// The event is unlinked even if updating the backend fails.
    pub(crate) fn remove(&mut self, event: &Event) -> io::Result<()> {
        if !event.polled.replace(false) {
            return Ok(());
        }

        let Some((fd, _)) = event.fd() else {
            return Ok(());
        };
        let Some(list) = self.lists.get_mut(&fd) else {
            return Ok(());
        };

        let ptr = NonNull::from(event);
        if let Some(idx) = list.events.iter().position(|&e| e == ptr) {
            list.events.remove(idx);
        }

        let old = list.interest;
        let new = list.events.iter().fold(Interest::empty(), |acc, e| {
            // Safety: every linked event outlives its link.
            acc | unsafe { e.as_ref() }.fd().map_or(Interest::empty(), |(_, i)| i)
        });
        list.interest = new;
        if list.events.is_empty() {
            self.lists.remove(&fd);
        }

        if new != old {
            test_trace!(fd, ?old, ?new, "poller interest narrowed");
            self.backend.set(fd, new)?;
        }
        Ok(())
    }

    /// Returns the aggregate interest registered for `fd`.
    #[cfg(test)]
    pub(crate) fn interest(&self, fd: RawFd) -> Interest {
        self.lists
            .get(&fd)
            .map_or(Interest::empty(), |list| list.interest)
    }

    /// Returns the events waiting on `fd`, most recently scheduled first.
    pub(crate) fn events_for(&self, fd: RawFd) -> impl Iterator<Item = &Event> + '_ {
        self.lists
            .get(&fd)
            .into_iter()
            .flat_map(|list| list.events.iter())
            // Safety: events unlink themselves before they are dropped.
            .map(|e| unsafe { e.as_ref() })
    }

    pub(crate) fn wait(&mut self, events: &mut Vec<PollEvent>, deadline: Deadline) -> io::Result<()> {
        events.clear();
        self.backend.wait(events, deadline)
    }

    /// Returns the number of descriptors with at least one waiting event.
    pub(crate) fn descriptors(&self) -> usize {
        self.lists.len()
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &self.backend)
            .field("descriptors", &self.descriptors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{slot::SlotPtr, util::trace_init};
    use std::{cell::RefCell, rc::Rc};

    #[derive(Debug, Default)]
    struct Mock {
        calls: Rc<RefCell<Vec<(RawFd, Interest)>>>,
        fail: Rc<RefCell<bool>>,
    }

    impl Backend for Mock {
        fn set(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            if *self.fail.borrow() {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            self.calls.borrow_mut().push((fd, interest));
            Ok(())
        }

        fn wait(&mut self, _: &mut Vec<PollEvent>, _: Deadline) -> io::Result<()> {
            Ok(())
        }
    }

    fn io_event(id: u64, fd: RawFd, interest: Interest) -> Event {
        Event::io(SlotPtr::dangling(), id, fd, interest, Deadline::Never)
    }

    #[test]
    fn interest_is_the_union() {
        trace_init();
        let mock = Mock::default();
        let calls = mock.calls.clone();
        let mut poller = Poller::new(Box::new(mock));

        let read = io_event(1, 7, Interest::READ);
        let write = io_event(2, 7, Interest::WRITE);
        let read2 = io_event(3, 7, Interest::READ);

        poller.schedule(&read).unwrap();
        poller.schedule(&write).unwrap();
        poller.schedule(&read2).unwrap();
        assert_eq!(poller.interest(7), Interest::READ | Interest::WRITE);
        assert_eq!(poller.events_for(7).map(Event::id).collect::<Vec<_>>(), vec![3, 2, 1]);

        // a second reader does not change the mask.
        assert_eq!(
            *calls.borrow(),
            vec![(7, Interest::READ), (7, Interest::READ | Interest::WRITE)]
        );

        poller.remove(&read).unwrap();
        assert_eq!(poller.interest(7), Interest::READ | Interest::WRITE);

        poller.remove(&write).unwrap();
        assert_eq!(poller.interest(7), Interest::READ);

        poller.remove(&read2).unwrap();
        assert_eq!(poller.interest(7), Interest::empty());
        assert_eq!(poller.descriptors(), 0);

        assert_eq!(
            calls.borrow()[2..],
            [(7, Interest::READ), (7, Interest::empty())]
        );
    }

    #[test]
    fn failed_registration_is_undone() {
        trace_init();
        let mock = Mock::default();
        let fail = mock.fail.clone();
        let mut poller = Poller::new(Box::new(mock));

        *fail.borrow_mut() = true;
        let event = io_event(1, 3, Interest::READ);
        assert!(poller.schedule(&event).is_err());
        assert!(!event.polled.get());
        assert_eq!(poller.descriptors(), 0);

        // removing an event that never made it in is a no-op.
        poller.remove(&event).unwrap();
    }
}
