//! The deadline-ordered queue of pending events.
use crate::{
    event::{Event, Status},
    slot::SlotPtr,
    time::Deadline,
};
use core::ptr::NonNull;
use std::{collections::BTreeMap, time::Instant};

/// Every pending event, timer-only or descriptor-bound, ordered by deadline.
///
/// Events with equal deadlines are ordered by their id, which increases
/// monotonically, so they expire in the order they were registered.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    events: BTreeMap<Key, NonNull<Event>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    deadline: Deadline,
    id: u64,
}

impl Key {
    fn of(event: &Event) -> Self {
        Self {
            deadline: event.deadline(),
            id: event.id(),
        }
    }
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, event: &Event) {
        let prev = self.events.insert(Key::of(event), NonNull::from(event));
        debug_assert!(prev.is_none(), "event ids must be unique");
        event.queued.set(true);
    }

    /// Unlinks `event` if it is still queued.
    pub(crate) fn remove(&mut self, event: &Event) {
        if event.queued.replace(false) {
            self.events.remove(&Key::of(event));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns the earliest deadline of any pending event.
    #[cfg(test)]
    pub(crate) fn next_deadline(&self) -> Option<Deadline> {
        self.events.keys().next().map(|key| key.deadline)
    }

    /// Removes every event whose deadline is at or before `now`, marks it
    /// timed out, and passes it to `wake`.
    ///
    /// If the earliest event is still in the future, nothing is removed and
    /// its deadline is returned. Otherwise, `now` is returned.
    pub(crate) fn expire_due(&mut self, now: Instant, mut wake: impl FnMut(&Event)) -> Deadline {
        match self.events.first_key_value() {
            Some((key, _)) if !key.deadline.is_elapsed(now) => return key.deadline,
            None => return Deadline::At(now),
            Some(_) => {}
        }

        while let Some(entry) = self.events.first_entry() {
            if !entry.key().deadline.is_elapsed(now) {
                break;
            }
            let ptr = entry.remove();
            // Safety: events are unlinked from the queue before the frame
            // that owns them returns.
            let event = unsafe { ptr.as_ref() };
            event.queued.set(false);
            event.set_status(Status::TimedOut);
            test_trace!(event.id = event.id(), "expired");
            wake(event);
        }

        Deadline::At(now)
    }

    /// Returns the owner of every pending event, in deadline order.
    pub(crate) fn owners(&self) -> impl Iterator<Item = SlotPtr> + '_ {
        self.events.values().map(|ptr| {
            // Safety: see `expire_due`.
            unsafe { ptr.as_ref() }.owner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::trace_init;
    use proptest::prelude::*;
    use std::time::Duration;

    fn timer(id: u64, deadline: Deadline) -> Event {
        Event::timer(SlotPtr::dangling(), id, deadline)
    }

    fn drain(queue: &mut WaitQueue, now: Instant) -> Vec<u64> {
        let mut woken = Vec::new();
        queue.expire_due(now, |event| woken.push(event.id()));
        woken
    }

    #[test]
    fn equal_deadlines_expire_in_registration_order() {
        trace_init();
        let now = Instant::now();
        let events = [
            timer(3, Deadline::At(now)),
            timer(1, Deadline::At(now)),
            timer(2, Deadline::At(now)),
        ];

        let mut queue = WaitQueue::new();
        for event in &events {
            queue.register(event);
        }

        assert_eq!(drain(&mut queue, now), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert!(events.iter().all(|e| e.status() == Status::TimedOut));
        assert!(events.iter().all(|e| !e.queued.get()));
    }

    #[test]
    fn expiry_stops_at_first_future_deadline() {
        trace_init();
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        let events = [
            timer(1, Deadline::Immediate),
            timer(2, Deadline::At(now)),
            timer(3, Deadline::At(later)),
            timer(4, Deadline::Never),
        ];

        let mut queue = WaitQueue::new();
        for event in &events {
            queue.register(event);
        }

        assert_eq!(queue.next_deadline(), Some(Deadline::Immediate));
        let mut woken = Vec::new();
        let next = queue.expire_due(now, |event| woken.push(event.id()));
        assert_eq!(woken, vec![1, 2]);
        assert_eq!(next, Deadline::At(now));

        // nothing else is due, so the next deadline is returned instead.
        let next = queue.expire_due(now, |_| panic!("nothing should expire"));
        assert_eq!(next, Deadline::At(later));
        assert_eq!(events[2].status(), Status::InProgress);

        queue.remove(&events[2]);
        queue.remove(&events[3]);
        assert!(queue.is_empty());
        assert_eq!(queue.expire_due(now, |_| ()), Deadline::At(now));
    }

    #[test]
    fn remove_is_idempotent() {
        let event = timer(1, Deadline::Never);
        let mut queue = WaitQueue::new();
        queue.register(&event);
        assert_eq!(queue.len(), 1);

        queue.remove(&event);
        queue.remove(&event);
        assert!(queue.is_empty());
        assert!(!event.queued.get());
    }

    proptest! {
        #[test]
        fn expires_exactly_the_due_events_in_order(
            offsets in proptest::collection::vec(0u64..50, 1..64),
            cutoff in 0u64..50,
        ) {
            let base = Instant::now();
            let events: Vec<Event> = offsets
                .iter()
                .enumerate()
                .map(|(id, &ms)| timer(id as u64, Deadline::At(base + Duration::from_millis(ms))))
                .collect();

            let mut queue = WaitQueue::new();
            for event in &events {
                queue.register(event);
            }

            let now = base + Duration::from_millis(cutoff);
            let woken = drain(&mut queue, now);

            let mut expected: Vec<(u64, u64)> = offsets
                .iter()
                .enumerate()
                .filter(|(_, &ms)| ms <= cutoff)
                .map(|(id, &ms)| (ms, id as u64))
                .collect();
            expected.sort();
            let expected: Vec<u64> = expected.into_iter().map(|(_, id)| id).collect();

            prop_assert_eq!(&woken, &expected);
            prop_assert_eq!(queue.len(), events.len() - expected.len());
            if let Some(next) = queue.next_deadline() {
                prop_assert!(!next.is_elapsed(now));
            }

            for event in &events {
                queue.remove(event);
            }
            prop_assert!(queue.is_empty());
        }
    }
}
