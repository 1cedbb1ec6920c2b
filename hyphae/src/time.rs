//! Absolute deadlines.
//!
//! Every blocking operation in this crate is bounded by an absolute
//! [`Deadline`] rather than a relative timeout, so an operation that has to be
//! retried (a write that completes in several pieces, an accept that loses a
//! race for a connection) keeps one consistent expiry across all of its
//! attempts. The `*_timeout` variants of the blocking operations convert their
//! [`Duration`] into a deadline once, up front, using [`Deadline::after`].
use std::time::{Duration, Instant};

/// An absolute point in time at which a wait expires.
///
/// Deadlines are totally ordered: [`Deadline::Immediate`] sorts before every
/// instant, and [`Deadline::Never`] sorts after every instant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// A deadline that has always already passed.
    ///
    /// A wait with this deadline expires on the executor's next pass over its
    /// wait queue. This is how [`Coroutine::yield_now`] moves a coroutine to
    /// the back of the line.
    ///
    /// [`Coroutine::yield_now`]: crate::Coroutine::yield_now
    Immediate,
    /// A deadline at a particular instant.
    At(Instant),
    /// A deadline that never passes.
    Never,
}

impl Deadline {
    /// Returns a deadline `timeout` from now.
    ///
    /// If adding `timeout` to the current instant would overflow, the
    /// deadline is [`Deadline::Never`].
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or(Deadline::Never, Deadline::At)
    }

    /// Returns `true` if this deadline is at or before `now`.
    ///
    /// A deadline exactly equal to `now` has elapsed.
    #[must_use]
    pub fn is_elapsed(&self, now: Instant) -> bool {
        match *self {
            Deadline::Immediate => true,
            Deadline::At(at) => at <= now,
            Deadline::Never => false,
        }
    }

    /// Returns the instant of this deadline, if it has one.
    #[must_use]
    pub fn instant(&self) -> Option<Instant> {
        match *self {
            Deadline::At(at) => Some(at),
            _ => None,
        }
    }

    /// Returns how long remains until this deadline, measured from `now`.
    ///
    /// Returns `None` for a deadline that never passes, and
    /// [`Duration::ZERO`] for one that already has.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match *self {
            Deadline::Immediate => Some(Duration::ZERO),
            Deadline::At(at) => Some(at.saturating_duration_since(now)),
            Deadline::Never => None,
        }
    }

    /// Returns the time remaining until this deadline as a whole number of
    /// milliseconds, rounded up, in the form the OS pollers expect: `-1`
    /// waits forever.
    ///
    /// Rounding up means a poll never returns before the deadline it was
    /// given, which would otherwise make the run loop spin on a timer that is
    /// about to expire.
    pub(crate) fn poll_timeout_ms(&self, now: Instant) -> i32 {
        match self.remaining(now) {
            None => -1,
            Some(remaining) => {
                let mut ms = remaining.as_millis();
                if remaining.subsec_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as i32
            }
        }
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Deadline::At(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        let now = Instant::now();
        let later = now + Duration::from_millis(5);

        assert!(Deadline::Immediate < Deadline::At(now));
        assert!(Deadline::At(now) < Deadline::At(later));
        assert!(Deadline::At(later) < Deadline::Never);
        assert!(Deadline::Immediate < Deadline::Never);
    }

    #[test]
    fn elapsed_includes_now() {
        let now = Instant::now();
        assert!(Deadline::At(now).is_elapsed(now));
        assert!(Deadline::Immediate.is_elapsed(now));
        assert!(!Deadline::Never.is_elapsed(now));
        assert!(!Deadline::At(now + Duration::from_secs(1)).is_elapsed(now));
    }

    #[test]
    fn after_overflow_never_expires() {
        assert_eq!(Deadline::after(Duration::MAX), Deadline::Never);
    }

    #[test]
    fn poll_timeout_rounds_up() {
        let now = Instant::now();
        let deadline = Deadline::At(now + Duration::from_micros(1500));
        assert_eq!(deadline.poll_timeout_ms(now), 2);

        let deadline = Deadline::At(now + Duration::from_millis(3));
        assert_eq!(deadline.poll_timeout_ms(now), 3);

        assert_eq!(Deadline::Immediate.poll_timeout_ms(now), 0);
        assert_eq!(Deadline::Never.poll_timeout_ms(now), -1);
        assert_eq!(Deadline::At(now).poll_timeout_ms(now + Duration::from_secs(1)), 0);
    }
}
