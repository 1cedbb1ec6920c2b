use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// A unique identifier for a [coroutine].
///
/// An `Id` is an opaque object that uniquely identifies each coroutine
/// spawned during the lifetime of a program, on any executor. `Id`s are
/// guaranteed not to be reused, even when a coroutine finishes and its slot
/// is recycled for a new one. An `Id` can be retrieved from the
/// [`Coroutine::id`] and [`Handle::id`] methods.
///
/// [coroutine]: crate::coroutine
/// [`Coroutine::id`]: crate::Coroutine::id
/// [`Handle::id`]: crate::Handle::id
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        // a single counter is shared by every executor in the process, so ids
        // stay unique even across threads.
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Relaxed);

        debug_assert!(id > 0, "64-bit coroutine ID counter should not overflow!");
        Self(id)
    }

    #[must_use]
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Id(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let a = Id::next();
        let b = Id::next();
        assert!(b > a);
        assert_ne!(a, b);
        assert_eq!(format!("{a:?}"), format!("Id({})", a.as_u64()));
    }
}
