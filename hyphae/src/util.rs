#[cfg(not(test))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(test)]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(not(test))]
macro_rules! test_trace {
    ($($args:tt)+) => {};
}

#[cfg(test)]
macro_rules! test_trace {
    ($($args:tt)+) => {
        tracing::debug!(
            location = %core::panic::Location::caller(),
            $($args)+
        );
    };
}

pub(crate) mod fmt {
    pub(crate) use core::fmt::*;

    /// A wrapper type that formats the wrapped value using a provided function.
    pub(crate) struct FormatWith<T, F = fn(&T, &mut Formatter<'_>) -> Result>
    where
        F: Fn(&T, &mut Formatter<'_>) -> Result,
    {
        value: T,
        fmt: F,
    }

    /// Format the provided value using its [`core::fmt::Pointer`]
    /// implementation, for recording slot and event addresses as `tracing`
    /// fields.
    #[inline]
    pub(crate) fn ptr<T: Pointer>(value: T) -> tracing::field::DebugValue<FormatWith<T>> {
        tracing::field::debug(FormatWith {
            value,
            fmt: Pointer::fmt,
        })
    }

    impl<T, F> Debug for FormatWith<T, F>
    where
        F: Fn(&T, &mut Formatter<'_>) -> Result,
    {
        #[inline]
        fn fmt(&self, f: &mut Formatter<'_>) -> Result {
            (self.fmt)(&self.value, f)
        }
    }
}

/// Rounds `n` up to the next multiple of `align`, which must be a power of
/// two.
#[inline]
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
pub(crate) fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 32), 32);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
