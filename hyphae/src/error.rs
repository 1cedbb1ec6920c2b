//! Errors returned by blocking coroutine operations.
use std::{fmt, io};

/// The errno reported when a waiting coroutine is rescheduled from outside
/// before its operation completed.
///
/// This value is outside the range of any platform's errno space, so it never
/// collides with an OS error.
pub const EWAKEDUP: i32 = 34567;

/// The error type for blocking coroutine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation's deadline passed before it completed.
    #[error("deadline elapsed")]
    TimedOut,

    /// The coroutine was cancelled before or while waiting.
    #[error("coroutine cancelled")]
    Cancelled,

    /// The coroutine was rescheduled externally before the operation
    /// completed.
    #[error("woken up before the operation completed")]
    WokenUp,

    /// The operating system reported an error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A `Result` whose error type defaults to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    /// Returns the C errno corresponding to this error.
    ///
    /// I/O errors that did not originate from the OS map to `EIO`.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Cancelled => libc::ECANCELED,
            Error::WokenUp => EWAKEDUP,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Converts a C errno into an `Error`.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ETIMEDOUT => Error::TimedOut,
            libc::ECANCELED => Error::Cancelled,
            EWAKEDUP => Error::WokenUp,
            errno => Error::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    /// Returns `true` if this is [`Error::TimedOut`].
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Returns `true` if this is [`Error::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::WokenUp => io::Error::new(io::ErrorKind::Interrupted, err),
        }
    }
}

/// The outcome of an I/O operation that may have partially completed.
///
/// A write that transfers some bytes before its deadline passes reports both
/// the bytes transferred and the error that stopped it.
#[must_use]
pub struct IoStatus {
    processed: usize,
    status: Result<()>,
}

impl IoStatus {
    pub(crate) fn success(processed: usize) -> Self {
        Self {
            processed,
            status: Ok(()),
        }
    }

    pub(crate) fn error(processed: usize, error: impl Into<Error>) -> Self {
        Self {
            processed,
            status: Err(error.into()),
        }
    }

    /// Returns the number of bytes transferred before the operation
    /// completed or failed.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Returns the error that stopped the operation, if any.
    #[must_use]
    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref().err()
    }

    /// Returns `true` if the operation completed without error.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Discards the byte count if the operation failed.
    pub fn into_result(self) -> Result<usize> {
        self.status.map(|()| self.processed)
    }

    /// Splits this status into the byte count and the error, if any.
    pub fn into_parts(self) -> (usize, Option<Error>) {
        (self.processed, self.status.err())
    }
}

impl fmt::Debug for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("IoStatus");
        s.field("processed", &self.processed);
        match &self.status {
            Ok(()) => s.field("status", &"ok"),
            Err(err) => s.field("status", err),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert!(Error::from_errno(libc::ETIMEDOUT).is_timed_out());
        assert!(Error::from_errno(libc::ECANCELED).is_cancelled());
        assert!(matches!(Error::from_errno(EWAKEDUP), Error::WokenUp));

        let err = Error::from_errno(libc::ECONNREFUSED);
        assert_eq!(err.errno(), libc::ECONNREFUSED);
        assert!(matches!(err, Error::Io(_)));

        assert_eq!(Error::WokenUp.errno(), EWAKEDUP);
        assert_eq!(Error::Io(io::Error::other("no errno")).errno(), libc::EIO);
    }

    #[test]
    fn partial_status_keeps_count() {
        let status = IoStatus::error(12, Error::TimedOut);
        assert_eq!(status.processed(), 12);
        assert!(!status.is_ok());
        assert!(matches!(status.into_result(), Err(Error::TimedOut)));

        let status = IoStatus::success(7);
        assert!(status.is_ok());
        assert_eq!(status.into_result().unwrap(), 7);
    }
}
