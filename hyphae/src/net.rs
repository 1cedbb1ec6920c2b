//! TCP conveniences built on the blocking coroutine operations.
use crate::{
    coroutine::Coroutine,
    error::{Error, Result},
    sys,
    time::Deadline,
};
use std::{
    io,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    os::unix::io::{AsRawFd, RawFd},
};

/// Opens a TCP connection to the first of `addrs` that accepts one.
///
/// Each address is tried in turn until one connects, the deadline passes,
/// or the coroutine is cancelled. If every address fails, the last error is
/// returned.
///
/// Name resolution is done with [`ToSocketAddrs`], which blocks the whole
/// executor while it runs; pass already-resolved addresses where that
/// matters.
pub fn connect_to(co: &Coroutine, addrs: impl ToSocketAddrs, deadline: Deadline) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs.to_socket_addrs()? {
        let socket = sys::socket_for(&addr)?;
        match co.connect_until(socket.as_raw_fd(), &addr, deadline) {
            Ok(()) => return Ok(TcpStream::from(socket)),
            Err(error @ (Error::TimedOut | Error::Cancelled)) => return Err(error),
            Err(error) => {
                tracing::debug!(%addr, %error, "connect failed; trying next address");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to").into()
    }))
}

/// Binds a non-blocking TCP listener, ready for [`Coroutine::accept`].
pub fn listen(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Puts a descriptor into non-blocking mode, as every descriptor passed to a
/// blocking coroutine operation must be.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    sys::set_nonblocking(fd)
}

/// Peeks at the next byte on a socket without consuming it or blocking.
///
/// Returns `Ok(0)` if the peer closed the connection.
pub fn msg_peek(fd: RawFd) -> io::Result<usize> {
    sys::msg_peek(fd)
}

/// Returns `true` if the peer has not closed its end of the connection.
///
/// Useful for checking a kept-alive connection before reusing it.
pub fn socket_not_closed_by_other_side(fd: RawFd) -> bool {
    match msg_peek(fd) {
        Ok(n) => n > 0,
        Err(err) => is_blocked(&err),
    }
}

/// Returns `true` if there is data waiting to be read.
pub fn has_pending_data(fd: RawFd) -> bool {
    matches!(msg_peek(fd), Ok(n) if n > 0)
}

/// Returns `true` if `err` means the operation would have blocked.
pub fn is_blocked(err: &io::Error) -> bool {
    sys::is_would_block(err)
}
