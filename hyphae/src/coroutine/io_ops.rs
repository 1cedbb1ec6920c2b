//! Blocking socket operations.
//!
//! Each operation first tries the non-blocking syscall, and only suspends
//! (in a descriptor wait) if the syscall would block. Operations that can
//! complete partially return an [`IoStatus`].
use super::Coroutine;
use crate::{
    error::{IoStatus, Result},
    poller::Interest,
    sys,
    time::Deadline,
};
use std::{
    io::{self, IoSlice, IoSliceMut},
    net::{SocketAddr, TcpStream},
    os::unix::io::RawFd,
    time::Duration,
};

impl Coroutine {
    /// Reads once from `fd` into `buf`, waiting until `fd` is readable if
    /// necessary.
    ///
    /// A read that returns zero bytes means end of file.
    pub fn read_until(&self, fd: RawFd, buf: &mut [u8], deadline: Deadline) -> IoStatus {
        loop {
            match sys::read(fd, buf) {
                Ok(n) => return IoStatus::success(n),
                Err(err) if sys::is_would_block(&err) => {}
                Err(err) => return IoStatus::error(0, err),
            }
            if let Err(err) = self.poll_until(fd, Interest::READ, deadline) {
                return IoStatus::error(0, err);
            }
        }
    }

    pub fn read_timeout(&self, fd: RawFd, buf: &mut [u8], timeout: Duration) -> IoStatus {
        self.read_until(fd, buf, Deadline::after(timeout))
    }

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> IoStatus {
        self.read_until(fd, buf, Deadline::Never)
    }

    /// Like [`read_until`](Self::read_until), but scatters into several
    /// buffers.
    pub fn read_vectored_until(
        &self,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        deadline: Deadline,
    ) -> IoStatus {
        loop {
            match sys::readv(fd, bufs) {
                Ok(n) => return IoStatus::success(n),
                Err(err) if sys::is_would_block(&err) => {}
                Err(err) => return IoStatus::error(0, err),
            }
            if let Err(err) = self.poll_until(fd, Interest::READ, deadline) {
                return IoStatus::error(0, err);
            }
        }
    }

    pub fn read_vectored_timeout(
        &self,
        fd: RawFd,
        bufs: &mut [IoSliceMut<'_>],
        timeout: Duration,
    ) -> IoStatus {
        self.read_vectored_until(fd, bufs, Deadline::after(timeout))
    }

    pub fn read_vectored(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> IoStatus {
        self.read_vectored_until(fd, bufs, Deadline::Never)
    }

    /// Writes all of `buf` to `fd`.
    ///
    /// If the deadline passes (or anything else stops the write) partway
    /// through, the returned status carries both the number of bytes written
    /// so far and the error.
    pub fn write_until(&self, fd: RawFd, buf: &[u8], deadline: Deadline) -> IoStatus {
        let mut written = 0;
        while written < buf.len() {
            match sys::write(fd, &buf[written..]) {
                Ok(0) => return IoStatus::error(written, io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    continue;
                }
                Err(err) if sys::is_would_block(&err) => {}
                Err(err) => return IoStatus::error(written, err),
            }
            if let Err(err) = self.poll_until(fd, Interest::WRITE, deadline) {
                return IoStatus::error(written, err);
            }
        }
        IoStatus::success(written)
    }

    pub fn write_timeout(&self, fd: RawFd, buf: &[u8], timeout: Duration) -> IoStatus {
        self.write_until(fd, buf, Deadline::after(timeout))
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> IoStatus {
        self.write_until(fd, buf, Deadline::Never)
    }

    /// Writes every buffer in `bufs` to `fd`, in order.
    ///
    /// `bufs` is advanced past whatever has been written, so on a partial
    /// write it holds exactly the data that is still outstanding.
    pub fn write_vectored_until(
        &self,
        fd: RawFd,
        mut bufs: &mut [IoSlice<'_>],
        deadline: Deadline,
    ) -> IoStatus {
        let mut written = 0;
        IoSlice::advance_slices(&mut bufs, 0);
        while !bufs.is_empty() {
            match sys::writev(fd, bufs) {
                Ok(0) => return IoStatus::error(written, io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    IoSlice::advance_slices(&mut bufs, n);
                    continue;
                }
                Err(err) if sys::is_would_block(&err) => {}
                Err(err) => return IoStatus::error(written, err),
            }
            if let Err(err) = self.poll_until(fd, Interest::WRITE, deadline) {
                return IoStatus::error(written, err);
            }
        }
        IoStatus::success(written)
    }

    pub fn write_vectored_timeout(
        &self,
        fd: RawFd,
        bufs: &mut [IoSlice<'_>],
        timeout: Duration,
    ) -> IoStatus {
        self.write_vectored_until(fd, bufs, Deadline::after(timeout))
    }

    pub fn write_vectored(&self, fd: RawFd, bufs: &mut [IoSlice<'_>]) -> IoStatus {
        self.write_vectored_until(fd, bufs, Deadline::Never)
    }

    /// Connects the socket `fd` to `addr`.
    pub fn connect_until(&self, fd: RawFd, addr: &SocketAddr, deadline: Deadline) -> Result<()> {
        match sys::connect(fd, addr) {
            Ok(()) => return Ok(()),
            Err(err) if sys::is_in_progress(&err) => {}
            Err(err) => return Err(err.into()),
        }

        self.poll_until(fd, Interest::WRITE, deadline)?;
        match sys::take_socket_error(fd)? {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }

    pub fn connect_timeout(&self, fd: RawFd, addr: &SocketAddr, timeout: Duration) -> Result<()> {
        self.connect_until(fd, addr, Deadline::after(timeout))
    }

    pub fn connect(&self, fd: RawFd, addr: &SocketAddr) -> Result<()> {
        self.connect_until(fd, addr, Deadline::Never)
    }

    /// Accepts a TCP connection on the listening socket `fd`.
    ///
    /// The accepted stream is already in non-blocking mode.
    pub fn accept_until(&self, fd: RawFd, deadline: Deadline) -> Result<(TcpStream, SocketAddr)> {
        loop {
            match sys::accept(fd) {
                Ok((conn, addr)) => {
                    tracing::trace!(fd, peer = %addr, "accepted");
                    return Ok((TcpStream::from(conn), addr));
                }
                Err(err) if sys::is_would_block(&err) => {}
                Err(err) => return Err(err.into()),
            }
            self.poll_until(fd, Interest::READ, deadline)?;
        }
    }

    pub fn accept_timeout(&self, fd: RawFd, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
        self.accept_until(fd, Deadline::after(timeout))
    }

    pub fn accept(&self, fd: RawFd) -> Result<(TcpStream, SocketAddr)> {
        self.accept_until(fd, Deadline::Never)
    }
}
