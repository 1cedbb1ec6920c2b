use super::{Backend, Interest, PollEvent};
use crate::{sys, time::Deadline};
use std::{
    collections::HashSet,
    io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Instant,
};

const MAX_EVENTS: usize = 256;

/// A level-triggered `epoll(7)` backend.
#[derive(Debug)]
pub struct Epoll {
    epfd: OwnedFd,
    registered: HashSet<RawFd>,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // Safety: `epoll_create1` returned a fresh descriptor that nothing
            // else owns.
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            registered: HashSet::new(),
            buf: Vec::with_capacity(MAX_EVENTS),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut events = libc::EPOLLRDHUP as u32;
        if interest.contains(Interest::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if interest.contains(Interest::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Backend for Epoll {
    fn set(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            if self.registered.remove(&fd) {
                let ret = unsafe {
                    libc::epoll_ctl(
                        self.epfd.as_raw_fd(),
                        libc::EPOLL_CTL_DEL,
                        fd,
                        core::ptr::null_mut(),
                    )
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    // the descriptor may already have been closed.
                    if !matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) {
                        return Err(err);
                    }
                }
            }
            return Ok(());
        }

        if self.registered.contains(&fd) {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, interest) {
                // closing a descriptor drops it from the epoll set behind our
                // back; a new descriptor with the same number must be added.
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
                }
                res => res,
            }
        } else {
            self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
            self.registered.insert(fd);
            Ok(())
        }
    }

    fn wait(&mut self, events: &mut Vec<PollEvent>, deadline: Deadline) -> io::Result<()> {
        let timeout = deadline.poll_timeout_ms(Instant::now());
        self.buf.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // Safety: `epoll_wait` initialized the first `n` entries.
        unsafe { self.buf.set_len(n as usize) };

        for ev in &self.buf {
            let fd = ev.u64 as RawFd;
            let flags = ev.events;
            if flags & libc::EPOLLERR as u32 != 0 {
                let errno = sys::take_socket_error(fd)
                    .ok()
                    .flatten()
                    .and_then(|err| err.raw_os_error())
                    .unwrap_or(libc::EIO);
                events.push(PollEvent::error(fd, errno));
                continue;
            }

            let mut ready = Interest::empty();
            if flags & libc::EPOLLIN as u32 != 0 {
                ready |= Interest::READ;
            }
            if flags & libc::EPOLLOUT as u32 != 0 {
                ready |= Interest::WRITE;
            }
            if flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                ready |= Interest::READ | Interest::WRITE;
            }
            events.push(PollEvent::ready(fd, ready));
        }

        Ok(())
    }
}
