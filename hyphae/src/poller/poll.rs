use super::{Backend, Interest, PollEvent};
use crate::time::Deadline;
use std::{collections::HashMap, io, os::unix::io::RawFd, time::Instant};

/// A portable `poll(2)` backend.
///
/// The whole descriptor set is passed to the kernel on every wait, so this
/// scales worse than [`Epoll`](super::Epoll) where that is available.
#[derive(Debug, Default)]
pub struct Poll {
    interests: HashMap<RawFd, Interest>,
    fds: Vec<libc::pollfd>,
}

impl Poll {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for Poll {
    fn set(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_empty() {
            self.interests.remove(&fd);
        } else {
            self.interests.insert(fd, interest);
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<PollEvent>, deadline: Deadline) -> io::Result<()> {
        self.fds.clear();
        self.fds
            .extend(self.interests.iter().map(|(&fd, &interest)| {
                let mut mask = 0;
                if interest.contains(Interest::READ) {
                    mask |= libc::POLLIN;
                }
                if interest.contains(Interest::WRITE) {
                    mask |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events: mask,
                    revents: 0,
                }
            }));

        let timeout = deadline.poll_timeout_ms(Instant::now());
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
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

        for pfd in self.fds.iter().filter(|pfd| pfd.revents != 0) {
            let revents = pfd.revents;
            if revents & libc::POLLNVAL != 0 {
                events.push(PollEvent::error(pfd.fd, libc::EBADF));
                continue;
            }
            if revents & libc::POLLERR != 0 {
                events.push(PollEvent::error(pfd.fd, libc::EIO));
                continue;
            }

            let mut ready = Interest::empty();
            if revents & libc::POLLIN != 0 {
                ready |= Interest::READ;
            }
            if revents & libc::POLLOUT != 0 {
                ready |= Interest::WRITE;
            }
            if revents & libc::POLLHUP != 0 {
                ready |= Interest::READ | Interest::WRITE;
            }
            events.push(PollEvent::ready(pfd.fd, ready));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::unix::io::AsRawFd, os::unix::net::UnixStream};

    #[test]
    fn reports_readable_socket() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poll = Poll::new();
        poll.set(b.as_raw_fd(), Interest::READ).unwrap();

        let mut events = Vec::new();
        poll.wait(&mut events, Deadline::Immediate).unwrap();
        assert!(events.is_empty());

        a.write_all(b"hi").unwrap();
        poll.wait(&mut events, Deadline::after(std::time::Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events, vec![PollEvent::ready(b.as_raw_fd(), Interest::READ)]);
    }
}
