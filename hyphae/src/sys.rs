//! Thin wrappers over the non-blocking socket syscalls.
//!
//! Everything here retries on `EINTR` and reports would-block as an
//! ordinary [`io::ErrorKind::WouldBlock`] error; deciding whether to wait and
//! retry is left to the coroutine layer.
use std::{
    io::{self, IoSlice, IoSliceMut},
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::unix::io::{FromRawFd, OwnedFd, RawFd},
};

/// The most buffers passed to a single `readv`/`writev`.
const MAX_IOV: usize = 1024;

fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn retry<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry(|| cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }))
}

pub(crate) fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let cnt = bufs.len().min(MAX_IOV) as libc::c_int;
    // `IoSliceMut` is ABI-compatible with `iovec` on unix.
    retry(|| cvt(unsafe { libc::readv(fd, bufs.as_ptr().cast(), cnt) }))
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry(|| cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }))
}

pub(crate) fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let cnt = bufs.len().min(MAX_IOV) as libc::c_int;
    retry(|| cvt(unsafe { libc::writev(fd, bufs.as_ptr().cast(), cnt) }))
}

/// Starts connecting `fd` to `addr`.
///
/// On a non-blocking socket this usually fails with `EINPROGRESS`.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_c(addr);
    let ret = unsafe { libc::connect(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // An interrupted connect keeps going in the background; it is
        // finished the same way as one that is in progress.
        if err.kind() == io::ErrorKind::Interrupted {
            return Err(io::Error::from_raw_os_error(libc::EINPROGRESS));
        }
        return Err(err);
    }
    Ok(())
}

pub(crate) fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Reads and clears the pending error on a socket (`SO_ERROR`).
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut errno: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut errno as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((errno != 0).then(|| io::Error::from_raw_os_error(errno)))
}

/// Accepts a connection, returning a non-blocking, close-on-exec socket.
pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let addr_ptr = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>();

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let conn = retry(|| {
        let ret = unsafe {
            libc::accept4(
                fd,
                addr_ptr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        cvt(ret as libc::ssize_t).map(|fd| unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    })?;

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let conn = {
        let conn = retry(|| {
            let ret = unsafe { libc::accept(fd, addr_ptr, &mut len) };
            cvt(ret as libc::ssize_t).map(|fd| unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
        })?;
        set_cloexec(std::os::unix::io::AsRawFd::as_raw_fd(&conn))?;
        set_nonblocking(std::os::unix::io::AsRawFd::as_raw_fd(&conn))?;
        conn
    };

    let addr = c_to_socket_addr(&storage)?;
    Ok((conn, addr))
}

/// Creates a non-blocking, close-on-exec TCP socket for `addr`'s family.
pub(crate) fn socket_for(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
        let fd = unsafe { libc::socket(family, ty, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        set_cloexec(std::os::unix::io::AsRawFd::as_raw_fd(&fd))?;
        set_nonblocking(std::os::unix::io::AsRawFd::as_raw_fd(&fd))?;
        Ok(fd)
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Peeks at one byte without consuming it.
///
/// Returns `Ok(0)` if the peer has closed its end of the connection.
pub(crate) fn msg_peek(fd: RawFd) -> io::Result<usize> {
    let mut byte = 0u8;
    retry(|| {
        cvt(unsafe {
            libc::recv(
                fd,
                (&mut byte as *mut u8).cast(),
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        })
    })
}

fn socket_addr_to_c(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(addr) => {
            // Safety: `sockaddr_storage` is large enough and suitably
            // aligned for every address type.
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(addr) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_addr.s6_addr = addr.ip().octets();
            sin6.sin6_flowinfo = addr.flowinfo();
            sin6.sin6_scope_id = addr.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn c_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family}"),
        )),
    }
}
