mod util;

use hyphae::{interrupt::Interruptible, net, Deadline, Error, Interest};
use std::{
    cell::RefCell,
    io::{IoSlice, IoSliceMut, Write},
    os::unix::{io::AsRawFd, net::UnixStream},
    rc::Rc,
    time::Duration,
};

fn nonblocking_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().expect("failed to create socket pair");
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn echo_over_loopback() {
    util::trace_init();
    let executor = util::executor();
    let listener = net::listen("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let echoed = Rc::new(RefCell::new(Vec::new()));

    let server = executor.spawn("server", move |co| {
        let (conn, peer) = co
            .accept_timeout(listener.as_raw_fd(), Duration::from_secs(5))
            .expect("accept failed");
        assert!(peer.ip().is_loopback());

        let mut buf = [0u8; 64];
        let n = co
            .read_timeout(conn.as_raw_fd(), &mut buf, Duration::from_secs(5))
            .into_result()
            .expect("server read failed");
        let status = co.write(conn.as_raw_fd(), &buf[..n]);
        assert!(status.is_ok(), "{status:?}");
        assert_eq!(status.processed(), n);
    });
    {
        let echoed = echoed.clone();
        executor.spawn("client", move |co| {
            let stream = net::connect_to(co, addr, Deadline::after(Duration::from_secs(5)))
                .expect("connect failed");
            assert!(co.write(stream.as_raw_fd(), b"ping").is_ok());

            let mut buf = [0u8; 64];
            let n = co
                .read_timeout(stream.as_raw_fd(), &mut buf, Duration::from_secs(5))
                .into_result()
                .expect("client read failed");
            echoed.borrow_mut().extend_from_slice(&buf[..n]);
            assert!(co.join(&server));
        });
    }

    executor.run();
    assert_eq!(&echoed.borrow()[..], b"ping");
    assert_eq!(executor.allocated(), 0);
}

#[test]
fn connect_to_a_closed_port_fails() {
    util::trace_init();
    let executor = util::executor();
    let addr = {
        let listener = net::listen("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    executor.execute(move |co| {
        let res = net::connect_to(co, addr, Deadline::after(Duration::from_secs(5)));
        assert!(matches!(res, Err(Error::Io(_))), "{res:?}");
    });
}

#[test]
fn accept_times_out() {
    util::trace_init();
    let executor = util::executor();
    let listener = net::listen("127.0.0.1:0").unwrap();

    executor.execute(move |co| {
        let res = co.accept_timeout(listener.as_raw_fd(), Duration::from_millis(10));
        assert!(matches!(res, Err(Error::TimedOut)), "{res:?}");
    });
}

#[test]
fn read_waits_for_data() {
    util::trace_init();
    let executor = util::executor();
    let (reader, writer) = nonblocking_pair();
    let read = Rc::new(RefCell::new(Vec::new()));

    {
        let read = read.clone();
        executor.spawn("reader", move |co| {
            let mut buf = [0u8; 16];
            let status = co.read(reader.as_raw_fd(), &mut buf);
            assert!(status.is_ok(), "{status:?}");
            read.borrow_mut().extend_from_slice(&buf[..status.processed()]);
        });
    }
    executor.spawn("writer", move |co| {
        let _ = co.sleep(Duration::from_millis(10));
        assert!(co.write(writer.as_raw_fd(), b"hello").is_ok());
    });

    executor.run();
    assert_eq!(&read.borrow()[..], b"hello");
}

#[test]
fn read_reports_eof() {
    util::trace_init();
    let executor = util::executor();
    let (reader, writer) = nonblocking_pair();
    drop(writer);

    executor.execute(move |co| {
        let mut buf = [0u8; 16];
        let status = co.read_timeout(reader.as_raw_fd(), &mut buf, Duration::from_secs(5));
        assert!(status.is_ok(), "{status:?}");
        assert_eq!(status.processed(), 0);
        assert!(!net::socket_not_closed_by_other_side(reader.as_raw_fd()));
    });
}

#[test]
fn vectored_io() {
    util::trace_init();
    let executor = util::executor();
    let (reader, writer) = nonblocking_pair();
    let read = Rc::new(RefCell::new((Vec::new(), Vec::new())));

    executor.spawn("writer", move |co| {
        let mut bufs = [
            IoSlice::new(b""),
            IoSlice::new(b"hello "),
            IoSlice::new(b""),
            IoSlice::new(b"world"),
        ];
        let status = co.write_vectored(writer.as_raw_fd(), &mut bufs);
        assert!(status.is_ok(), "{status:?}");
        assert_eq!(status.processed(), 11);
    });
    {
        let read = read.clone();
        executor.spawn("reader", move |co| {
            let mut head = [0u8; 6];
            let mut tail = [0u8; 5];
            let mut bufs = [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)];
            let status = co.read_vectored_timeout(
                reader.as_raw_fd(),
                &mut bufs,
                Duration::from_secs(5),
            );
            assert_eq!(status.processed(), 11, "{status:?}");
            let mut read = read.borrow_mut();
            read.0.extend_from_slice(&head);
            read.1.extend_from_slice(&tail);
        });
    }

    executor.run();
    let read = read.borrow();
    assert_eq!(&read.0[..], b"hello ");
    assert_eq!(&read.1[..], b"world");
}

#[test]
fn write_timeout_reports_partial_progress() {
    util::trace_init();
    let executor = util::executor();
    // nobody reads from the other end, so the socket buffer fills up.
    let (writer, _reader) = nonblocking_pair();

    executor.execute(move |co| {
        let data = vec![0xA5u8; 16 * 1024 * 1024];
        let status = co.write_timeout(writer.as_raw_fd(), &data, Duration::from_millis(20));
        assert!(matches!(status.status(), Some(Error::TimedOut)), "{status:?}");
        assert!(status.processed() > 0);
        assert!(status.processed() < data.len());
    });
}

#[test]
fn select_returns_the_ready_descriptor() {
    util::trace_init();
    let executor = util::executor();
    let (idle, _idle_peer) = nonblocking_pair();
    let (busy, busy_peer) = nonblocking_pair();
    let busy_fd = busy.as_raw_fd();
    let selected = Rc::new(RefCell::new(None));

    {
        let selected = selected.clone();
        let fds = [(idle.as_raw_fd(), Interest::READ), (busy.as_raw_fd(), Interest::READ)];
        executor.spawn("selector", move |co| {
            assert!(matches!(co.select(&[]), Ok(None)));
            *selected.borrow_mut() = Some(co.select_timeout(&fds, Duration::from_secs(5)));
            assert!(net::has_pending_data(busy.as_raw_fd()));
            drop(idle);
        });
    }
    executor.spawn("writer", move |co| {
        co.yield_now();
        (&busy_peer).write_all(b"!").unwrap();
    });

    executor.run();
    match selected.borrow_mut().take() {
        Some(Ok(Some(fd))) => assert_eq!(fd, busy_fd),
        other => panic!("unexpected select result: {other:?}"),
    };
}

#[test]
fn select_times_out() {
    util::trace_init();
    let executor = util::executor();
    let (a, _a_peer) = nonblocking_pair();
    let (b, _b_peer) = nonblocking_pair();

    executor.execute(move |co| {
        let fds = [(a.as_raw_fd(), Interest::READ), (b.as_raw_fd(), Interest::READ)];
        let res = co.select_timeout(&fds, Duration::from_millis(10));
        assert!(matches!(res, Err(Error::TimedOut)), "{res:?}");
    });
}

#[test]
fn interrupt_wakes_a_poll() {
    util::trace_init();
    let executor = util::executor();
    let (sock, _peer) = nonblocking_pair();
    let results = Rc::new(RefCell::new(Vec::new()));

    {
        let results = results.clone();
        executor.execute(move |co| {
            let signal = Rc::new(Interruptible::new(co));
            let remote = signal.clone();
            co.spawn("interrupter", move |co| {
                co.yield_now();
                remote.interrupt();
                // a second interrupt is a no-op.
                remote.interrupt();
            });

            let fd = sock.as_raw_fd();
            results
                .borrow_mut()
                .push(signal.wait(|| co.poll(fd, Interest::READ)));
            assert!(signal.interrupted());
            assert!(!co.is_cancelled());

            // once fired, the signal fails every later wait without blocking.
            results
                .borrow_mut()
                .push(signal.wait(|| co.poll(fd, Interest::READ)));
        });
    }

    let results = results.borrow();
    assert_eq!(results.len(), 2);
    for res in results.iter() {
        assert!(matches!(res, Err(Error::WokenUp)), "{res:?}");
    }
}

#[test]
fn interrupt_keeps_partial_write_progress() {
    util::trace_init();
    let executor = util::executor();
    // nobody reads from the other end, so the write blocks once the socket
    // buffer is full.
    let (writer, _reader) = nonblocking_pair();

    executor.execute(move |co| {
        let signal = Rc::new(Interruptible::new(co));
        let remote = signal.clone();
        co.spawn("interrupter", move |co| {
            co.yield_now();
            remote.interrupt();
        });

        let data = vec![0x5Au8; 16 * 1024 * 1024];
        let status = signal.wait_io(|| co.write(writer.as_raw_fd(), &data));
        assert!(matches!(status.status(), Some(Error::WokenUp)), "{status:?}");
        assert!(status.processed() > 0);
        assert!(status.processed() < data.len());

        let status = signal.wait_io(|| co.write(writer.as_raw_fd(), b"!"));
        assert!(matches!(status.status(), Some(Error::WokenUp)), "{status:?}");
        assert_eq!(status.processed(), 0);
    });
}
