use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use hyphae::{Coroutine, Deadline, Error, Handle};
use std::{
    cell::{Cell, RefCell},
    net::{SocketAddr, TcpListener, TcpStream},
    os::unix::io::AsRawFd,
    rc::Rc,
    time::{Duration, Instant},
};

mod cli;

#[derive(Debug, Default)]
struct Summary {
    round_trips: Cell<usize>,
    failed_clients: Cell<usize>,
    errors: RefCell<Vec<color_eyre::Report>>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let opts = cli::Options::parse();
    opts.output.trace_init()?;
    tracing::debug!(?opts, "hyphae-echo configuration");

    let executor = opts.executor.build()?;
    let listener = hyphae::net::listen(opts.listen)
        .with_context(|| format!("failed to listen on {}", opts.listen))?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, clients = opts.clients, messages = opts.messages, "echoing");

    let clients = opts.clients;
    let summary = Rc::new(Summary::default());
    let started = Instant::now();
    {
        let summary = summary.clone();
        executor.execute(move |co| {
            let acceptor = co.spawn("acceptor", move |co| accept_loop(co, &listener));

            let clients: Vec<Handle> = (0..opts.clients)
                .map(|id| {
                    let summary = summary.clone();
                    let timeout = opts.timeout();
                    let (messages, size) = (opts.messages, opts.message_size);
                    co.spawn(format!("client-{id}"), move |co| {
                        match client(co, id, addr, messages, size, timeout) {
                            Ok(round_trips) => {
                                summary.round_trips.set(summary.round_trips.get() + round_trips);
                            }
                            Err(error) => {
                                tracing::warn!(client = id, %error, "client failed");
                                summary.failed_clients.set(summary.failed_clients.get() + 1);
                                summary.errors.borrow_mut().push(error);
                            }
                        }
                    })
                })
                .collect();

            for client in &clients {
                co.join(client);
            }

            // every client is done; shut the server down.
            acceptor.cancel();
            co.join(&acceptor);
        });
    }

    let stats = executor.stats();
    tracing::info!(
        round_trips = summary.round_trips.get(),
        failed_clients = summary.failed_clients.get(),
        elapsed = ?started.elapsed(),
        ticks = stats.ticks,
        switches = stats.switches,
        polls = stats.polls,
        spawned = stats.spawned,
        allocated = executor.allocated(),
        "done",
    );

    if let Some(error) = summary.errors.borrow_mut().pop() {
        return Err(error.wrap_err(format!(
            "{} of {clients} clients failed",
            summary.failed_clients.get(),
        )));
    }
    Ok(())
}

/// Accepts connections until cancelled, spawning an echo coroutine for each.
fn accept_loop(co: &Coroutine, listener: &TcpListener) {
    let mut connections = Vec::new();
    loop {
        match co.accept(listener.as_raw_fd()) {
            Ok((conn, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                connections.push(co.spawn(format!("echo-{peer}"), move |co| echo(co, conn, peer)));
                connections.retain(|conn: &Handle| !conn.is_finished());
            }
            Err(Error::Cancelled) => break,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                if co.sleep(Duration::from_millis(10)).is_err_and(|e| e.is_cancelled()) {
                    break;
                }
            }
        }
    }

    tracing::debug!(open = connections.len(), "acceptor shutting down");
    for conn in connections {
        conn.cancel();
    }
}

/// Writes back everything read from `conn` until the peer closes it.
fn echo(co: &Coroutine, conn: TcpStream, peer: SocketAddr) {
    let fd = conn.as_raw_fd();
    let mut buf = [0u8; 4096];
    let mut echoed = 0;
    loop {
        let n = match co.read(fd, &mut buf).into_result() {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                if !error.is_cancelled() {
                    tracing::warn!(%peer, %error, "read failed");
                }
                break;
            }
        };

        let status = co.write(fd, &buf[..n]);
        echoed += status.processed();
        if let Err(error) = status.into_result() {
            tracing::warn!(%peer, %error, "write failed");
            break;
        }
    }
    tracing::debug!(%peer, echoed, "connection closed");
}

/// Sends `messages` messages of `size` bytes, checking that each one comes
/// back unchanged. Returns the number of round trips completed.
fn client(
    co: &Coroutine,
    id: usize,
    addr: SocketAddr,
    messages: usize,
    size: usize,
    timeout: Duration,
) -> Result<usize> {
    let stream = hyphae::net::connect_to(co, addr, Deadline::after(timeout))
        .with_context(|| format!("client {id} failed to connect to {addr}"))?;
    let fd = stream.as_raw_fd();

    let mut reply = vec![0u8; size];
    for seq in 0..messages {
        let message: Vec<u8> = (0..size).map(|i| (id + seq + i) as u8).collect();
        co.write_timeout(fd, &message, timeout)
            .into_result()
            .with_context(|| format!("client {id} failed to send message {seq}"))?;

        let mut received = 0;
        while received < size {
            let n = co
                .read_timeout(fd, &mut reply[received..], timeout)
                .into_result()
                .with_context(|| format!("client {id} failed to receive message {seq}"))?;
            if n == 0 {
                return Err(eyre!("server closed the connection after {received} bytes"));
            }
            received += n;
        }

        if reply != message {
            return Err(eyre!("client {id} message {seq} came back garbled"));
        }
        tracing::trace!(client = id, seq, "round trip");
    }

    Ok(messages)
}
