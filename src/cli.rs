use color_eyre::eyre::{Result, WrapErr};
use hyphae::Executor;
use std::{net::SocketAddr, time::Duration};

/// An echo server and a swarm of echo clients, all running as coroutines on
/// one thread.
#[derive(Debug, clap::Parser)]
#[clap(about, version)]
pub(crate) struct Options {
    /// The address for the echo server to listen on.
    #[clap(long, default_value = "127.0.0.1:0")]
    pub(crate) listen: SocketAddr,

    /// The number of client coroutines to run.
    #[clap(short, long, default_value_t = 8)]
    pub(crate) clients: usize,

    /// The number of messages each client sends.
    #[clap(short, long, default_value_t = 16)]
    pub(crate) messages: usize,

    /// The size of each message, in bytes.
    #[clap(long, default_value_t = 64)]
    pub(crate) message_size: usize,

    /// How long any one connect, read or write may take, in milliseconds.
    #[clap(long, default_value_t = 5_000)]
    timeout_ms: u64,

    #[clap(flatten)]
    pub(crate) executor: ExecutorOptions,

    #[clap(flatten)]
    pub(crate) output: OutputOptions,
}

/// Options that configure the executor.
#[derive(Debug, clap::Args)]
#[clap(next_help_heading = "EXECUTOR OPTIONS")]
pub(crate) struct ExecutorOptions {
    /// The stack size of each coroutine, in bytes.
    #[clap(long, env = "HYPHAE_STACK_SIZE", default_value_t = hyphae::slot::DEFAULT_STACK_SIZE)]
    stack_size: usize,

    /// Whether a panicking coroutine takes down the whole process, rather
    /// than being logged.
    #[clap(long, env = "HYPHAE_FAIL_ON_ERROR")]
    fail_on_error: bool,
}

/// Options that configure `hyphae-echo`'s output.
#[derive(Debug, clap::Args)]
#[clap(next_help_heading = "OUTPUT OPTIONS")]
pub(crate) struct OutputOptions {
    /// Configures logging.
    #[clap(short, long, env = "RUST_LOG", default_value = "hyphae_echo=info,warn")]
    log: String,
}

// === impl Options ===

impl Options {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// === impl ExecutorOptions ===

impl ExecutorOptions {
    pub(crate) fn build(&self) -> Result<Executor> {
        Executor::builder()
            .stack_size(self.stack_size)
            .fail_on_error(self.fail_on_error)
            .build()
            .context("failed to create the executor")
    }
}

// === impl OutputOptions ===

impl OutputOptions {
    pub(crate) fn trace_init(&self) -> Result<()> {
        use tracing_subscriber::prelude::*;
        let filter = self
            .log
            .parse::<tracing_subscriber::EnvFilter>()
            .with_context(|| format!("invalid log filter {:?}", self.log))?;
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()?;
        Ok(())
    }
}
