use super::{Core, Executor};
use crate::{
    poller::{self, Backend, Poller},
    slot::{StackLayout, DEFAULT_STACK_SIZE},
};
use std::io;

/// Configures an [`Executor`] before creating it.
///
/// ```
/// use hyphae::Executor;
///
/// let executor = Executor::builder()
///     .stack_size(64 * 1024)
///     .fail_on_error(true)
///     .build()
///     .expect("failed to create executor");
/// assert_eq!(executor.stack_layout().effective_stack_len(), 64 * 1024);
/// ```
#[derive(Debug)]
#[must_use]
pub struct Builder {
    stack_size: usize,
    fail_on_error: bool,
    backend: Option<Box<dyn Backend>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            fail_on_error: false,
            backend: None,
        }
    }

    /// Sets the stack size of each coroutine, in bytes.
    ///
    /// The size is rounded up to the stack alignment. By default, coroutines
    /// get [`DEFAULT_STACK_SIZE`] bytes of stack.
    pub fn stack_size(self, bytes: usize) -> Self {
        Self {
            stack_size: bytes,
            ..self
        }
    }

    /// Sets whether errors bring down the run loop.
    ///
    /// When enabled, a panic in any coroutine is resumed out of
    /// [`Executor::run`], and a failure of the OS poller panics. When
    /// disabled (the default), both are logged and the executor keeps going:
    /// a panicking coroutine simply finishes, waking anything joining it.
    pub fn fail_on_error(self, fail: bool) -> Self {
        Self {
            fail_on_error: fail,
            ..self
        }
    }

    /// Uses `backend` to wait for descriptor readiness, instead of the
    /// platform default.
    pub fn backend(self, backend: impl Backend + 'static) -> Self {
        Self {
            backend: Some(Box::new(backend)),
            ..self
        }
    }

    /// Creates the executor.
    ///
    /// # Errors
    ///
    /// If no backend was provided and the platform's default backend could
    /// not be created.
    pub fn build(self) -> io::Result<Executor> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => poller::default_for_platform()?,
        };
        let layout = StackLayout::new(self.stack_size);
        tracing::debug!(
            stack_size = layout.effective_stack_len(),
            overhead = StackLayout::overhead(),
            fail_on_error = self.fail_on_error,
            ?backend,
            "executor created",
        );

        Ok(Executor {
            core: Core::new(Poller::new(backend), layout, self.fail_on_error),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
