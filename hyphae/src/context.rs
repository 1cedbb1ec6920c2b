//! Execution contexts: a stack plus the saved registers needed to switch onto
//! and off of it.
//!
//! The actual stack switching is done by the `generator` crate. A context is a
//! generator that never yields a value; the scheduler drives it with
//! [`Context::resume`], and the code running on it gives control back with
//! [`Switch::suspend`].
//!
//! A context owns its stack for as long as it lives. Once the code running on
//! it returns, [`Context::start`] re-arms the same generator with a new entry
//! point, so a slot maps its stack once and reuses it for every coroutine
//! constructed in it.
//!
//! The generator's yield handle lives on the context's own stack and is only
//! reachable from inside the generator's closure. Coroutine code deep in a
//! call stack has no way to name it, so the entry closure publishes a pointer
//! to a suspend function through the [`Switch`] record that sits alongside the
//! context in its slot.
use core::{cell::Cell, fmt, mem::ManuallyDrop, ptr::NonNull};
use generator::{Gn, LocalGenerator};

pub(crate) struct Context {
    gen: ManuallyDrop<LocalGenerator<'static, (), ()>>,
    switch: NonNull<Switch>,
    stack_size: usize,
    state: State,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    /// No entry point; the stack is free.
    Idle,
    /// An entry point is set but has not run yet.
    Armed,
    /// The entry point has started and not yet returned.
    Running,
}

/// The coroutine-side half of a context switch.
pub(crate) struct Switch {
    suspend: Cell<Option<NonNull<dyn FnMut()>>>,
}

impl Context {
    /// Creates a new idle context with a stack of `stack_size` bytes.
    ///
    /// # Safety
    ///
    /// `switch` must remain valid for as long as the context exists.
    pub(crate) unsafe fn new(stack_size: usize, switch: NonNull<Switch>) -> Self {
        let words = stack_size / core::mem::size_of::<usize>();
        // the placeholder body is replaced by `start` before it can run.
        let gen = Gn::<()>::new_scoped_opt_local(words, |_| ());
        Self {
            gen: ManuallyDrop::new(gen),
            switch,
            stack_size,
            state: State::Idle,
        }
    }

    /// Arms this context to run `entry` on its stack the next time it is
    /// resumed.
    ///
    /// # Panics
    ///
    /// If code is still running on the context.
    pub(crate) fn start(&mut self, entry: impl FnOnce() + 'static) {
        assert_eq!(
            self.state,
            State::Idle,
            "started a context that is already in use"
        );
        let switch = self.switch;
        self.gen.scoped_init(move |mut scope| {
            let mut yield_to_scheduler = || scope.yield_with(());
            // Safety: whoever created the context guarantees the switch
            // record outlives it, and the pointer is cleared before this frame
            // returns.
            unsafe {
                let switch = switch.as_ref();
                switch.suspend.set(Some(erase(&mut yield_to_scheduler)));
                entry();
                switch.suspend.set(None);
            }
        });
        self.state = State::Armed;
    }

    /// Switches onto this context until it suspends or returns.
    ///
    /// Returns `true` if the entry point has run to completion, after which
    /// the context is idle again.
    ///
    /// # Panics
    ///
    /// If the context is idle.
    pub(crate) fn resume(&mut self) -> bool {
        assert_ne!(self.state, State::Idle, "resumed an idle context");
        self.state = State::Running;
        self.gen.resume();
        let done = self.gen.is_done();
        if done {
            self.state = State::Idle;
        }
        done
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Dropping a running generator unwinds its stack by resuming it with
        // a panic, which would run arbitrary coroutine code from inside a
        // destructor. A running context is only ever dropped when coroutines
        // are leaked, so leak its stack along with them.
        if self.state != State::Running {
            // Safety: `gen` is never touched again.
            unsafe { ManuallyDrop::drop(&mut self.gen) }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("state", &self.state)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Switch {
    pub(crate) const fn new() -> Self {
        Self {
            suspend: Cell::new(None),
        }
    }

    /// Suspends the calling context, returning control to whoever resumed it.
    ///
    /// # Panics
    ///
    /// If called from outside the context this switch record belongs to.
    pub(crate) fn suspend(&self) {
        let mut suspend = self
            .suspend
            .get()
            .expect("switched to the scheduler from outside a running coroutine");
        // Safety: the pointer is only set while the entry frame that owns the
        // closure is live, and only that context's code calls this.
        unsafe { suspend.as_mut()() }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.suspend.get().is_some()
    }
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Erases the lifetime of a suspend closure so it can be stored in a
/// [`Switch`].
unsafe fn erase<'a>(f: &'a mut (dyn FnMut() + 'a)) -> NonNull<dyn FnMut()> {
    let ptr: *mut (dyn FnMut() + 'a) = f;
    NonNull::new_unchecked(core::mem::transmute::<
        *mut (dyn FnMut() + 'a),
        *mut (dyn FnMut() + 'static),
    >(ptr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn suspend_and_resume() {
        let switch = Box::new(Switch::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let switch_ptr = NonNull::from(&*switch);
        let mut context = unsafe { Context::new(64 * 1024, switch_ptr) };
        assert!(context.is_idle());

        {
            let log = log.clone();
            context.start(move || {
                log.borrow_mut().push(1);
                unsafe { switch_ptr.as_ref() }.suspend();
                log.borrow_mut().push(2);
            });
        }

        assert!(!switch.is_armed());
        assert!(!context.resume());
        assert!(switch.is_armed());
        assert_eq!(*log.borrow(), vec![1]);

        assert!(context.resume());
        assert!(context.is_idle());
        assert!(!switch.is_armed());
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn restarts_on_the_same_stack() {
        let switch = Box::new(Switch::new());
        let switch_ptr = NonNull::from(&*switch);
        let mut context = unsafe { Context::new(64 * 1024, switch_ptr) };
        let frames = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..3 {
            let frames = frames.clone();
            context.start(move || {
                let local = 0u8;
                frames
                    .borrow_mut()
                    .push(core::ptr::addr_of!(local) as usize);
                unsafe { switch_ptr.as_ref() }.suspend();
            });
            assert!(!context.resume());
            // allocate something stack-sized between generations, so a
            // freshly mapped stack would land somewhere else.
            let _filler = vec![0u8; 300 * 1024];
            assert!(context.resume());
        }

        let frames = frames.borrow();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|&frame| frame == frames[0]), "{frames:x?}");
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn start_while_running() {
        let switch = Box::new(Switch::new());
        let switch_ptr = NonNull::from(&*switch);
        let mut context = unsafe { Context::new(64 * 1024, switch_ptr) };
        context.start(move || unsafe { switch_ptr.as_ref() }.suspend());
        assert!(!context.resume());
        context.start(|| {});
    }
}
