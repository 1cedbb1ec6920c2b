//! Recyclable coroutine storage.
//!
//! Each coroutine lives in a [`Slot`]: a single heap allocation holding its
//! metadata, its execution context and the switch record the context uses to
//! suspend itself. Slots outlive the coroutines in them. When a coroutine
//! finishes, its slot is torn down in place and returned to the
//! [`SlotPool`]'s free list, and the next spawn reuses it, stack and all.
use crate::{
    context::{Context, Switch},
    coroutine::Coroutine,
    util::align_up,
};
use core::{
    cell::{Cell, RefCell, UnsafeCell},
    fmt,
    ptr::NonNull,
};

/// The alignment of a coroutine stack, in bytes.
pub const STACK_ALIGN: usize = 16;

/// The stack size given to coroutines when none is configured.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Computes how much memory a coroutine with a given stack size occupies.
///
/// The requested stack length is rounded up to twice [`STACK_ALIGN`]. On top of
/// that, every coroutine pays a fixed [`overhead`](Self::overhead) for its
/// slot header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StackLayout {
    stack_len: usize,
}

impl StackLayout {
    #[must_use]
    pub const fn new(requested: usize) -> Self {
        Self {
            stack_len: align_up(requested, 2 * STACK_ALIGN),
        }
    }

    /// The fixed per-coroutine cost of a slot, excluding the stack.
    #[must_use]
    pub const fn overhead() -> usize {
        align_up(core::mem::size_of::<Slot>(), 2 * STACK_ALIGN)
    }

    /// The total size of a coroutine: its stack plus the slot overhead.
    #[must_use]
    pub const fn to_allocate(&self) -> usize {
        self.stack_len + Self::overhead()
    }

    /// The usable stack length, after alignment.
    #[must_use]
    pub const fn effective_stack_len(&self) -> usize {
        self.to_allocate() - Self::overhead()
    }
}

impl Default for StackLayout {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

pub(crate) struct Slot {
    coroutine: UnsafeCell<Option<Coroutine>>,
    context: RefCell<Option<Context>>,
    switch: Switch,
    generation: Cell<u64>,
}

/// A pointer to a slot owned by a [`SlotPool`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SlotPtr(NonNull<Slot>);

pub(crate) struct SlotPool {
    free: Vec<SlotPtr>,
    all: Vec<SlotPtr>,
    allocated: usize,
}

// === impl Slot ===

impl Slot {
    fn new() -> Self {
        Self {
            coroutine: UnsafeCell::new(None),
            context: RefCell::new(None),
            switch: Switch::new(),
            generation: Cell::new(0),
        }
    }

    /// Builds a coroutine in this slot and arms the slot's execution context
    /// to run `entry` when first resumed.
    ///
    /// The context and its stack are created the first time the slot is
    /// used, and reused by every later coroutine constructed in it.
    ///
    /// # Panics
    ///
    /// If the slot is already occupied.
    pub(crate) fn construct(
        &self,
        coroutine: Coroutine,
        layout: StackLayout,
        entry: impl FnOnce() + 'static,
    ) {
        assert!(
            self.coroutine().is_none(),
            "constructed a coroutine in an occupied slot"
        );
        self.generation.set(self.generation.get().wrapping_add(1));
        // Safety: the slot is empty, so nothing holds a reference into it.
        unsafe {
            *self.coroutine.get() = Some(coroutine);
        }

        let mut context = self.context.borrow_mut();
        let stack_size = layout.effective_stack_len();
        if context.as_ref().map(Context::stack_size) != Some(stack_size) {
            // Safety: the switch record lives as long as the slot, which
            // outlives the context stored in it.
            *context = Some(unsafe { Context::new(stack_size, NonNull::from(&self.switch)) });
            test_trace!(slot = crate::util::fmt::ptr(self), stack_size, "new stack");
        }
        if let Some(context) = context.as_mut() {
            context.start(entry);
        }
    }

    /// Tears down the coroutine in this slot, keeping the allocation and the
    /// stack.
    pub(crate) fn destruct(&self) {
        debug_assert!(
            self.context.borrow().as_ref().map_or(true, Context::is_idle),
            "destructed a coroutine that has not finished"
        );
        // Safety: the coroutine has finished, so no code running on its
        // stack holds a reference to it.
        let coroutine = unsafe { (*self.coroutine.get()).take() };
        drop(coroutine);
    }

    /// Switches onto this slot's context. Returns `true` once it finishes.
    ///
    /// # Panics
    ///
    /// If the slot is empty.
    pub(crate) fn resume(&self) -> bool {
        let mut context = self.context.borrow_mut();
        let context = context
            .as_mut()
            .expect("resumed a slot with no coroutine in it");
        context.resume()
    }

    pub(crate) fn coroutine(&self) -> Option<&Coroutine> {
        // Safety: the coroutine is only replaced by `construct` and
        // `destruct`, neither of which runs while it is borrowed.
        unsafe { (*self.coroutine.get()).as_ref() }
    }

    pub(crate) fn switch(&self) -> &Switch {
        &self.switch
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }
}

// === impl SlotPtr ===

impl SlotPtr {
    /// # Safety
    ///
    /// The slot must not have been freed. Slots are only freed when their pool
    /// is dropped.
    pub(crate) unsafe fn as_ref<'a>(self) -> &'a Slot {
        self.0.as_ref()
    }

    /// Returns a pointer that never refers to a live slot, for tests that
    /// need an owner but never wake it.
    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        Self(NonNull::dangling())
    }
}

impl fmt::Debug for SlotPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SlotPtr").field(&self.0).finish()
    }
}

// === impl SlotPool ===

impl SlotPool {
    pub(crate) const fn new() -> Self {
        Self {
            free: Vec::new(),
            all: Vec::new(),
            allocated: 0,
        }
    }

    /// Takes a slot from the free list, or allocates a new one if it is
    /// empty.
    pub(crate) fn allocate(&mut self) -> SlotPtr {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = SlotPtr(NonNull::from(Box::leak(Box::new(Slot::new()))));
                self.all.push(slot);
                test_trace!(slot = ?slot, total = self.all.len(), "new slot");
                slot
            }
        };
        self.allocated += 1;
        slot
    }

    /// Returns an empty slot to the free list.
    pub(crate) fn release(&mut self, slot: SlotPtr) {
        debug_assert!(
            unsafe { slot.as_ref() }.coroutine().is_none(),
            "released a slot that still holds a coroutine"
        );
        debug_assert!(self.allocated > 0);
        self.allocated -= 1;
        self.free.push(slot);
    }

    /// Returns the number of slots currently holding a coroutine.
    pub(crate) fn allocated(&self) -> usize {
        self.allocated
    }

    /// Returns the number of slots ever allocated by this pool.
    pub(crate) fn capacity(&self) -> usize {
        self.all.len()
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Whatever is still in the slots may be mid-switch; leak it.
            return;
        }

        assert_eq!(self.allocated, 0, "leaked coroutines: {}", self.allocated);

        for slot in self.all.drain(..) {
            // Safety: every slot was leaked from a `Box` in `allocate`, and
            // nothing references it once the pool is gone.
            drop(unsafe { Box::from_raw(slot.0.as_ptr()) });
        }
    }
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("allocated", &self.allocated)
            .field("free", &self.free.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
