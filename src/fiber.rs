//! Fiber contexts and the suspension primitive.
//!
//! A fiber is a stackful execution context pinned to the core that created
//! it. `corosensei` provides the register save/restore; everything above
//! that — slot identity, wakeup predicates, scheduling — lives in the
//! dispatcher. Control always flows fiber -> dispatcher -> fiber; a fiber
//! never switches directly to another fiber.

use crate::id::FiberId;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;

/// The closure a fiber runs to completion.
pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Input delivered to a fiber's coroutine on each resume.
pub(crate) enum FiberInput {
    /// First resume: the entry closure plus a pointer back to the owning
    /// slot so the coroutine body can record its yielder.
    Start(Entry, *mut FiberSlot),
    /// Any subsequent resume.
    Resume,
}

pub(crate) enum FiberState {
    Yielded,
    Complete,
    Panic(Box<dyn std::any::Any + Send>),
}

/// The fiber currently executing on this worker thread, if any.
#[derive(Clone, Copy)]
pub(crate) struct Running {
    pub(crate) id: FiberId,
    pub(crate) slot: *mut FiberSlot,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<Running>> = const { Cell::new(None) };
}

/// The resident context of one scheduler slot.
///
/// The coroutine is recreated (with a fresh stack of the configured size)
/// each time the slot is reused for a new fiber; the slot itself, and the
/// identity attached to it, persist across generations.
pub(crate) struct FiberSlot {
    coroutine: Option<Coroutine<FiberInput, (), (), DefaultStack>>,

    /// Set by the coroutine body on first resume; valid while the fiber
    /// is live. Used by `dispatch()` to suspend from inside the fiber.
    yielder: *const Yielder<FiberInput, ()>,

    /// Entry closure parked here between spawn and first dispatch.
    pub(crate) pending: Option<Entry>,
}

impl FiberSlot {
    pub(crate) fn new(stack_size: usize) -> Self {
        let stack = DefaultStack::new(stack_size).expect("fiber stack allocation failed");
        let coroutine = Coroutine::with_stack(stack, move |yielder, input: FiberInput| {
            if let FiberInput::Start(entry, slot_ptr) = input {
                // SAFETY: slot_ptr is the boxed slot that owns this
                // coroutine; the dispatcher keeps the box alive and pinned
                // for as long as the fiber can run.
                unsafe {
                    (*slot_ptr).yielder = yielder as *const _;
                }
                entry();
            }
        });

        FiberSlot {
            coroutine: Some(coroutine),
            yielder: std::ptr::null(),
            pending: None,
        }
    }

    /// Resets the slot for a new fiber. Recreates the coroutine so the
    /// new inhabitant starts on a clean stack.
    pub(crate) fn reset(&mut self, stack_size: usize) {
        *self = FiberSlot::new(stack_size);
    }

    /// Runs the fiber until its next suspension point.
    pub(crate) fn resume(&mut self, id: FiberId, input: FiberInput) -> FiberState {
        let self_ptr = self as *mut FiberSlot;
        if let Some(coroutine) = self.coroutine.as_mut() {
            CURRENT_FIBER.set(Some(Running { id, slot: self_ptr }));

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                coroutine.resume(input)
            }));

            CURRENT_FIBER.set(None);

            match result {
                Ok(CoroutineResult::Yield(())) => FiberState::Yielded,
                Ok(CoroutineResult::Return(())) => FiberState::Complete,
                Err(payload) => FiberState::Panic(payload),
            }
        } else {
            FiberState::Complete
        }
    }
}

/// The single suspension primitive.
///
/// Swaps back to the dispatcher; returns when the dispatcher next selects
/// this fiber. The caller must have arranged its wakeup condition first
/// (wakeup cell, wait-queue membership) and must re-check that condition
/// on return: spurious wakes are permitted.
pub(crate) fn dispatch() {
    let running = CURRENT_FIBER
        .get()
        .expect("dispatch() called outside a fiber");
    // SAFETY: the slot pointer is valid while the fiber executes, and the
    // yielder was recorded before the entry closure got control.
    unsafe {
        let slot = &*running.slot;
        debug_assert!(!slot.yielder.is_null(), "fiber suspended before start");
        let yielder = &*slot.yielder;
        let _ = yielder.suspend(());
    }
}

/// Identity of the calling fiber, or `None` on a non-fiber thread.
pub(crate) fn running() -> Option<Running> {
    CURRENT_FIBER.get()
}

/// A pool of reusable slot boxes, one pool per core.
///
/// Boxing keeps the slot address stable across the take/resume/put-back
/// cycle in the dispatcher, which is what makes the yielder pointer safe.
pub(crate) struct FiberPool {
    pool: Vec<Box<FiberSlot>>,
    stack_size: usize,
}

impl FiberPool {
    pub(crate) fn new(stack_size: usize) -> Self {
        FiberPool {
            pool: Vec::new(),
            stack_size,
        }
    }

    pub(crate) fn get(&mut self) -> Box<FiberSlot> {
        if let Some(mut slot) = self.pool.pop() {
            slot.reset(self.stack_size);
            slot
        } else {
            Box::new(FiberSlot::new(self.stack_size))
        }
    }

    pub(crate) fn put(&mut self, slot: Box<FiberSlot>) {
        self.pool.push(slot);
    }
}
