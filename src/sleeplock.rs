//! Locks that block fibers, not worker threads.
//!
//! A fiber that loses the race for a sleep lock parks itself on the
//! lock's wait queue and suspends; the releasing fiber transfers
//! ownership and wakes it. The worker thread underneath keeps dispatching
//! other fibers the whole time. Metadata is guarded by a short spin lock
//! which may be taken from any core, because a release on core A can wake
//! a waiter on core B.
//!
//! These locks may only be used from fiber context.

use crate::fiber;
use crate::id::FiberId;
use crate::runtime::current;
use crate::spinlock::SpinLock;
use crate::worker;
use std::collections::VecDeque;

fn caller() -> FiberId {
    let me = current();
    assert!(!me.is_null(), "sleep locks may only be used from fiber context");
    me
}

struct LockState {
    /// Holder of the lock; held iff non-null.
    owner: FiberId,
    waiters: VecDeque<FiberId>,
}

/// An exclusive lock whose waiters are fibers.
///
/// Waiters are released in FIFO order. Ownership is transferred by the
/// releasing fiber writing the waiter's id into `owner` before waking it,
/// so `owner == self` is the authoritative wakeup predicate and spurious
/// wakes are harmless.
pub struct SleepLock {
    state: SpinLock<LockState>,
}

impl SleepLock {
    pub fn new() -> Self {
        SleepLock {
            state: SpinLock::new(LockState {
                owner: FiberId::null(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires the lock, suspending the calling fiber while contended.
    pub fn lock(&self) {
        let me = caller();
        {
            let mut state = self.state.lock();
            if state.owner.is_null() {
                state.owner = me;
                return;
            }
            state.waiters.push_back(me);
        }
        loop {
            // Spurious wake-ups can happen due to signalers of past
            // inhabitants of this context.
            fiber::dispatch();
            let state = self.state.lock();
            if state.owner == me {
                return;
            }
        }
    }

    /// Attempts the acquisition once; never touches the wait queue.
    pub fn try_lock(&self) -> bool {
        let me = caller();
        let mut state = self.state.lock();
        if state.owner.is_null() {
            state.owner = me;
            true
        } else {
            false
        }
    }

    /// Releases the lock, handing it to the first waiter if any.
    pub fn unlock(&self) {
        let me = caller();
        let runtime = worker::runtime_shared();
        let mut state = self.state.lock();
        assert_eq!(state.owner, me, "unlock of a SleepLock the caller does not hold");
        match state.waiters.pop_front() {
            None => state.owner = FiberId::null(),
            Some(next) => {
                state.owner = next;
                worker::wake(&runtime, next);
            }
        }
    }

    pub fn owned(&self) -> bool {
        !self.state.lock().owner.is_null()
    }
}

impl Default for SleepLock {
    fn default() -> Self {
        Self::new()
    }
}

struct SxState {
    owner: FiberId,
    /// Count of shared holders. Never non-zero while `owner` is set.
    shared: u32,
    s_waiters: VecDeque<FiberId>,
    x_waiters: VecDeque<FiberId>,
}

/// A shared/exclusive lock whose waiters are fibers.
///
/// Writers take priority over newly arriving readers but drain behind
/// active ones: a parked writer blocks fresh `slock` callers, and a
/// releasing writer wakes every parked reader at once, crediting
/// `shared` with the whole batch before the metadata lock is dropped.
pub struct SleepLockSX {
    state: SpinLock<SxState>,
}

impl SleepLockSX {
    pub fn new() -> Self {
        SleepLockSX {
            state: SpinLock::new(SxState {
                owner: FiberId::null(),
                shared: 0,
                s_waiters: VecDeque::new(),
                x_waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires the lock exclusively.
    pub fn xlock(&self) {
        let me = caller();
        {
            let mut state = self.state.lock();
            if state.owner.is_null() && state.shared == 0 {
                state.owner = me;
                return;
            }
            state.x_waiters.push_back(me);
        }
        loop {
            // Spurious wake-ups can happen due to signalers of past
            // inhabitants of this context.
            fiber::dispatch();
            let state = self.state.lock();
            if state.owner == me {
                return;
            }
        }
    }

    pub fn try_xlock(&self) -> bool {
        let me = caller();
        let mut state = self.state.lock();
        if state.owner.is_null() && state.shared == 0 {
            state.owner = me;
            true
        } else {
            false
        }
    }

    /// Releases an exclusive hold. Parked readers drain first, as one
    /// batch; otherwise ownership passes to the next parked writer.
    pub fn xunlock(&self) {
        let me = caller();
        let runtime = worker::runtime_shared();
        let mut state = self.state.lock();
        assert_eq!(state.owner, me, "xunlock of a SleepLockSX the caller does not hold");
        if !state.s_waiters.is_empty() {
            state.owner = FiberId::null();
            let woken = state.s_waiters.len() as u32;
            while let Some(next) = state.s_waiters.pop_front() {
                worker::wake(&runtime, next);
            }
            // Credit the whole batch before the metadata lock drops; the
            // woken readers do not touch the count themselves.
            state.shared = woken;
            return;
        }
        match state.x_waiters.pop_front() {
            Some(next) => {
                state.owner = next;
                worker::wake(&runtime, next);
            }
            None => state.owner = FiberId::null(),
        }
    }

    /// Acquires the lock shared. Parks while a writer holds the lock or
    /// waits for it — a parked writer is never overtaken by new readers.
    pub fn slock(&self) {
        let me = caller();
        {
            let mut state = self.state.lock();
            if state.owner.is_null() && state.x_waiters.is_empty() {
                state.shared += 1;
                return;
            }
            state.s_waiters.push_back(me);
        }
        loop {
            // Spurious wake-ups can happen due to signalers of past
            // inhabitants of this context.
            fiber::dispatch();
            let state = self.state.lock();
            if !state.s_waiters.contains(&me) {
                // Drained by an xunlock, which already credited us.
                return;
            }
        }
    }

    pub fn try_slock(&self) -> bool {
        caller();
        let mut state = self.state.lock();
        if state.owner.is_null() && state.x_waiters.is_empty() {
            state.shared += 1;
            true
        } else {
            false
        }
    }

    /// Releases a shared hold; the last reader out hands the lock to the
    /// first parked writer.
    pub fn sunlock(&self) {
        caller();
        let runtime = worker::runtime_shared();
        let mut state = self.state.lock();
        assert!(state.shared > 0, "sunlock of a SleepLockSX with no shared holder");
        state.shared -= 1;
        if state.shared == 0 {
            if let Some(next) = state.x_waiters.pop_front() {
                state.owner = next;
                worker::wake(&runtime, next);
            }
        }
    }

    /// Whether the lock is held in either mode.
    pub fn owned(&self) -> bool {
        let state = self.state.lock();
        !state.owner.is_null() || state.shared > 0
    }

    pub fn num_waiters(&self) -> u32 {
        let state = self.state.lock();
        (state.s_waiters.len() + state.x_waiters.len()) as u32
    }
}

impl Default for SleepLockSX {
    fn default() -> Self {
        Self::new()
    }
}
