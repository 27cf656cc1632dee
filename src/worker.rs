//! Per-core scheduler state and the dispatch loop.
//!
//! Each worker thread owns one core: a fixed table of fiber slots, the
//! occupancy word that tracks which slots hold live fibers, an io_uring
//! pair for the syscall bridge, and the pending-request arena. All of that
//! state is written only by the owning worker; other cores communicate
//! through the bounded wake and spawn rings, plus the per-slot atomic
//! cells (wakeup time, generation, join waiter).
//!
//! The dispatch loop alternates between servicing the completion ring,
//! applying queued cross-core wakes, and scanning occupied slots for the
//! next eligible fiber. Eligibility is a single comparison: the slot's
//! wakeup time, in cycles, against `rdtsc()`.

use crate::cycles::{self, BLOCKED, RUN_NOW};
use crate::fiber::{Entry, FiberInput, FiberPool, FiberSlot, FiberState};
use crate::id::FiberId;
use crate::ring::WakeRing;
use crate::syscall::{self, SyscallRequest};
use core_affinity::CoreId;
use crossbeam::queue::ArrayQueue;
use io_uring::IoUring;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Fiber slots per core: a 56-bit occupied mask plus an 8-bit creation
/// count pack into one atomic word, so occupancy is published with a
/// single store and dispatch scans only set bits.
pub(crate) const SLOTS_PER_CORE: usize = 56;

const OCCUPIED_MASK: u64 = (1 << SLOTS_PER_CORE) - 1;
const COUNT_UNIT: u64 = 1 << SLOTS_PER_CORE;

/// Per-slot state visible to every core.
pub(crate) struct SlotShared {
    /// Bumped on every fiber exit. Slots start at 1 so that a live
    /// fiber's packed id is never zero.
    pub(crate) generation: AtomicU32,

    /// Cycle timestamp at which the slot becomes eligible to run.
    /// `RUN_NOW` (0) means immediately; `BLOCKED` (max) means only an
    /// explicit signal runs it.
    pub(crate) wakeup_time_cycles: AtomicU64,

    /// Packed id of the single fiber joined on this slot, or 0.
    pub(crate) join_waiter: AtomicU64,
}

pub(crate) struct SpawnMsg {
    slot: u16,
    entry: Entry,
}

/// The cross-core-visible half of one core.
pub(crate) struct CoreShared {
    pub(crate) id: u16,
    occupancy: AtomicU64,
    pub(crate) slots: Box<[SlotShared]>,
    pub(crate) wake_ring: WakeRing,
    spawn_queue: ArrayQueue<SpawnMsg>,
}

impl CoreShared {
    pub(crate) fn new(id: u16, wake_ring_capacity: usize) -> Self {
        let slots = (0..SLOTS_PER_CORE)
            .map(|_| SlotShared {
                generation: AtomicU32::new(1),
                wakeup_time_cycles: AtomicU64::new(BLOCKED),
                join_waiter: AtomicU64::new(0),
            })
            .collect();
        CoreShared {
            id,
            occupancy: AtomicU64::new(0),
            slots,
            wake_ring: WakeRing::new(wake_ring_capacity),
            // One outstanding message per claimed slot, so the queue can
            // never overflow at this capacity.
            spawn_queue: ArrayQueue::new(SLOTS_PER_CORE.next_power_of_two()),
        }
    }

    /// Number of live fibers on this core.
    pub(crate) fn live_count(&self) -> u32 {
        (self.occupancy.load(Ordering::Acquire) & OCCUPIED_MASK).count_ones()
    }

    pub(crate) fn occupied(&self, slot: usize) -> bool {
        self.occupancy.load(Ordering::Acquire) & (1 << slot) != 0
    }

    /// Claims a free slot, publishing the occupied bit and the bumped
    /// creation count in one CAS. Returns the slot index.
    fn claim_slot(&self) -> Option<usize> {
        let mut current = self.occupancy.load(Ordering::Acquire);
        loop {
            let free = !current & OCCUPIED_MASK;
            if free == 0 {
                return None;
            }
            let slot = free.trailing_zeros() as usize;
            let next = (current | (1u64 << slot)).wrapping_add(COUNT_UNIT);
            match self.occupancy.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot),
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self, slot: usize) {
        self.occupancy.fetch_and(!(1u64 << slot), Ordering::AcqRel);
    }
}

/// State shared by every core of one runtime.
pub(crate) struct RuntimeShared {
    pub(crate) cores: Vec<Arc<CoreShared>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stack_size: usize,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: crate::metrics::Metrics,
}

impl RuntimeShared {
    /// True while the identified fiber has not exited.
    pub(crate) fn alive(&self, fid: FiberId) -> bool {
        if fid.is_null() || fid.core as usize >= self.cores.len() {
            return false;
        }
        let core = &self.cores[fid.core as usize];
        core.occupied(fid.slot as usize)
            && core.slots[fid.slot as usize].generation.load(Ordering::Acquire) == fid.generation
    }

    /// Allocates a slot on the chosen core (least-loaded when `None`),
    /// ships the entry to the owning worker, and publishes the slot as
    /// runnable. `None` when the target core is out of slots.
    pub(crate) fn spawn(&self, core: Option<usize>, entry: Entry) -> Option<FiberId> {
        let core_index = match core {
            Some(index) => {
                assert!(index < self.cores.len(), "spawn target core out of range");
                index
            }
            None => self.least_loaded_core(),
        };
        let shared = &self.cores[core_index];
        let Some(slot) = shared.claim_slot() else {
            tracing::warn!(core = core_index, "spawn failed: no free fiber slot");
            return None;
        };
        let state = &shared.slots[slot];
        let generation = state.generation.load(Ordering::Acquire);
        state.join_waiter.store(0, Ordering::Relaxed);
        state.wakeup_time_cycles.store(RUN_NOW, Ordering::Release);
        if shared
            .spawn_queue
            .push(SpawnMsg {
                slot: slot as u16,
                entry,
            })
            .is_err()
        {
            unreachable!("spawn queue overflow with a claimed slot");
        }
        #[cfg(feature = "metrics")]
        self.metrics.fibers_spawned.fetch_add(1, Ordering::Relaxed);
        Some(FiberId::new(shared.id, slot as u16, generation))
    }

    fn least_loaded_core(&self) -> usize {
        self.cores
            .iter()
            .enumerate()
            .min_by_key(|(_, core)| core.live_count())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

/// Marks the identified fiber runnable. Must run on the fiber's own core;
/// the generation check makes stale ids a no-op.
pub(crate) fn signal_on(shared: &CoreShared, fid: FiberId) {
    debug_assert_eq!(shared.id, fid.core, "signal on a foreign core");
    let slot = &shared.slots[fid.slot as usize];
    if slot.generation.load(Ordering::Acquire) == fid.generation {
        slot.wakeup_time_cycles.store(RUN_NOW, Ordering::Release);
    }
}

/// Hands the wake to the target core's ring; the owning dispatcher
/// applies it (with the authoritative generation check) on its next pass.
pub(crate) fn schedule_to(runtime: &RuntimeShared, fid: FiberId) {
    if fid.is_null() || fid.core as usize >= runtime.cores.len() {
        return;
    }
    let target = &runtime.cores[fid.core as usize];
    // Cheap precheck: obviously stale wakes don't occupy ring capacity.
    if target.slots[fid.slot as usize].generation.load(Ordering::Acquire) != fid.generation {
        return;
    }
    target.wake_ring.push(fid);
    #[cfg(feature = "metrics")]
    runtime.metrics.cross_core_wakes.fetch_add(1, Ordering::Relaxed);
}

/// Wakes a fiber from wherever the caller happens to be: directly when
/// the caller runs on the fiber's core, through the wake ring otherwise.
pub(crate) fn wake(runtime: &RuntimeShared, fid: FiberId) {
    if fid.is_null() {
        return;
    }
    if local_core_id() == Some(fid.core) {
        signal_on(&runtime.cores[fid.core as usize], fid);
    } else {
        schedule_to(runtime, fid);
    }
}

/// Core-local state, reachable only from the owning worker thread.
pub(crate) struct CoreLocal {
    pub(crate) shared: Arc<CoreShared>,
    pub(crate) runtime: Arc<RuntimeShared>,
    pub(crate) contexts: Box<[Option<Box<FiberSlot>>]>,
    pub(crate) pool: FiberPool,
    pub(crate) ring: IoUring,
    pub(crate) requests: Slab<SyscallRequest>,
    /// Tags SQE user_data so a cancel can never match a request that
    /// recycled the same arena slot.
    pub(crate) request_seq: u32,
    cursor: usize,
}

thread_local! {
    static CORE: RefCell<Option<CoreLocal>> = const { RefCell::new(None) };
    static CORE_ID: Cell<Option<u16>> = const { Cell::new(None) };
    static RUNTIME: RefCell<Option<Arc<RuntimeShared>>> = const { RefCell::new(None) };
}

/// Runs `f` against this worker's core-local state.
///
/// The borrow must end before any suspension point; callers therefore
/// never `dispatch()` from inside the closure.
pub(crate) fn with_core<R>(f: impl FnOnce(&mut CoreLocal) -> R) -> R {
    CORE.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let core = borrow
            .as_mut()
            .expect("not on a weft worker thread");
        f(core)
    })
}

pub(crate) fn runtime_shared() -> Arc<RuntimeShared> {
    RUNTIME.with(|cell| cell.borrow().clone()).expect("not on a weft worker thread")
}

pub(crate) fn local_core_id() -> Option<u16> {
    CORE_ID.get()
}

/// Stores a wakeup time for a fiber on the current core.
pub(crate) fn set_wakeup(fid: FiberId, cycles: u64) {
    with_core(|core| {
        debug_assert_eq!(core.shared.id, fid.core);
        core.shared.slots[fid.slot as usize]
            .wakeup_time_cycles
            .store(cycles, Ordering::Release);
    });
}

/// A worker thread driving one core's dispatch loop.
pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct WorkerParams {
    pub(crate) runtime: Arc<RuntimeShared>,
    pub(crate) shared: Arc<CoreShared>,
    pub(crate) ring: IoUring,
    pub(crate) core_id: Option<CoreId>,
}

impl Worker {
    pub(crate) fn new(params: WorkerParams) -> Self {
        let id = params.shared.id as usize;
        let handle = thread::spawn(move || {
            // Pin the worker for cache locality if requested.
            if let Some(core_id) = params.core_id {
                core_affinity::set_for_current(core_id);
            }
            Worker::run_loop(params);
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }

    fn run_loop(params: WorkerParams) {
        let WorkerParams {
            runtime, shared, ring, ..
        } = params;

        let contexts: Box<[Option<Box<FiberSlot>>]> =
            (0..SLOTS_PER_CORE).map(|_| None).collect();
        let local = CoreLocal {
            shared: Arc::clone(&shared),
            runtime: Arc::clone(&runtime),
            contexts,
            pool: FiberPool::new(runtime.stack_size),
            ring,
            requests: Slab::with_capacity(64),
            request_seq: 0,
            cursor: 0,
        };
        CORE.with(|cell| *cell.borrow_mut() = Some(local));
        CORE_ID.set(Some(shared.id));
        RUNTIME.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&runtime)));

        tracing::info!(core = shared.id, "worker started");

        loop {
            let worked = Self::pass(&runtime, &shared);
            if !worked {
                // Idle. Leave only when shutdown is requested and every
                // fiber has exited and every pending request is reaped.
                if runtime.shutdown.load(Ordering::Acquire) && Self::drained(&shared) {
                    break;
                }
                thread::yield_now();
            }
        }

        tracing::info!(core = shared.id, "worker stopped");
        CORE.with(|cell| *cell.borrow_mut() = None);
        CORE_ID.set(None);
        RUNTIME.with(|cell| *cell.borrow_mut() = None);
    }

    /// One dispatch pass. Returns whether a fiber ran.
    fn pass(runtime: &Arc<RuntimeShared>, shared: &Arc<CoreShared>) -> bool {
        Self::drain_spawns(shared);
        syscall::check_for_completions();
        Self::drain_wakes(shared);
        match Self::next_runnable() {
            Some(slot) => {
                Self::run_slot(runtime, shared, slot);
                true
            }
            None => false,
        }
    }

    fn drain_spawns(shared: &CoreShared) {
        while let Some(msg) = shared.spawn_queue.pop() {
            with_core(|core| {
                let mut slot = core.pool.get();
                slot.pending = Some(msg.entry);
                core.contexts[msg.slot as usize] = Some(slot);
            });
        }
    }

    fn drain_wakes(shared: &CoreShared) {
        while let Some(fid) = shared.wake_ring.pop() {
            debug_assert_eq!(fid.core, shared.id, "wake routed to the wrong core");
            signal_on(shared, fid);
        }
    }

    /// Scans occupied slots in fixed rotation from just past the last
    /// slot run; the first eligible slot wins.
    fn next_runnable() -> Option<usize> {
        with_core(|core| {
            let occupied = core.shared.occupancy.load(Ordering::Acquire) & OCCUPIED_MASK;
            if occupied == 0 {
                return None;
            }
            let now = cycles::rdtsc();
            for offset in 0..SLOTS_PER_CORE {
                let slot = (core.cursor + 1 + offset) % SLOTS_PER_CORE;
                if occupied & (1 << slot) == 0 {
                    continue;
                }
                if core.contexts[slot].is_none() {
                    // Claimed but its spawn message has not arrived yet.
                    continue;
                }
                if core.shared.slots[slot].wakeup_time_cycles.load(Ordering::Acquire) <= now {
                    core.cursor = slot;
                    return Some(slot);
                }
            }
            None
        })
    }

    fn run_slot(runtime: &Arc<RuntimeShared>, shared: &Arc<CoreShared>, slot: usize) {
        let (mut fiber, fid) = with_core(|core| {
            let fiber = core.contexts[slot]
                .take()
                .expect("runnable slot without a context");
            let generation = core.shared.slots[slot].generation.load(Ordering::Acquire);
            (fiber, FiberId::new(core.shared.id, slot as u16, generation))
        });

        // A running fiber is blocked by default: unless it arms a wakeup
        // before suspending, or someone signals it, it stays parked.
        shared.slots[slot]
            .wakeup_time_cycles
            .store(BLOCKED, Ordering::Release);

        let input = match fiber.pending.take() {
            Some(entry) => FiberInput::Start(entry, &mut *fiber as *mut FiberSlot),
            None => FiberInput::Resume,
        };

        #[cfg(feature = "metrics")]
        runtime.metrics.context_switches.fetch_add(1, Ordering::Relaxed);

        match fiber.resume(fid, input) {
            FiberState::Yielded => {
                with_core(|core| core.contexts[slot] = Some(fiber));
            }
            FiberState::Complete => {
                Self::retire(runtime, shared, slot, fiber);
            }
            FiberState::Panic(payload) => {
                let message = if let Some(text) = payload.downcast_ref::<&str>() {
                    (*text).to_string()
                } else if let Some(text) = payload.downcast_ref::<String>() {
                    text.clone()
                } else {
                    "non-string panic payload".to_string()
                };
                tracing::error!(core = shared.id, slot, "fiber panicked: {}", message);
                Self::retire(runtime, shared, slot, fiber);
            }
        }
    }

    /// Recycles an exited fiber's slot: bump the generation (staling every
    /// outstanding id), release the occupancy bit, wake the joiner.
    fn retire(
        runtime: &Arc<RuntimeShared>,
        shared: &Arc<CoreShared>,
        slot: usize,
        fiber: Box<FiberSlot>,
    ) {
        with_core(|core| core.pool.put(fiber));
        let state = &shared.slots[slot];
        state.generation.fetch_add(1, Ordering::Release);
        let waiter = state.join_waiter.swap(0, Ordering::AcqRel);
        shared.release_slot(slot);
        if waiter != 0 {
            wake(runtime, FiberId::unpack(waiter));
        }
        #[cfg(feature = "metrics")]
        runtime.metrics.fibers_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn drained(shared: &CoreShared) -> bool {
        shared.occupancy.load(Ordering::Acquire) & OCCUPIED_MASK == 0
            && shared.wake_ring.is_empty()
            && shared.spawn_queue.is_empty()
            && with_core(|core| core.requests.is_empty())
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_scans_lowest_free_bit() {
        let core = CoreShared::new(0, 8);
        assert_eq!(core.claim_slot(), Some(0));
        assert_eq!(core.claim_slot(), Some(1));
        core.release_slot(0);
        assert_eq!(core.claim_slot(), Some(0));
        assert_eq!(core.live_count(), 2);
    }

    #[test]
    fn claim_exhausts_at_capacity() {
        let core = CoreShared::new(0, 8);
        for expected in 0..SLOTS_PER_CORE {
            assert_eq!(core.claim_slot(), Some(expected));
        }
        assert_eq!(core.claim_slot(), None);
        core.release_slot(17);
        assert_eq!(core.claim_slot(), Some(17));
    }

    #[test]
    fn creation_count_is_monotonic() {
        let core = CoreShared::new(0, 8);
        let before = core.occupancy.load(Ordering::Relaxed) >> SLOTS_PER_CORE;
        core.claim_slot();
        core.claim_slot();
        let after = core.occupancy.load(Ordering::Relaxed) >> SLOTS_PER_CORE;
        assert_eq!(after, before + 2);
    }

    #[test]
    fn occupancy_round_trip_preserves_bits() {
        let core = CoreShared::new(0, 8);
        let slot = core.claim_slot().unwrap();
        assert!(core.occupied(slot));
        core.release_slot(slot);
        assert!(!core.occupied(slot));
        assert_eq!(core.occupancy.load(Ordering::Relaxed) & OCCUPIED_MASK, 0);
    }
}
