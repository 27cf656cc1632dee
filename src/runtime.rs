//! Runtime construction and the public fiber API.
//!
//! The [`Runtime`] owns one worker thread per core. Fibers are spawned
//! onto a specific core (or the least-loaded one) and stay there for
//! life; the only cross-core traffic is explicit wakeup. User code inside
//! a fiber uses the free functions of this module; external threads go
//! through the `Runtime` handle.

use crate::cycles;
use crate::error::RuntimeError;
use crate::fiber;
use crate::id::FiberId;
use crate::worker::{self, CoreShared, RuntimeShared, Worker, WorkerParams, SLOTS_PER_CORE};
use io_uring::IoUring;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Construction parameters for a [`Runtime`].
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Number of cores (worker threads).
    pub workers: usize,

    /// Stack size per fiber, in bytes.
    pub stack_size: usize,

    /// SQ/CQ entries per core's io_uring. Must cover the largest scatter
    /// request plus worst-case backlog.
    pub ring_entries: u32,

    /// Enable kernel submission-queue polling with the given idle budget
    /// in milliseconds.
    pub sqpoll_idle_ms: Option<u32>,

    /// Pin each worker to a CPU in declaration order.
    pub pin_workers: bool,

    /// Capacity of each core's cross-core wake ring. Rounded up to a
    /// power of two; overflow at runtime is fatal.
    pub wake_ring_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            stack_size: 2 * 1024 * 1024,
            ring_entries: 256,
            sqpoll_idle_ms: None,
            pin_workers: false,
            wake_ring_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), RuntimeError> {
        if self.workers == 0 {
            return Err(RuntimeError::InvalidConfig("workers must be > 0".into()));
        }
        if self.workers > u16::MAX as usize - 1 {
            return Err(RuntimeError::InvalidConfig("too many workers".into()));
        }
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig(
                "stack_size must be at least 16 KiB".into(),
            ));
        }
        if self.ring_entries < 8 {
            return Err(RuntimeError::InvalidConfig(
                "ring_entries must be at least 8".into(),
            ));
        }
        if self.wake_ring_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "wake_ring_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// The fiber runtime: a fixed pool of cores, each running a cooperative
/// dispatcher over its own fibers.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    workers: Vec<Worker>,
}

impl Runtime {
    /// Builds the per-core state and starts one worker thread per core.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let cores: Vec<Arc<CoreShared>> = (0..config.workers)
            .map(|index| Arc::new(CoreShared::new(index as u16, config.wake_ring_capacity)))
            .collect();
        let shared = Arc::new(RuntimeShared {
            cores,
            shutdown: AtomicBool::new(false),
            stack_size: config.stack_size,
            #[cfg(feature = "metrics")]
            metrics: crate::metrics::Metrics::new(),
        });

        let core_ids = if config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let mut builder = IoUring::builder();
            if let Some(idle) = config.sqpoll_idle_ms {
                builder.setup_sqpoll(idle);
            }
            let ring = builder.build(config.ring_entries)?;
            let core_id = core_ids.get(index % core_ids.len().max(1)).copied();
            workers.push(Worker::new(WorkerParams {
                runtime: Arc::clone(&shared),
                shared: Arc::clone(&shared.cores[index]),
                ring,
                core_id,
            }));
        }

        Ok(Runtime { shared, workers })
    }

    /// Spawns a fiber on the least-loaded core. `None` when every slot on
    /// that core is taken; retrying after fibers exit is the caller's
    /// policy.
    pub fn spawn<F>(&self, entry: F) -> Option<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(None, Box::new(entry))
    }

    /// Spawns a fiber pinned to a specific core.
    pub fn spawn_on<F>(&self, core: usize, entry: F) -> Option<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Some(core), Box::new(entry))
    }

    /// True while the fiber has not exited. Stale ids are always false.
    pub fn alive(&self, fid: FiberId) -> bool {
        self.shared.alive(fid)
    }

    /// Queues a wakeup for a fiber from outside the runtime. Dropped
    /// silently if the fiber has exited.
    pub fn schedule(&self, fid: FiberId) {
        worker::schedule_to(&self.shared, fid);
    }

    /// Blocks the calling thread until the fiber exits.
    ///
    /// This is the external-thread analogue of [`join`]; it polls with
    /// exponential backoff rather than suspending a fiber.
    pub fn wait(&self, fid: FiberId) {
        let mut backoff_us = 1;
        const MAX_BACKOFF_US: u64 = 1000;
        while self.shared.alive(fid) {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }

    pub fn num_cores(&self) -> usize {
        self.shared.cores.len()
    }

    /// Maximum concurrently live fibers per core.
    pub fn slots_per_core(&self) -> usize {
        SLOTS_PER_CORE
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Shuts the runtime down, waiting for every live fiber to exit and
    /// every pending request to drain.
    pub fn shutdown(self) -> Result<(), RuntimeError> {
        self.shared.shutdown.store(true, Ordering::Release);

        let mut failed = 0;
        for worker in self.workers {
            let id = worker.id();
            if worker.join().is_err() {
                failed += 1;
                tracing::error!(core = id, "worker panicked during execution");
            }
        }

        if failed > 0 {
            Err(RuntimeError::WorkerPanicked(failed))
        } else {
            Ok(())
        }
    }
}

/// Identity of the calling fiber, or the null id on a non-fiber thread.
pub fn current() -> FiberId {
    fiber::running().map(|r| r.id).unwrap_or_else(FiberId::null)
}

/// Cooperative reschedule.
///
/// Inside a fiber, marks it immediately runnable again and suspends to
/// the dispatcher; on a plain thread, yields the thread.
pub fn yield_now() {
    match fiber::running() {
        Some(running) => {
            worker::set_wakeup(running.id, cycles::RUN_NOW);
            fiber::dispatch();
        }
        None => thread::yield_now(),
    }
}

/// Suspends the calling fiber for at least `duration`.
///
/// Falls back to a thread sleep off-fiber.
pub fn sleep(duration: Duration) {
    match fiber::running() {
        Some(running) => {
            let deadline =
                cycles::rdtsc().saturating_add(cycles::from_nanos(duration.as_nanos() as u64));
            // Spurious signals can land early; re-arm until the deadline
            // actually passes.
            while cycles::rdtsc() < deadline {
                worker::set_wakeup(running.id, deadline);
                fiber::dispatch();
            }
        }
        None => thread::sleep(duration),
    }
}

/// Spawns a fiber from within fiber context onto the least-loaded core.
pub fn spawn<F>(entry: F) -> Option<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    worker::runtime_shared().spawn(None, Box::new(entry))
}

/// Spawns a fiber from within fiber context onto a specific core.
pub fn spawn_on<F>(core: usize, entry: F) -> Option<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    worker::runtime_shared().spawn(Some(core), Box::new(entry))
}

/// True while the fiber has not exited. Fiber-context only.
pub fn alive(fid: FiberId) -> bool {
    worker::runtime_shared().alive(fid)
}

/// Blocks the calling fiber until `fid` exits.
///
/// Each fiber carries a single join-waiter cell: at most one fiber may
/// join a given fiber at a time. Joining an already-exited (stale) id
/// returns immediately.
pub fn join(fid: FiberId) {
    if fid.is_null() {
        return;
    }
    let running = fiber::running().expect("join() outside fiber context; use Runtime::wait");
    let runtime = worker::runtime_shared();
    let me = running.id;
    loop {
        if !runtime.alive(fid) {
            return;
        }
        runtime.cores[fid.core()].slots[fid.slot as usize]
            .join_waiter
            .store(me.pack(), Ordering::Release);
        // The exit path may have read the cell before our store landed;
        // re-checking liveness closes the window. A leftover registration
        // only ever produces a spurious wake, which every wait loop
        // already tolerates.
        if !runtime.alive(fid) {
            return;
        }
        fiber::dispatch();
    }
}

/// Marks a fiber runnable. From the fiber's own core this takes effect
/// immediately; from any other core (or thread) it is carried by the
/// target core's wake ring. Stale ids are dropped at the generation
/// check.
pub fn signal(fid: FiberId) {
    let runtime = worker::runtime_shared();
    worker::wake(&runtime, fid);
}

/// Queues a wakeup onto the fiber's core without the same-core fast path.
pub fn schedule(fid: FiberId) {
    let runtime = worker::runtime_shared();
    worker::schedule_to(&runtime, fid);
}
