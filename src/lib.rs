//! # weft — M:N fiber runtime core
//!
//! A cooperative fiber runtime that multiplexes many lightweight stackful
//! fibers onto a fixed pool of worker threads ("cores"), with an
//! io_uring-backed syscall bridge so fibers performing I/O suspend
//! without blocking their worker.
//!
//! ## Architecture
//!
//! Each core runs a single-threaded dispatcher over its own slot table;
//! fibers are pinned to the core that created them and the only
//! cross-core traffic is explicit wakeup through a bounded ring. Key
//! components:
//!
//! - **Fibers**: stackful contexts (via `corosensei`) identified by a
//!   generation-tagged [`FiberId`] that can never alias a later
//!   inhabitant of the same slot
//! - **Sleep locks**: [`SleepLock`] and [`SleepLockSX`] block fibers, not
//!   worker threads, and release waiters in FIFO order
//! - **Syscall bridge**: [`syscall`] submits operations to the core's
//!   io_uring, suspends the issuer, and resumes it on completion, with
//!   timeout and cancellation
//!
//! ## Example
//!
//! ```no_run
//! use weft::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig {
//!     workers: 4,
//!     ..RuntimeConfig::default()
//! })
//! .unwrap();
//!
//! let fiber = runtime
//!     .spawn(|| {
//!         println!("hello from a fiber");
//!         weft::yield_now();
//!     })
//!     .expect("out of fiber slots");
//!
//! runtime.wait(fiber);
//! runtime.shutdown().unwrap();
//! ```

mod cycles;
mod fiber;
mod id;
mod ring;
mod spinlock;
mod worker;

pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod runtime;
pub mod sleeplock;
pub mod syscall;

pub use error::RuntimeError;
pub use id::FiberId;
pub use runtime::{
    alive, current, join, schedule, signal, sleep, spawn, spawn_on, yield_now, Runtime,
    RuntimeConfig,
};
pub use sleeplock::{SleepLock, SleepLockSX};
