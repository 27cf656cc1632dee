//! Runtime construction and lifecycle errors.
//!
//! Only setup and teardown report through this type. I/O performed by
//! fibers surfaces as the kernel's signed result codes, and scheduler
//! invariant violations are fatal assertions, not recoverable errors.

/// Errors surfaced by [`Runtime`](crate::Runtime) construction and
/// shutdown.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Setting up a core's io_uring failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker threads panicked during execution.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
