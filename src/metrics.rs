#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional performance counters for the runtime.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Fibers successfully spawned.
    pub fibers_spawned: AtomicU64,
    /// Fibers whose entry returned (or panicked).
    pub fibers_completed: AtomicU64,
    /// Dispatcher-to-fiber control transfers.
    pub context_switches: AtomicU64,
    /// Completion-queue entries reaped.
    pub completions_reaped: AtomicU64,
    /// Requests submitted through the syscall bridge.
    pub syscalls_issued: AtomicU64,
    /// Requests abandoned to the reaper after timeout/interrupt.
    pub syscalls_cancelled: AtomicU64,
    /// Wakeups carried through a wake ring rather than applied directly.
    pub cross_core_wakes: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            fibers_spawned: AtomicU64::new(0),
            fibers_completed: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            completions_reaped: AtomicU64::new(0),
            syscalls_issued: AtomicU64::new(0),
            syscalls_cancelled: AtomicU64::new(0),
            cross_core_wakes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fibers_spawned: self.fibers_spawned.load(Ordering::Relaxed),
            fibers_completed: self.fibers_completed.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            completions_reaped: self.completions_reaped.load(Ordering::Relaxed),
            syscalls_issued: self.syscalls_issued.load(Ordering::Relaxed),
            syscalls_cancelled: self.syscalls_cancelled.load(Ordering::Relaxed),
            cross_core_wakes: self.cross_core_wakes.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the counters at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MetricsSnapshot {
    pub fibers_spawned: u64,
    pub fibers_completed: u64,
    pub context_switches: u64,
    pub completions_reaped: u64,
    pub syscalls_issued: u64,
    pub syscalls_cancelled: u64,
    pub cross_core_wakes: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Fibers still live according to the counters.
    pub fn fibers_live(&self) -> i64 {
        self.fibers_spawned as i64 - self.fibers_completed as i64
    }

    /// Context switches per second since startup.
    pub fn switches_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.context_switches as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fibers_spawned, 0);
        assert_eq!(snapshot.context_switches, 0);
        assert_eq!(snapshot.cross_core_wakes, 0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn snapshot_reflects_updates() {
        let metrics = Metrics::new();
        metrics.fibers_spawned.fetch_add(3, Ordering::Relaxed);
        metrics.fibers_completed.fetch_add(1, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fibers_spawned, 3);
        assert_eq!(snapshot.fibers_live(), 2);
    }
}
