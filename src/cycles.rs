//! Cycle-counter clock used for all scheduler timing.
//!
//! Fiber wakeup times are expressed in raw CPU cycles so that the dispatch
//! loop can compare them against a single `rdtsc()` read per pass without
//! ever touching the kernel clock. The cycles-per-millisecond ratio is
//! calibrated once, lazily, against the monotonic clock.

use std::time::{Duration, Instant};

/// Wakeup sentinel: the fiber is runnable immediately.
pub(crate) const RUN_NOW: u64 = 0;

/// Wakeup sentinel: the fiber never wakes on time; only a signal runs it.
pub(crate) const BLOCKED: u64 = u64::MAX;

/// Reads the CPU cycle counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let value: u64;
        // CNTVCT_EL0 is the closest analogue of the TSC: monotonic,
        // constant-rate, readable from EL0.
        unsafe {
            std::arch::asm!("mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack, preserves_flags))
        };
        value
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        lazy_static::lazy_static! {
            static ref START: Instant = Instant::now();
        }
        START.elapsed().as_nanos() as u64
    }
}

lazy_static::lazy_static! {
    static ref PER_MILLISECOND: u64 = calibrate();
}

/// Measures the counter frequency against the monotonic clock.
fn calibrate() -> u64 {
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    std::thread::sleep(Duration::from_millis(10));
    let ticks = rdtsc().saturating_sub(tsc_start);
    let elapsed_us = wall_start.elapsed().as_micros().max(1) as u64;
    (ticks.saturating_mul(1000) / elapsed_us).max(1)
}

/// Converts milliseconds to cycles.
#[inline]
pub fn from_millis(ms: u64) -> u64 {
    ms.saturating_mul(*PER_MILLISECOND)
}

/// Converts nanoseconds to cycles.
#[inline]
pub fn from_nanos(ns: u64) -> u64 {
    // Split to keep precision for small sleeps without overflowing large ones.
    let per_ms = *PER_MILLISECOND;
    (ns / 1_000_000).saturating_mul(per_ms) + (ns % 1_000_000) * per_ms / 1_000_000
}
