//! Bounded carrier for cross-core wakeups.
//!
//! Wakes that cross a core boundary are not applied directly: the waking
//! core pushes the target's id into the target core's wake ring, and the
//! owning dispatcher drains the ring at the top of every pass and applies
//! the wakes locally. Keeping all slot-table writes on the owning core is
//! what lets the rest of the scheduler run without atomics on the hot path.
//!
//! Capacity is fixed at construction and rounded up to a power of two.
//! Overflow is a capacity-planning bug, not a runtime condition: the ring
//! must be sized above the maximum number of in-flight cross-core wakes a
//! core can receive, so a full ring aborts.

use crate::id::FiberId;
use crossbeam::queue::ArrayQueue;

pub(crate) struct WakeRing {
    queue: ArrayQueue<FiberId>,
}

impl WakeRing {
    pub(crate) fn new(capacity: usize) -> Self {
        WakeRing {
            queue: ArrayQueue::new(capacity.next_power_of_two()),
        }
    }

    /// Enqueues a wake for the owning core to apply. Panics on overflow.
    pub(crate) fn push(&self, fid: FiberId) {
        if self.queue.push(fid).is_err() {
            panic!("cross-core wake ring overflow (capacity {})", self.queue.capacity());
        }
    }

    pub(crate) fn pop(&self) -> Option<FiberId> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let ring = WakeRing::new(8);
        for gen in 1..=5 {
            ring.push(FiberId::new(0, 0, gen));
        }
        for gen in 1..=5 {
            assert_eq!(ring.pop(), Some(FiberId::new(0, 0, gen)));
        }
        assert!(ring.pop().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ring = WakeRing::new(5);
        for gen in 1..=8 {
            ring.push(FiberId::new(0, 0, gen));
        }
        // A ninth push would overflow; capacity is 8, not 5.
        assert_eq!(ring.queue.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "wake ring overflow")]
    fn overflow_is_fatal() {
        let ring = WakeRing::new(2);
        for gen in 1..=3 {
            ring.push(FiberId::new(0, 0, gen));
        }
    }
}
