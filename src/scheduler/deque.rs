//! Chase-Lev work-stealing deque.
//!
//! A bounded single-owner, multi-thief double-ended queue of task
//! references. The owning worker pushes and pops at the bottom (LIFO);
//! other workers steal from the top (FIFO), so thieves take the oldest
//! work and the owner keeps its cache-hot tail.
//!
//! `top` and `bottom` are monotonically increasing; the live region is
//! `[top, bottom)` and slot `i` lives at `i & mask` in the power-of-two
//! ring. Correctness hinges on the exact fences below: the owner's pop
//! publishes its decrement with a SeqCst fence before reading `top`, the
//! thief snapshots `top`/`bottom` across a SeqCst fence, and the race for
//! the last element is decided by a single acq-rel CAS on `top`; exactly
//! one side wins.

use crate::task::TaskRef;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};

/// Outcome of a steal attempt. Mirrors the shape of
/// `crossbeam_deque::Steal` so callers can tell contention (worth
/// retrying) from a genuinely empty victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal {
    Empty,
    Retry,
    Success(TaskRef),
}

impl Steal {
    #[cfg(test)]
    pub(crate) fn success(self) -> Option<TaskRef> {
        match self {
            Steal::Success(task) => Some(task),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Deque {
    /// Thief end. Only ever incremented, via CAS.
    top: CachePadded<AtomicI64>,

    /// Owner end. Written only by the owning worker.
    bottom: CachePadded<AtomicI64>,

    buffer: Box<[AtomicU64]>,
    mask: i64,
}

impl Deque {
    /// `capacity` must be a power of two.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");

        Self {
            top: CachePadded::new(AtomicI64::new(0)),
            bottom: CachePadded::new(AtomicI64::new(0)),
            buffer: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            mask: capacity as i64 - 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    fn slot(&self, index: i64) -> &AtomicU64 {
        &self.buffer[(index & self.mask) as usize]
    }

    /// Owner only. Returns `false` when the deque is at capacity; the
    /// caller decides how to handle the overflow.
    pub(crate) fn push(&self, task: TaskRef) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b - t >= self.capacity() as i64 {
            return false;
        }

        self.slot(b).store(task.pack(), Ordering::Relaxed);

        // Publish the element to thieves.
        self.bottom.store(b + 1, Ordering::Release);
        true
    }

    /// Owner only. Takes the most recently pushed element.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);

        // The decrement must be visible to thieves before we read `top`,
        // otherwise a thief and the owner could both take the last element.
        fence(Ordering::SeqCst);

        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty; restore the canonical empty state.
            self.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        let raw = self.slot(b).load(Ordering::Relaxed);

        if t != b {
            // More than one element left; no thief can reach this slot.
            return Some(unpack(raw));
        }

        // Exactly one element: race any thief for it on `top`.
        let won = self
            .top
            .compare_exchange(t, t + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();

        self.bottom.store(t + 1, Ordering::Relaxed);
        won.then(|| unpack(raw))
    }

    /// Any thief. Takes the oldest element.
    pub(crate) fn steal(&self) -> Steal {
        let t = self.top.load(Ordering::Acquire);

        // Order the `top` read before the `bottom` read so the snapshot is
        // conservative with respect to a concurrent pop.
        fence(Ordering::SeqCst);

        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return Steal::Empty;
        }

        let raw = self.slot(t).load(Ordering::Relaxed);

        // The read above is only trusted if we win the CAS; losing means
        // another thief or the owner's pop got there first.
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }

        Steal::Success(unpack(raw))
    }

    pub(crate) fn is_empty(&self) -> bool {
        let t = self.top.load(Ordering::Acquire);
        let b = self.bottom.load(Ordering::Acquire);
        t >= b
    }
}

#[inline(always)]
fn unpack(raw: u64) -> TaskRef {
    TaskRef::unpack(raw).expect("deque slot holds the none sentinel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn task(slot: u32) -> TaskRef {
        TaskRef::new(0, slot)
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_capacity_must_be_power_of_two() {
        let _ = Deque::with_capacity(12);
    }

    #[test]
    fn test_owner_pop_is_lifo() {
        let deque = Deque::with_capacity(8);
        for i in 1..=3 {
            assert!(deque.push(task(i)));
        }

        assert_eq!(deque.pop(), Some(task(3)));
        assert_eq!(deque.pop(), Some(task(2)));
        assert_eq!(deque.pop(), Some(task(1)));
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn test_thief_steal_is_fifo() {
        let deque = Deque::with_capacity(8);
        for i in 1..=3 {
            assert!(deque.push(task(i)));
        }

        assert_eq!(deque.steal().success(), Some(task(1)));
        assert_eq!(deque.steal().success(), Some(task(2)));
        assert_eq!(deque.steal().success(), Some(task(3)));
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn test_push_reports_overflow() {
        let deque = Deque::with_capacity(4);
        for i in 0..4 {
            assert!(deque.push(task(i)));
        }
        assert!(!deque.push(task(4)));

        // Draining one slot makes room again.
        assert!(deque.pop().is_some());
        assert!(deque.push(task(4)));
    }

    #[test]
    fn test_interleaved_owner_and_thief() {
        let deque = Deque::with_capacity(8);

        deque.push(task(1));
        assert_eq!(deque.steal().success(), Some(task(1)));

        deque.push(task(2));
        deque.push(task(3));
        assert_eq!(deque.pop(), Some(task(3)));
        assert_eq!(deque.steal().success(), Some(task(2)));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn test_wraparound_reuses_slots() {
        let deque = Deque::with_capacity(4);

        for round in 0..16u32 {
            for i in 0..4 {
                assert!(deque.push(task(round * 4 + i)));
            }
            for i in (0..4).rev() {
                assert_eq!(deque.pop(), Some(task(round * 4 + i)));
            }
        }
    }

    // Every task pushed by the owner is taken exactly once, whether by the
    // owner's pops or by racing thieves. This is the last-element CAS
    // tie-break under real contention.
    #[test]
    fn test_concurrent_owner_and_thieves_no_loss_no_dup() {
        let total: usize = 4096;
        let thieves = 4;

        let deque = Arc::new(Deque::with_capacity(8192));
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..total).map(|_| AtomicUsize::new(0)).collect());
        let barrier = Arc::new(Barrier::new(thieves + 1));

        let mut handles = Vec::new();
        for _ in 0..thieves {
            let deque = Arc::clone(&deque);
            let counts = Arc::clone(&counts);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut empty_streak = 0;
                while empty_streak < 1024 {
                    match deque.steal() {
                        Steal::Success(task) => {
                            empty_streak = 0;
                            counts[task.slot()].fetch_add(1, Ordering::SeqCst);
                        }
                        Steal::Retry => empty_streak = 0,
                        Steal::Empty => empty_streak += 1,
                    }
                }
            }));
        }

        barrier.wait();
        for i in 0..total {
            while !deque.push(task(i as u32)) {
                // Thieves will drain it; give them a chance.
                thread::yield_now();
            }
            if i % 3 == 0 {
                if let Some(popped) = deque.pop() {
                    counts[popped.slot()].fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        while let Some(popped) = deque.pop() {
            counts[popped.slot()].fetch_add(1, Ordering::SeqCst);
        }

        for handle in handles {
            handle.join().expect("thief thread panicked");
        }

        let mut seen = HashSet::new();
        for (slot, count) in counts.iter().enumerate() {
            let count = count.load(Ordering::SeqCst);
            assert_eq!(count, 1, "task {} taken {} times", slot, count);
            seen.insert(slot);
        }
        assert_eq!(seen.len(), total);
    }
}
