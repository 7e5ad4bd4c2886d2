//! Per-worker task arena.
//!
//! A bounded ring of task records with constant-time allocation: a
//! monotonic atomic cursor hands out slot `allocated % capacity`. The
//! owning worker is the usual allocator, but the cursor being atomic also
//! makes the designated-external-worker policy sound: threads outside the
//! pool allocate from worker 0's arena concurrently with worker 0 itself
//! and still receive distinct slots.

use super::TaskSlot;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

#[derive(Debug)]
pub(crate) struct Arena {
    slots: Box<[TaskSlot]>,

    /// Monotonic allocation cursor; never decremented except by `reset`.
    allocated: AtomicU64,

    /// Created-but-not-yet-complete tasks in this arena. The quiescence
    /// signal for reset, and the over-capacity detector.
    live: AtomicU64,
}

impl Arena {
    pub(crate) fn new(max_tasks: usize) -> Self {
        debug_assert!(max_tasks > 0);

        Self {
            slots: (0..max_tasks).map(|_| TaskSlot::empty()).collect(),
            allocated: AtomicU64::new(0),
            live: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Hands out the next slot index. The caller contract is that at most
    /// `capacity` live tasks exist per arena between resets; exceeding it
    /// silently recycles a slot that may still be referenced, so it is
    /// loudly logged and asserted in debug builds.
    pub(crate) fn allocate(&self) -> u32 {
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        if live as usize > self.capacity() {
            warn!(
                live,
                capacity = self.capacity(),
                "task arena over capacity; a live task record is being recycled"
            );
            debug_assert!(false, "task arena over capacity");
        }

        let cursor = self.allocated.fetch_add(1, Ordering::Relaxed);
        (cursor % self.capacity() as u64) as u32
    }

    #[inline(always)]
    pub(crate) fn slot(&self, idx: usize) -> &TaskSlot {
        &self.slots[idx]
    }

    /// Records that a task allocated from this arena reached completion.
    #[inline(always)]
    pub(crate) fn task_retired(&self) {
        let prev = self.live.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "retired more tasks than were allocated");
    }

    /// Whether every task ever allocated from this arena has completed.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }

    /// Rewinds the allocation cursor. Only sound while quiescent and while
    /// no caller still holds a reference into this arena.
    pub(crate) fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.live.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocation_wraps() {
        let arena = Arena::new(4);

        for expected in [0u32, 1, 2, 3, 0, 1] {
            let idx = arena.allocate();
            assert_eq!(idx, expected);
            // Keep `live` within capacity so the wrap is legitimate.
            arena.task_retired();
        }
        assert_eq!(arena.allocated(), 6);
    }

    #[test]
    fn test_quiescence_tracking() {
        let arena = Arena::new(8);
        assert!(arena.is_quiescent());

        let _a = arena.allocate();
        let _b = arena.allocate();
        assert!(!arena.is_quiescent());

        arena.task_retired();
        assert!(!arena.is_quiescent());
        arena.task_retired();
        assert!(arena.is_quiescent());
    }

    #[test]
    fn test_reset_rewinds_cursor() {
        let arena = Arena::new(4);
        for _ in 0..3 {
            arena.allocate();
            arena.task_retired();
        }

        arena.reset();
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.allocate(), 0);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let arena = Arc::new(Arena::new(1024));
        let threads = 4;
        let per_thread = 256;

        let handles = (0..threads)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    (0..per_thread).map(|_| arena.allocate()).collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for idx in handle.join().expect("allocator thread panicked") {
                assert!(seen.insert(idx), "slot {} handed out twice", idx);
            }
        }
        assert_eq!(seen.len(), threads * per_thread);
    }
}
