//! Task records and references.
//!
//! A task is a closure plus bookkeeping: a parent back-link, an
//! unfinished-work counter and a bounded continuation list. Records live in
//! per-worker arenas; a [`TaskRef`] is the `(worker, slot)` index pair that
//! links records together, packed into a single `u64` so the parent and
//! continuation cells can be plain atomics.

use crate::scheduler::Handle;
use bitflags::bitflags;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

pub(crate) mod arena;

/// Signature of a task body. Invoked exactly once unless the task is never
/// run; receives the scheduler handle (to create and run further tasks) and
/// the task's own reference (to parent children onto itself).
pub(crate) type TaskFn = Box<dyn FnOnce(&Handle, TaskRef) + Send + 'static>;

/// Inline continuation slots per task. Keeps continuation scheduling
/// allocation-free; over-capacity is an assertion failure.
pub(crate) const MAX_CONTINUATIONS: usize = 15;

/// Reserved encoding for "no task" inside atomic cells.
const NONE: u64 = u64::MAX;

/// An opaque, copyable reference to a task record: the index of the owning
/// worker's arena and the slot within it.
///
/// The arena owns the storage; the reference stays valid until that arena
/// is next reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    worker: u32,
    slot: u32,
}

impl TaskRef {
    pub(crate) fn new(worker: usize, slot: u32) -> Self {
        debug_assert!(worker < u32::MAX as usize);
        Self {
            worker: worker as u32,
            slot,
        }
    }

    #[inline(always)]
    pub(crate) fn worker(self) -> usize {
        self.worker as usize
    }

    #[inline(always)]
    pub(crate) fn slot(self) -> usize {
        self.slot as usize
    }

    #[inline(always)]
    pub(crate) fn pack(self) -> u64 {
        ((self.worker as u64) << 32) | self.slot as u64
    }

    #[inline(always)]
    pub(crate) fn unpack(raw: u64) -> Option<Self> {
        if raw == NONE {
            return None;
        }

        Some(Self {
            worker: (raw >> 32) as u32,
            slot: raw as u32,
        })
    }

    fn pack_opt(task: Option<Self>) -> u64 {
        task.map_or(NONE, Self::pack)
    }
}

bitflags! {
    /// Debug-mode misuse detection. The task lifecycle itself is implicit
    /// in the `unfinished` counter; these bits only catch API misuse
    /// (running a task twice, attaching a continuation after run).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TaskFlags: u8 {
        /// The task has been handed to `run` (or scheduled as a
        /// continuation).
        const SCHEDULED = 1;

        /// The task's body has been taken for execution.
        const EXECUTED = 1 << 1;
    }
}

/// One task record. Storage is owned by an arena and recycled in place:
/// `init` re-arms a slot for its next occupant.
pub(crate) struct TaskSlot {
    /// The callable. Written by the creating thread before the task is
    /// published, taken exactly once by the executing thread.
    body: UnsafeCell<Option<TaskFn>>,

    /// Packed optional parent reference. Non-owning.
    parent: AtomicU64,

    /// 1 (for the task itself) plus the number of unfinished direct
    /// children. The task is complete iff this reaches 0.
    unfinished: AtomicU32,

    /// Number of reserved entries in `continuations`.
    continuation_count: AtomicU32,

    /// Packed continuation references. Each slot is reserved by a
    /// fetch-add on `continuation_count`, so every index has one writer.
    continuations: [AtomicU64; MAX_CONTINUATIONS],

    flags: AtomicU8,
}

// Safety: all cross-thread state is atomics. The `body` cell is the one
// non-atomic field and it has exclusive access by construction: the
// allocating thread writes it before the task is published (deque push /
// injector push / continuation store, all release), and the single
// executing thread takes it after the matching acquire edge.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    pub(crate) fn empty() -> Self {
        const NO_TASK: AtomicU64 = AtomicU64::new(NONE);
        Self {
            body: UnsafeCell::new(None),
            parent: AtomicU64::new(NONE),
            unfinished: AtomicU32::new(0),
            continuation_count: AtomicU32::new(0),
            continuations: [NO_TASK; MAX_CONTINUATIONS],
            flags: AtomicU8::new(0),
        }
    }

    /// Re-arms this slot for a fresh task. The caller must hold the unique
    /// allocation of this slot (invariant: at most `max_tasks` live tasks
    /// per arena between resets).
    pub(crate) fn init(&self, body: TaskFn, parent: Option<TaskRef>) {
        self.flags.store(0, Ordering::Relaxed);
        self.unfinished.store(1, Ordering::Relaxed);
        self.continuation_count.store(0, Ordering::Relaxed);
        self.parent.store(TaskRef::pack_opt(parent), Ordering::Relaxed);

        // Safety: see the Sync impl note; between allocation and
        // publication only the creating thread touches the cell.
        unsafe {
            *self.body.get() = Some(body);
        }
    }

    /// Takes the body for execution. Returns `None` if it was already
    /// taken, which a correct caller never observes.
    pub(crate) fn take_body(&self) -> Option<TaskFn> {
        // Safety: publication (release) and acquisition (acquire) of the
        // task reference order this read after `init`'s write; a single
        // consumer wins the task from the deque or injector.
        unsafe { (*self.body.get()).take() }
    }

    #[inline(always)]
    pub(crate) fn parent(&self) -> Option<TaskRef> {
        TaskRef::unpack(self.parent.load(Ordering::Relaxed))
    }

    /// Registers one more unit of unfinished work (a new direct child).
    /// Returns the previous counter value.
    #[inline(always)]
    pub(crate) fn add_child(&self) -> u32 {
        self.unfinished.fetch_add(1, Ordering::AcqRel)
    }

    /// Retires one unit of unfinished work. Returns the previous counter
    /// value; the task is complete when this returns 1.
    #[inline(always)]
    pub(crate) fn retire_one(&self) -> u32 {
        self.unfinished.fetch_sub(1, Ordering::AcqRel)
    }

    /// A completed task's body side effects (and those of all its
    /// descendants) are visible to any thread that observes completion,
    /// through the acq-rel chain on `unfinished`.
    #[inline(always)]
    pub(crate) fn is_complete(&self) -> bool {
        self.unfinished.load(Ordering::Acquire) == 0
    }

    #[cfg(test)]
    pub(crate) fn unfinished(&self) -> u32 {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Reserves the next continuation slot and stores `task` into it.
    #[track_caller]
    pub(crate) fn push_continuation(&self, task: TaskRef) {
        let idx = self.continuation_count.fetch_add(1, Ordering::AcqRel) as usize;
        assert!(
            idx < MAX_CONTINUATIONS,
            "continuation list full ({} slots)",
            MAX_CONTINUATIONS
        );
        self.continuations[idx].store(task.pack(), Ordering::Release);
    }

    pub(crate) fn continuation_count(&self) -> usize {
        self.continuation_count.load(Ordering::Acquire) as usize
    }

    pub(crate) fn continuation(&self, idx: usize) -> TaskRef {
        let raw = self.continuations[idx].load(Ordering::Acquire);
        TaskRef::unpack(raw).expect("reserved continuation slot is empty")
    }

    /// Marks the task as handed to the scheduler. Returns whether it had
    /// already been scheduled before this call.
    pub(crate) fn mark_scheduled(&self) -> bool {
        let prev = self.flags.fetch_or(TaskFlags::SCHEDULED.bits(), Ordering::AcqRel);
        TaskFlags::from_bits_truncate(prev).contains(TaskFlags::SCHEDULED)
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(TaskFlags::SCHEDULED)
    }

    /// Marks the body as taken. Returns whether it had already been
    /// executed before this call.
    pub(crate) fn mark_executed(&self) -> bool {
        let prev = self.flags.fetch_or(TaskFlags::EXECUTED.bits(), Ordering::AcqRel);
        TaskFlags::from_bits_truncate(prev).contains(TaskFlags::EXECUTED)
    }
}

impl fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("parent", &self.parent())
            .field("unfinished", &self.unfinished.load(Ordering::Relaxed))
            .field(
                "continuation_count",
                &self.continuation_count.load(Ordering::Relaxed),
            )
            .field(
                "flags",
                &TaskFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> TaskFn {
        Box::new(|_, _| {})
    }

    #[test]
    fn test_ref_packing() {
        let task = TaskRef::new(3, 41);
        assert_eq!(TaskRef::unpack(task.pack()), Some(task));
        assert_eq!(TaskRef::unpack(NONE), None);
        assert_eq!(TaskRef::pack_opt(None), NONE);
    }

    #[test]
    fn test_init_rearms_slot() {
        let slot = TaskSlot::empty();
        slot.init(noop_body(), None);
        slot.push_continuation(TaskRef::new(0, 1));
        assert!(!slot.mark_scheduled());
        assert!(slot.retire_one() == 1);

        // Recycled for a new occupant: all bookkeeping is reset.
        slot.init(noop_body(), Some(TaskRef::new(1, 2)));
        assert_eq!(slot.parent(), Some(TaskRef::new(1, 2)));
        assert_eq!(slot.continuation_count(), 0);
        assert!(!slot.is_complete());
        assert!(!slot.is_scheduled());
        assert!(slot.take_body().is_some());
    }

    #[test]
    fn test_child_counting() {
        let slot = TaskSlot::empty();
        slot.init(noop_body(), None);

        assert_eq!(slot.add_child(), 1);
        assert_eq!(slot.add_child(), 2);

        assert_eq!(slot.retire_one(), 3);
        assert_eq!(slot.retire_one(), 2);
        assert!(!slot.is_complete());
        assert_eq!(slot.retire_one(), 1);
        assert!(slot.is_complete());
    }

    #[test]
    fn test_body_taken_once() {
        let slot = TaskSlot::empty();
        slot.init(noop_body(), None);

        assert!(!slot.mark_executed());
        assert!(slot.take_body().is_some());
        assert!(slot.mark_executed());
        assert!(slot.take_body().is_none());
    }

    #[test]
    #[should_panic(expected = "continuation list full")]
    fn test_continuation_overflow_asserts() {
        let slot = TaskSlot::empty();
        slot.init(noop_body(), None);

        for i in 0..=MAX_CONTINUATIONS {
            slot.push_continuation(TaskRef::new(0, i as u32));
        }
    }
}
