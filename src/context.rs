//! Thread-local worker identity.
//!
//! Each worker thread publishes which scheduler it belongs to and its
//! 0-based worker id, so that code running inside a task body can find its
//! own arena and deque without threading them through every call.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique id handed to each scheduler instance. Comparing tokens on
/// every lookup means a thread that outlives one scheduler can never alias
/// into a newer one.
static NEXT_SCHEDULER_TOKEN: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_scheduler_token() -> u64 {
    NEXT_SCHEDULER_TOKEN.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CurrentWorker {
    token: u64,
    id: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<CurrentWorker>> = const { Cell::new(None) };
}

/// Binds the current thread to worker `id` of the scheduler identified by
/// `token`. Called once per spawned worker thread, before its loop starts.
pub(crate) fn init_worker(token: u64, id: usize) {
    CURRENT_WORKER.with(|cell| {
        debug_assert!(
            cell.get().is_none(),
            "thread is already bound to a worker"
        );
        cell.set(Some(CurrentWorker { token, id }));
    });
}

/// Returns the current thread's worker id within the scheduler identified
/// by `token`, or `None` when the thread is external to that pool.
#[inline(always)]
pub(crate) fn current_worker(token: u64) -> Option<usize> {
    CURRENT_WORKER.with(|cell| match cell.get() {
        Some(current) if current.token == token => Some(current.id),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_identity_is_thread_local() {
        let token = next_scheduler_token();
        init_worker(token, 3);
        assert_eq!(current_worker(token), Some(3));

        let handle = thread::spawn(move || {
            // A fresh thread has no identity for this scheduler.
            assert_eq!(current_worker(token), None);

            init_worker(token, 7);
            assert_eq!(current_worker(token), Some(7));
        });
        assert!(handle.join().is_ok());

        assert_eq!(current_worker(token), Some(3));
    }

    #[test]
    fn test_stale_token_is_not_honored() {
        let old = next_scheduler_token();
        let new = next_scheduler_token();

        thread::spawn(move || {
            init_worker(old, 0);
            assert_eq!(current_worker(old), Some(0));
            assert_eq!(current_worker(new), None);
        })
        .join()
        .unwrap();
    }
}
