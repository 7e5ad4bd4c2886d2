//! Worker main loop.

use crate::scheduler::Handle;
use tracing::debug;

#[derive(Debug)]
pub(super) struct Worker {
    /// 0-based index; also the index of this worker's deque and arena.
    id: usize,
}

impl Worker {
    pub(super) fn new(id: usize) -> Self {
        Self { id }
    }

    /// Drives work to completion until the scheduler is stopped.
    ///
    /// The loop shape is fetch / execute / finish; with no work to fetch
    /// the worker parks with a bounded timeout and re-checks the stop flag
    /// on wakeup.
    pub(super) fn run(&self, scheduler: &Handle) {
        debug!(worker = self.id, "worker started");

        loop {
            if scheduler.is_stopped() {
                break;
            }

            match scheduler.fetch_task(self.id) {
                Some(task) => scheduler.run_to_completion(task),
                None => scheduler.park_current_worker(),
            }
        }

        debug!(worker = self.id, "worker stopped");
    }
}
