//! Worker thread pool.

use crate::context;
use crate::scheduler::worker::Worker;
use crate::scheduler::Handle;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

/// Abstraction for the scheduler's worker threads.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(super) fn new(scheduler: &Handle) -> Self {
        let num_workers = scheduler.cfg.worker_threads;

        // Spawning threads is async; the barrier guarantees that by the
        // time construction returns, every worker has bound its identity
        // and entered its loop.
        let barrier = Arc::new(Barrier::new(num_workers + 1));

        let handles = (0..num_workers)
            .map(|id| spawn_worker_thread(scheduler.clone(), id, barrier.clone()))
            .collect::<Vec<_>>();

        barrier.wait();

        Self {
            handles: Mutex::new(handles),
        }
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .filter_map(|handle| handle.join().err())
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", panicked))
        }
    }
}

fn spawn_worker_thread(
    scheduler: Handle,
    id: usize,
    barrier: Arc<Barrier>,
) -> thread::JoinHandle<()> {
    let mut builder = thread::Builder::new().name(scheduler.cfg.thread_name.0(id));

    if let Some(stack_size) = scheduler.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || {
            context::init_worker(scheduler.token(), id);
            barrier.wait();

            Worker::new(id).run(&scheduler);
        })
        .expect("failed to spawn worker thread")
}
