use crate::scheduler::{Handle, Scheduler};
use anyhow::{anyhow, Result};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Default number of task records per worker arena.
const MAX_TASKS: usize = 4096;

/// How many failed steal attempts before a worker gives up and parks.
const MAX_STEAL_RETRIES: usize = 8;

/// Upper bound on how long a worker stays parked without being signalled.
/// Bounds the window of the inherent signal/park race so a missed wakeup
/// can never wedge the pool.
const PARK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|id| format!("spindle-worker-{}", id)))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself is not printable, show a placeholder.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads. Each worker owns one deque and one
    /// arena, so this is also the number of each.
    ///
    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Task records per worker arena. At most this many live tasks may
    /// exist per worker between arena resets; the scheduler cannot recover
    /// from overflow, so size generously.
    max_tasks: usize,

    /// Name fn used for threads spawned by the scheduler.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the scheduler.
    thread_stack_size: Option<usize>,

    /// Failed steal attempts before a worker parks.
    max_steal_retries: usize,

    /// Maximum parked duration without a signal.
    park_timeout: Duration,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            max_tasks: MAX_TASKS,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            park_timeout: PARK_TIMEOUT,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "Worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the number of task records in each worker's arena.
    ///
    /// Rounded up to a power of two for the deque backing each worker.
    ///
    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn max_tasks(mut self, val: usize) -> Self {
        assert!(val > 0, "max_tasks cannot be set to 0");
        self.max_tasks = val;
        self
    }

    /// Sets the name of threads spawned by the scheduler.
    ///
    /// The default name is "spindle-worker-{id}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// scheduler. The function receives the 0-based worker id.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies a minimal stack size.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets how many failed steal attempts a worker makes before parking.
    ///
    /// Higher values trade idle CPU for lower wakeup latency under bursty
    /// load.
    ///
    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    pub fn park_timeout(mut self, val: Duration) -> Self {
        self.park_timeout = val;
        self
    }

    /// Builds the configured scheduler and spawns its worker threads.
    ///
    /// The returned [`Handle`] is ready to accept tasks; it is cheap to
    /// clone and may be shared across threads.
    pub fn try_build(self) -> Result<Handle> {
        let cfg: Config = self.try_into()?;
        let handle = Scheduler::new(cfg).into_handle();
        handle.spawn_workers();
        Ok(handle)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// Export the builder as a Config object to be consumed by the scheduler and
// its workers.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) worker_threads: usize,
    pub(crate) max_tasks: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) max_steal_retries: usize,
    pub(crate) park_timeout: Duration,
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow!("worker_threads must be greater than 0"));
        }

        if self.max_tasks == 0 {
            return Err(anyhow!("max_tasks must be greater than 0"));
        }

        if self.park_timeout.is_zero() {
            return Err(anyhow!("park_timeout must be non-zero"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for Config {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = builder
            .worker_threads
            .unwrap_or(thread::available_parallelism()?.get());

        let cfg = Config {
            worker_threads,
            max_tasks: builder.max_tasks,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            max_steal_retries: builder.max_steal_retries,
            park_timeout: builder.park_timeout,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // Config is cloned into every spawned worker thread.
    assert_impl_all!(Config: Send, Sync, Clone);

    #[test]
    fn test_defaults() -> Result<()> {
        let cfg: Config = Builder::new().try_into()?;
        assert!(cfg.worker_threads >= 1);
        assert_eq!(cfg.max_tasks, MAX_TASKS);
        assert_eq!(cfg.max_steal_retries, MAX_STEAL_RETRIES);
        assert_eq!(cfg.park_timeout, PARK_TIMEOUT);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "Worker threads cannot be set to 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }

    #[test]
    #[should_panic(expected = "max_tasks cannot be set to 0")]
    fn test_zero_max_tasks_panics() {
        let _ = Builder::new().max_tasks(0);
    }

    #[test]
    fn test_thread_name_fn() -> Result<()> {
        let cfg: Config = Builder::new()
            .thread_name_fn(|id| format!("gateway-task-{}", id))
            .try_into()?;
        assert_eq!(cfg.thread_name.0(3), "gateway-task-3");
        Ok(())
    }
}
