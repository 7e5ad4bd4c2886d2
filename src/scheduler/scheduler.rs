use crate::config::Config;
use crate::context;
use crate::scheduler::deque::{Deque, Steal};
use crate::scheduler::idle::Idle;
use crate::scheduler::pool::ThreadPool;
use crate::task::arena::Arena;
use crate::task::{TaskRef, TaskSlot};
#[cfg(test)]
use crate::utils::tracker::{Call, Method, RunTarget, Tracker};
use anyhow::Result;
use crossbeam_deque::{Injector, Steal as InjectorSteal};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// The worker whose arena receives allocations from threads outside the
/// pool. Fixed policy; see `create_task`.
const EXTERNAL_WORKER: usize = 0;

#[derive(Debug)]
pub struct Scheduler {
    pub(crate) cfg: Config,

    /// Process-unique instance id; guards thread-local worker identity
    /// against aliasing across scheduler instances.
    token: u64,

    /// One deque per worker. Index i is owned (push/pop) by worker i;
    /// everyone else only steals.
    pub(super) queues: Box<[Deque]>,

    /// One arena per worker. Index i is the allocation home of worker i;
    /// arena 0 additionally serves external threads.
    pub(super) arenas: Box<[Arena]>,

    /// Global queue for tasks submitted from outside the pool, and the
    /// spill target for a full worker deque.
    injector: Injector<TaskRef>,

    pub(super) idle: Idle,

    stopped: AtomicBool,

    pool: OnceLock<ThreadPool>,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Scheduler {
    pub(crate) fn new(cfg: Config) -> Self {
        let workers = cfg.worker_threads;
        let deque_capacity = cfg.max_tasks.next_power_of_two();

        Self {
            token: context::next_scheduler_token(),
            queues: (0..workers)
                .map(|_| Deque::with_capacity(deque_capacity))
                .collect(),
            arenas: (0..workers).map(|_| Arena::new(cfg.max_tasks)).collect(),
            injector: Injector::new(),
            idle: Idle::new(),
            stopped: AtomicBool::new(false),
            pool: OnceLock::new(),
            cfg,

            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    // Small price to pay to get introspection on scheduler decisions
    // during testing. Not compiled into release builds.
    #[cfg(test)]
    #[inline(always)]
    fn track(&self, method: Method, call: Call) {
        self.tracker.record(method, call);
    }
}

/// Cloneable handle to a running scheduler. All public operations live
/// here; worker threads hold one each, so the scheduler stays alive until
/// `stop` has joined them and the last user handle is dropped.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Scheduler>);

impl Handle {
    pub(crate) fn spawn_workers(&self) {
        self.pool.get_or_init(|| ThreadPool::new(self));
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Creates a task from `body`, allocated out of the current worker's
    /// arena, or worker 0's arena when called from outside the pool.
    ///
    /// If `parent` is given, the new task counts as unfinished work of the
    /// parent: the parent completes only after this task (and its own
    /// descendants) complete. The increment happens here, before the task
    /// can possibly be executed.
    ///
    /// The returned reference stays valid until the owning arena is next
    /// reset; at most `max_tasks` tasks may be live per arena.
    #[track_caller]
    pub fn create_task<F>(&self, body: F, parent: Option<TaskRef>) -> TaskRef
    where
        F: FnOnce(&Handle, TaskRef) + Send + 'static,
    {
        let worker = context::current_worker(self.token).unwrap_or(EXTERNAL_WORKER);

        let arena = &self.arenas[worker];
        let idx = arena.allocate();
        let task = TaskRef::new(worker, idx);

        arena.slot(idx as usize).init(Box::new(body), parent);

        if let Some(parent) = parent {
            let prev = self.slot(parent).add_child();
            debug_assert!(prev != 0, "cannot attach a child to a completed task");
        }

        #[cfg(test)]
        self.track(Method::CreateTask, Call::CreateTask { worker });

        task
    }

    /// Registers `continuation` to be scheduled when `ancestor` completes
    /// (its whole subtree finished).
    ///
    /// Must be called before `ancestor` is first run, and `continuation`
    /// itself must not be run directly; the scheduler runs it. At most 15
    /// continuations per task.
    #[track_caller]
    pub fn add_continuation(&self, ancestor: TaskRef, continuation: TaskRef) {
        debug_assert!(
            !self.slot(ancestor).is_scheduled(),
            "continuations must be attached before the ancestor is run"
        );

        self.slot(ancestor).push_continuation(continuation);
    }

    /// Enqueues `task` for execution: on the current worker's deque, or on
    /// the global injector from outside the pool. Running a task twice is
    /// API misuse.
    #[track_caller]
    pub fn run(&self, task: TaskRef) {
        let already = self.slot(task).mark_scheduled();
        debug_assert!(!already, "task was already run");

        self.schedule(task);
    }

    /// Blocks until `task` is complete.
    ///
    /// The calling thread participates in scheduling while it waits: a
    /// worker runs its regular fetch loop, an external thread drains the
    /// injector and steals from workers. Waiting on children from inside a
    /// task body therefore cannot deadlock, even on a single worker.
    pub fn wait(&self, task: TaskRef) {
        while !self.is_complete(task) {
            let next = match context::current_worker(self.token) {
                Some(id) => self.fetch_task(id),
                None => self.fetch_external(),
            };

            match next {
                Some(next) => self.run_to_completion(next),
                None => std::thread::yield_now(),
            }
        }
    }

    /// Whether `task`'s whole subtree has completed. Observing `true` also
    /// makes every side effect of the subtree's bodies visible.
    pub fn is_complete(&self, task: TaskRef) -> bool {
        self.slot(task).is_complete()
    }

    /// Stops the scheduler: signals every worker, joins their threads and
    /// resets all arenas. Idempotent; returns an error only if worker
    /// threads panicked.
    ///
    /// Must not be called from a worker thread (a worker cannot join
    /// itself).
    #[track_caller]
    pub fn stop(&self) -> Result<()> {
        debug_assert!(
            context::current_worker(self.token).is_none(),
            "stop must be called from outside the pool"
        );

        // Ensure the shutdown sequence runs once.
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("scheduler stopping");
        self.idle.unpark_all();

        let res = self
            .pool
            .get()
            .expect("thread pool not initialized")
            .join_all();

        // No worker is running anymore; rewind every arena.
        for arena in self.arenas.iter() {
            arena.reset();
        }

        res
    }

    /// Quiescence barrier: rewinds every arena's allocation cursor, but
    /// only if no task is live anywhere and all queues are empty. Returns
    /// whether the reset happened.
    ///
    /// Callers must not hold `TaskRef`s across a successful reset, and
    /// must not race this against task creation.
    pub fn try_reset_arenas(&self) -> bool {
        let quiescent = self.arenas.iter().all(Arena::is_quiescent)
            && self.queues.iter().all(Deque::is_empty)
            && self.injector.is_empty();

        if !quiescent {
            return false;
        }

        for arena in self.arenas.iter() {
            arena.reset();
        }

        debug!("arenas reset at quiescence");
        true
    }
}

// Internal scheduling machinery, shared between workers and waiting
// threads.
impl Handle {
    #[inline(always)]
    pub(crate) fn slot(&self, task: TaskRef) -> &TaskSlot {
        self.arenas[task.worker()].slot(task.slot())
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn park_current_worker(&self) {
        self.idle.park_timeout(self.cfg.park_timeout);
    }

    /// Routes a runnable task to the current worker's deque, or to the
    /// injector from outside the pool. Wakes one parked worker.
    fn schedule(&self, task: TaskRef) {
        match context::current_worker(self.token) {
            Some(id) => {
                if self.queues[id].push(task) {
                    #[cfg(test)]
                    self.track(
                        Method::Schedule,
                        Call::Schedule {
                            target: RunTarget::Local(id),
                        },
                    );
                } else {
                    // Spilling keeps the task runnable; dropping it would
                    // silently wedge every waiter on its subtree.
                    warn!(worker = id, "worker deque is full; spilling task to the injector");
                    debug_assert!(false, "worker deque over capacity");

                    self.injector.push(task);

                    #[cfg(test)]
                    self.track(
                        Method::Schedule,
                        Call::Schedule {
                            target: RunTarget::Injector,
                        },
                    );
                }
            }
            None => {
                self.injector.push(task);

                #[cfg(test)]
                self.track(
                    Method::Schedule,
                    Call::Schedule {
                        target: RunTarget::Injector,
                    },
                );
            }
        }

        self.idle.unpark_one();
    }

    /// Returns a runnable task for worker `id`, or `None` so the caller
    /// may park: local deque first, then the injector, then bounded random
    /// steal attempts against the other workers.
    pub(crate) fn fetch_task(&self, id: usize) -> Option<TaskRef> {
        if let Some(task) = self.queues[id].pop() {
            return Some(task);
        }

        self.take_injected()
            .or_else(|| self.steal_from_peers(Some(id)))
    }

    /// Work-finding procedure for threads outside the pool (waiting
    /// callers): injector, then steals. There is no local deque to pop.
    fn fetch_external(&self) -> Option<TaskRef> {
        self.take_injected().or_else(|| self.steal_from_peers(None))
    }

    fn take_injected(&self) -> Option<TaskRef> {
        loop {
            match self.injector.steal() {
                InjectorSteal::Success(task) => return Some(task),
                InjectorSteal::Retry => continue,
                InjectorSteal::Empty => return None,
            }
        }
    }

    /// Up to `max_steal_retries` attempts against victims picked uniformly
    /// at random, excluding the thief itself.
    fn steal_from_peers(&self, thief: Option<usize>) -> Option<TaskRef> {
        let candidates = self.queues.len() - thief.map_or(0, |_| 1);
        if candidates == 0 {
            return None;
        }

        for _ in 0..self.cfg.max_steal_retries {
            let mut victim = fastrand::usize(..candidates);
            if let Some(thief) = thief {
                if victim >= thief {
                    victim += 1;
                }
            }

            if let Steal::Success(task) = self.queues[victim].steal() {
                #[cfg(test)]
                self.track(Method::Steal, Call::Steal { thief, victim });

                return Some(task);
            }
        }

        None
    }

    pub(crate) fn run_to_completion(&self, task: TaskRef) {
        self.execute(task);
        self.finish(task);
    }

    /// Invokes the task body. A panicking body is logged and considered to
    /// have run; one failing task must not take down the pool.
    fn execute(&self, task: TaskRef) {
        let slot = self.slot(task);

        let already = slot.mark_executed();
        debug_assert!(!already, "task fetched for execution twice");

        let Some(body) = slot.take_body() else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| body(self, task))).is_err() {
            warn!(?task, "task body panicked; treating the task as completed");
        }
    }

    /// Retires one unit of `task`'s unfinished work. On reaching zero the
    /// task is complete: its continuations are released and the completion
    /// propagates into the parent, transitively: a parent completes only
    /// after all of its descendants have.
    pub(crate) fn finish(&self, task: TaskRef) {
        let slot = self.slot(task);

        let prev = slot.retire_one();
        debug_assert!(prev != 0, "finish on a task that is already complete");
        if prev != 1 {
            // Children still outstanding.
            return;
        }

        // The continuation list is frozen now: attachments are restricted
        // to before the ancestor was run.
        let continuations = slot.continuation_count();
        for idx in 0..continuations {
            let continuation = slot.continuation(idx);

            let already = self.slot(continuation).mark_scheduled();
            debug_assert!(!already, "continuation was separately run");

            self.schedule(continuation);
        }

        self.arenas[task.worker()].task_retired();

        if let Some(parent) = slot.parent() {
            self.finish(parent);
        }
    }
}

#[doc(hidden)]
impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
