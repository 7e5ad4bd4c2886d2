//! Idle-worker parking.
//!
//! Workers that fail to find work park here; `run`, continuation
//! scheduling and `stop` signal the condvar. There is an unavoidable race
//! between a worker deciding to park and a producer signalling before it
//! does; the bounded park timeout turns a missed wakeup into bounded
//! latency instead of a hang.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct Idle {
    /// Number of currently parked workers.
    parked: Mutex<usize>,
    condvar: Condvar,
}

impl Idle {
    pub(crate) fn new() -> Self {
        Self {
            parked: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Parks the calling worker until signalled or `timeout` elapses.
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        let mut parked = self.parked.lock();
        *parked += 1;
        self.condvar.wait_for(&mut parked, timeout);
        *parked -= 1;
    }

    /// Wakes one parked worker, if any.
    pub(crate) fn unpark_one(&self) {
        // Taking the lock orders this signal against a worker that is
        // mid-way into `park_timeout`.
        let parked = self.parked.lock();
        if *parked > 0 {
            self.condvar.notify_one();
        }
    }

    /// Wakes every parked worker. Used on shutdown.
    pub(crate) fn unpark_all(&self) {
        let _parked = self.parked.lock();
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        *self.parked.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_times_out() {
        let idle = Idle::new();
        let start = Instant::now();
        idle.park_timeout(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(idle.parked_count(), 0);
    }

    #[test]
    fn test_unpark_one_wakes_parked_thread() {
        let idle = Arc::new(Idle::new());

        let parker = {
            let idle = Arc::clone(&idle);
            thread::spawn(move || {
                let start = Instant::now();
                idle.park_timeout(Duration::from_secs(10));
                start.elapsed()
            })
        };

        // Spin until the thread is actually parked, then signal.
        while idle.parked_count() == 0 {
            thread::yield_now();
        }
        idle.unpark_one();

        let parked_for = parker.join().expect("parker panicked");
        assert!(parked_for < Duration::from_secs(10));
    }

    #[test]
    fn test_unpark_one_without_parkers_is_noop() {
        let idle = Idle::new();
        idle.unpark_one();
        idle.unpark_all();
    }
}
