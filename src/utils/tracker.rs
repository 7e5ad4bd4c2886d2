//! Test-only introspection of scheduler decisions.

use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    CreateTask,
    Schedule,
    Steal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunTarget {
    /// Pushed onto a worker's own deque.
    Local(usize),
    /// Pushed onto the global injector.
    Injector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    CreateTask { worker: usize },
    Schedule { target: RunTarget },
    Steal { thief: Option<usize>, victim: usize },
}

/// Records every tracked scheduler call so tests can assert on routing
/// decisions instead of guessing from timing.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::CreateTask, Vec::new());
        map.insert(Method::Schedule, Vec::new());
        map.insert(Method::Steal, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
