//! Deferred work that waits on remote jobs.
//!
//! Callers register a continuation against a set of job ids. One background
//! worker polls the status of every outstanding id in a single batch query
//! per cycle and runs a registration's continuations once all of its ids
//! are terminal.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, error, info};

use crate::error::{ImportError, Result};
use crate::remote::{ApiResult, JobId, JobState, RemoteApi};

pub type Continuation = Box<dyn FnOnce() -> Result<()> + Send>;

/// Batch status query used by the worker.
pub type StatusFn = Arc<dyn Fn(&[JobId]) -> ApiResult<HashMap<JobId, JobState>> + Send + Sync>;

/// Poll interval schedule: starts at `initial`, grows by `step` after every
/// cycle without progress, never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            step: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn from_millis(initial: u64, step: u64, max: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial),
            step: Duration::from_millis(step),
            max: Duration::from_millis(max),
        }
    }

    fn next(&self, current: Duration) -> Duration {
        (current + self.step).min(self.max)
    }
}

#[derive(Default)]
struct State {
    /// Sorted id set -> continuations in registration order.
    table: IndexMap<Vec<JobId>, Vec<Continuation>>,
    shutdown: bool,
    running: bool,
    /// Set when the status query failed; cleared by `shutdown`.
    failure: Option<String>,
    registered: usize,
    completed: usize,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    workers: Mutex<Vec<JoinHandle<Result<()>>>>,
    status: StatusFn,
    backoff: Backoff,
}

/// Handle to the reactor. Clones share the same worker and table, so a
/// continuation may capture a clone and register follow-up work.
#[derive(Clone)]
pub struct TaskReactor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReactor")
            .field("backoff", &self.inner.backoff)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Continuations run outside the lock, so poisoning only follows a
        // panic in the reactor itself; the table is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<Result<()>>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskReactor {
    pub fn new(status: StatusFn, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                workers: Mutex::new(Vec::new()),
                status,
                backoff,
            }),
        }
    }

    /// Reactor polling `api` for job states.
    pub fn for_api(api: Arc<dyn RemoteApi>, backoff: Backoff) -> Self {
        Self::new(Arc::new(move |ids: &[JobId]| api.batch_status(ids)), backoff)
    }

    /// Run `continuation` once every job in `ids` is terminal. With no ids it
    /// runs right away on the calling thread and its result is returned.
    pub fn register<F>(&self, ids: Vec<JobId>, continuation: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if ids.is_empty() {
            return continuation();
        }
        let mut ids = ids;
        ids.sort();
        ids.dedup();

        let mut state = self.inner.lock();
        if let Some(failure) = &state.failure {
            return Err(ImportError::Reactor(failure.clone()));
        }
        debug!(jobs = %ids.join(","), "registered continuation");
        state
            .table
            .entry(ids)
            .or_default()
            .push(Box::new(continuation));
        state.registered += 1;

        if !state.running {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name("task-reactor".into())
                .spawn(move || work(&inner))?;
            state.running = true;
            self.inner.workers().push(handle);
        }
        drop(state);
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Wait until every registered continuation has run, then stop the
    /// worker. Returns the worker's error if the status query failed. The
    /// reactor can be used again afterwards.
    ///
    /// Must not be called from inside a continuation.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
        }
        self.inner.wake.notify_all();

        let mut outcome = Ok(());
        loop {
            let handles: Vec<_> = self.inner.workers().drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == thread::current().id() {
                    return Err(ImportError::Reactor(
                        "shutdown called from a continuation".into(),
                    ));
                }
                let joined = handle
                    .join()
                    .unwrap_or_else(|_| Err(ImportError::Reactor("worker panicked".into())));
                if outcome.is_ok() {
                    outcome = joined;
                }
            }
        }

        let mut state = self.inner.lock();
        state.shutdown = false;
        state.running = false;
        state.failure = None;
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Number of registrations still waiting.
    pub fn pending(&self) -> usize {
        self.inner.lock().table.len()
    }
}

fn work(inner: &Inner) -> Result<()> {
    let backoff = inner.backoff;
    let mut delay = backoff.initial;

    loop {
        let ids: Vec<JobId> = {
            let mut state = inner.lock();
            while state.table.is_empty() {
                if state.shutdown {
                    state.running = false;
                    return Ok(());
                }
                state = inner.wake.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            let union: IndexSet<&JobId> = state.table.keys().flatten().collect();
            union.into_iter().cloned().collect()
        };

        let statuses = match (inner.status)(&ids) {
            Ok(statuses) => statuses,
            Err(e) => {
                error!("querying status of {} jobs failed: {e}", ids.len());
                let mut state = inner.lock();
                let dropped = state.table.len();
                state.table.clear();
                state.running = false;
                state.failure = Some(e.to_string());
                if dropped > 0 {
                    error!("dropping {dropped} pending registrations");
                }
                return Err(ImportError::Reactor(e.to_string()));
            }
        };

        let ready: Vec<(Vec<JobId>, Vec<Continuation>)> = {
            let mut state = inner.lock();
            let done: Vec<Vec<JobId>> = state
                .table
                .keys()
                .filter(|key| {
                    key.iter()
                        .all(|id| statuses.get(id).is_some_and(|s| s.is_terminal()))
                })
                .cloned()
                .collect();
            done.iter()
                .filter_map(|key| state.table.shift_remove_entry(key))
                .collect()
        };

        let progressed = !ready.is_empty();
        let mut ran = 0;
        for (ids, continuations) in ready {
            debug!(jobs = %ids.join(","), count = continuations.len(), "jobs finished");
            for continuation in continuations {
                run_continuation(&ids, continuation);
                ran += 1;
            }
        }

        if progressed {
            delay = backoff.initial;
            let mut state = inner.lock();
            state.completed += ran;
            info!(
                "asynchronous tasks: {} of {} done",
                state.completed, state.registered
            );
        }
        let remaining = !inner.lock().table.is_empty();
        if remaining {
            thread::sleep(delay);
            delay = backoff.next(delay);
        }
    }
}

fn run_continuation(ids: &[JobId], continuation: Continuation) {
    match catch_unwind(AssertUnwindSafe(continuation)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("continuation for jobs {} failed: {e}", ids.join(",")),
        Err(_) => error!("continuation for jobs {} panicked", ids.join(",")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryApi;
    use std::time::Instant;

    fn fast() -> Backoff {
        Backoff::from_millis(2, 2, 10)
    }

    fn reactor(api: &Arc<MemoryApi>) -> TaskReactor {
        TaskReactor::for_api(api.clone(), fast())
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(
        log: &Arc<Mutex<Vec<String>>>,
        entry: &str,
    ) -> impl FnOnce() -> Result<()> + Send + 'static {
        let log = Arc::clone(log);
        let entry = entry.to_string();
        move || {
            log.lock().unwrap().push(entry);
            Ok(())
        }
    }

    fn wait_until(what: impl Fn() -> bool) {
        let started = Instant::now();
        while !what() {
            assert!(started.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn backoff_grows_to_cap() {
        let b = Backoff::from_millis(1000, 1000, 2500);
        assert_eq!(b.next(b.initial), Duration::from_millis(2000));
        assert_eq!(b.next(Duration::from_millis(2000)), Duration::from_millis(2500));
        assert_eq!(Backoff::default().max, Duration::from_secs(10));
    }

    #[test]
    fn empty_id_set_runs_synchronously_without_worker() {
        let api = Arc::new(MemoryApi::new());
        let reactor = reactor(&api);
        let entries = log();

        reactor.register(Vec::new(), push(&entries, "now")).unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["now"]);
        assert!(!reactor.is_running());

        let err = reactor
            .register(Vec::new(), || Err(ImportError::Reactor("boom".into())))
            .unwrap_err();
        assert_eq!(err.code(), "reactor_error");
        assert_eq!(api.calls("batch_status"), 0);
        reactor.shutdown().unwrap();
    }

    #[test]
    fn overlapping_registrations_fire_independently() {
        let api = Arc::new(MemoryApi::new());
        api.add_job("A", JobState::Running);
        api.add_job("B", JobState::Running);
        let reactor = reactor(&api);
        let entries = log();

        reactor.register(vec!["A".into()], push(&entries, "a")).unwrap();
        reactor
            .register(vec!["B".into(), "A".into()], push(&entries, "ab"))
            .unwrap();
        assert!(reactor.is_running());
        assert_eq!(reactor.pending(), 2);

        api.finish_job("A");
        wait_until(|| entries.lock().unwrap().len() == 1);
        let polls = api.calls("batch_status");
        wait_until(|| api.calls("batch_status") > polls + 2);
        assert_eq!(*entries.lock().unwrap(), vec!["a"]);

        api.finish_job("B");
        reactor.shutdown().unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["a", "ab"]);
        assert!(!reactor.is_running());
    }

    #[test]
    fn continuations_of_one_registration_keep_order_and_survive_failures() {
        let api = Arc::new(MemoryApi::new());
        api.add_job("A", JobState::Running);
        let reactor = reactor(&api);
        let entries = log();

        reactor.register(vec!["A".into()], push(&entries, "1")).unwrap();
        reactor
            .register(vec!["A".into()], || Err(ImportError::Reactor("bad".into())))
            .unwrap();
        reactor
            .register(vec!["A".into()], || panic!("continuation blew up"))
            .unwrap();
        reactor.register(vec!["A".into()], push(&entries, "2")).unwrap();
        assert_eq!(reactor.pending(), 1);

        api.finish_job("A");
        reactor.shutdown().unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn continuation_can_register_follow_up_work() {
        let api = Arc::new(MemoryApi::new());
        api.add_job("A", JobState::Stopped);
        api.add_job("B", JobState::Running);
        let reactor = reactor(&api);
        let entries = log();

        let chained = reactor.clone();
        let inner_log = Arc::clone(&entries);
        reactor
            .register(vec!["A".into()], move || {
                inner_log.lock().unwrap().push("first".into());
                chained.register(vec!["B".into()], push(&inner_log, "second"))
            })
            .unwrap();

        wait_until(|| entries.lock().unwrap().len() == 1);
        api.finish_job("B");
        reactor.shutdown().unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn shutdown_blocks_until_pending_work_ran() {
        let api = Arc::new(MemoryApi::new());
        api.add_job("A", JobState::Running);
        let reactor = reactor(&api);
        let entries = log();
        reactor.register(vec!["A".into()], push(&entries, "done")).unwrap();

        let finisher = {
            let api = Arc::clone(&api);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                api.finish_job("A");
            })
        };
        reactor.shutdown().unwrap();
        finisher.join().unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["done"]);
    }

    #[test]
    fn status_failure_is_fatal_and_reported_by_shutdown() {
        let api = Arc::new(MemoryApi::new());
        api.add_job("A", JobState::Running);
        api.fail_status_queries("connection refused");
        let reactor = reactor(&api);
        let entries = log();

        reactor.register(vec!["A".into()], push(&entries, "never")).unwrap();
        wait_until(|| !reactor.is_running());
        let err = reactor
            .register(vec!["A".into()], push(&entries, "never"))
            .unwrap_err();
        assert_eq!(err.code(), "reactor_error");

        let err = reactor.shutdown().unwrap_err();
        assert!(err.to_string().contains("connection refused"), "{err}");
        assert!(entries.lock().unwrap().is_empty());

        // Usable again after shutdown.
        reactor.register(Vec::new(), push(&entries, "sync")).unwrap();
        assert_eq!(*entries.lock().unwrap(), vec!["sync"]);
    }

    #[test]
    fn shutdown_without_registrations_is_a_noop() {
        let api = Arc::new(MemoryApi::new());
        reactor(&api).shutdown().unwrap();
    }
}
