//! Background job scheduling.
//!
//! Jobs run on one rayon pool per [`Group`]. Cancellation is cooperative:
//! a [`JobHandle`] runs the job's cancel hook, the job checks its own flag.

mod controller;

pub use controller::PopulationJobController;

use crate::error::{IndexError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Pool a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    IndexPopulation,
}

impl Group {
    pub fn name(&self) -> &'static str {
        match self {
            Group::IndexPopulation => "index-population",
        }
    }
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait JobScheduler: Send + Sync {
    fn schedule(&self, group: Group, name: &str, task: Task) -> Result<JobHandle>;
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct HandleState {
    name: String,
    done: Mutex<bool>,
    terminated: Condvar,
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// Handle to a scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<HandleState>,
}

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(HandleState {
                name: name.into(),
                done: Mutex::new(false),
                terminated: Condvar::new(),
                cancelled: AtomicBool::new(false),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Hook run by `cancel`. Runs at once if the handle is already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            hook();
            return;
        }
        *self.state.on_cancel.lock() = Some(Box::new(hook));
        // A cancel that raced the store above found no hook to run
        if self.is_cancelled() {
            if let Some(hook) = self.state.on_cancel.lock().take() {
                hook();
            }
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        let hook = self.state.on_cancel.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        *self.state.done.lock()
    }

    /// Marks the job finished and wakes waiters.
    pub fn complete(&self) {
        *self.state.done.lock() = true;
        self.state.terminated.notify_all();
    }

    pub fn await_termination(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.state.done.lock();
        while !*done {
            if self.state.terminated.wait_until(&mut done, deadline).timed_out() && !*done {
                return Err(IndexError::Scheduler(format!(
                    "job '{}' did not terminate within {} ms",
                    self.state.name,
                    timeout.as_millis()
                )));
            }
        }
        Ok(())
    }
}

/// Completes the handle however the task ends.
struct Completion(JobHandle);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.complete();
    }
}

/// Scheduler backed by one rayon pool per group, built on first use.
pub struct ThreadPoolScheduler {
    threads: usize,
    pools: DashMap<Group, Arc<rayon::ThreadPool>>,
}

impl ThreadPoolScheduler {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            pools: DashMap::new(),
        }
    }

    fn pool(&self, group: Group) -> Result<Arc<rayon::ThreadPool>> {
        if let Some(pool) = self.pools.get(&group) {
            return Ok(Arc::clone(pool.value()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(move |idx| format!("{}-{idx}", group.name()))
            .build()?;
        Ok(Arc::clone(
            self.pools.entry(group).or_insert_with(|| Arc::new(pool)).value(),
        ))
    }
}

impl JobScheduler for ThreadPoolScheduler {
    fn schedule(&self, group: Group, name: &str, task: Task) -> Result<JobHandle> {
        let pool = self.pool(group)?;
        let handle = JobHandle::new(name);
        let completion = Completion(handle.clone());
        let name = name.to_string();
        pool.spawn(move || {
            let _completion = completion;
            debug!("Job '{}' started", name);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Job '{}' panicked", name);
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scheduled_task_runs_and_terminates() {
        let scheduler = ThreadPoolScheduler::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = scheduler
            .schedule(Group::IndexPopulation, "count", Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        handle.await_termination(Duration::from_secs(5)).unwrap();
        assert!(handle.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_still_terminates() {
        let scheduler = ThreadPoolScheduler::new(1);
        let handle = scheduler
            .schedule(Group::IndexPopulation, "boom", Box::new(|| panic!("boom")))
            .unwrap();
        handle.await_termination(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_cancel_runs_hook_once() {
        let handle = JobHandle::new("job");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        handle.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());

        // Registered after cancel: runs immediately
        let c = Arc::clone(&calls);
        handle.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_await_times_out() {
        let handle = JobHandle::new("never");
        let err = handle.await_termination(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, IndexError::Scheduler(_)));
    }
}
