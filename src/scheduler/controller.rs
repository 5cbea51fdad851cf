use super::{Group, JobHandle, JobScheduler};
use crate::error::{IndexError, Result};
use crate::population::IndexPopulationJob;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct RunningJob {
    job: Arc<IndexPopulationJob>,
    handle: Mutex<Option<JobHandle>>,
}

impl RunningJob {
    fn cancel(&self) {
        match self.handle.lock().as_ref() {
            Some(handle) => handle.cancel(),
            None => self.job.cancel(),
        }
    }

    fn await_stopped(&self, timeout: Duration) -> Result<()> {
        let handle = self.handle.lock().clone();
        match handle {
            Some(handle) => handle.await_termination(timeout),
            None if self.job.await_completion(timeout)? => Ok(()),
            None => Err(IndexError::Scheduler(format!(
                "population job did not stop within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Removes a job from the active set however its task ends.
struct Deregister {
    jobs: Arc<DashMap<u64, Arc<RunningJob>>>,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.jobs.remove(&self.id);
    }
}

/// Owns the running population jobs.
pub struct PopulationJobController {
    scheduler: Arc<dyn JobScheduler>,
    jobs: Arc<DashMap<u64, Arc<RunningJob>>>,
    next_id: AtomicU64,
    stop_timeout: Duration,
}

impl PopulationJobController {
    pub fn new(scheduler: Arc<dyn JobScheduler>, stop_timeout: Duration) -> Self {
        Self {
            scheduler,
            jobs: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            stop_timeout,
        }
    }

    /// Registers and schedules `job`. The job leaves the active set when
    /// it finishes, whatever the outcome.
    pub fn start_index_population(&self, job: Arc<IndexPopulationJob>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(RunningJob {
            job: Arc::clone(&job),
            handle: Mutex::new(None),
        });
        // Registered before scheduling so a fast job can remove itself
        self.jobs.insert(id, Arc::clone(&entry));

        let jobs = Arc::clone(&self.jobs);
        let runner = Arc::clone(&job);
        let task = Box::new(move || {
            let _registered = Deregister { jobs, id };
            if let Err(e) = runner.run() {
                warn!("Population job {} failed: {}", id, e);
            }
        });

        match self
            .scheduler
            .schedule(Group::IndexPopulation, &format!("index-population-{id}"), task)
        {
            Ok(handle) => {
                let cancelled = Arc::clone(&job);
                handle.on_cancel(move || cancelled.cancel());
                *entry.handle.lock() = Some(handle);
                Ok(id)
            }
            Err(e) => {
                self.jobs.remove(&id);
                job.engine().stop_all();
                Err(e)
            }
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Cancels every active job, then waits for each. A job that fails to
    /// stop does not prevent waiting for the others.
    pub fn stop(&self) -> Result<()> {
        let running: Vec<(u64, Arc<RunningJob>)> = self
            .jobs
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        if running.is_empty() {
            return Ok(());
        }
        info!("Stopping {} index population jobs", running.len());

        for (_, job) in &running {
            job.cancel();
        }

        let mut failures = Vec::new();
        for (id, job) in running {
            if let Err(e) = job.await_stopped(self.stop_timeout) {
                warn!("Population job {} did not stop: {}", id, e);
                failures.push(format!("job {id}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(IndexError::JobsNotStopped { failures })
        }
    }
}
