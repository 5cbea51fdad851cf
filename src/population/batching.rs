//! Applying scan batches to populators, inline or on a worker pool.

use super::failure::catch_panic;
use super::multiple::{IndexPopulation, IndexPopulationEngine};
use super::{FlushMode, PopulationConfig};
use crate::error::{IndexError, Result};
use crate::types::{IndexEntryUpdate, IndexId};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// How batches reach the populators.
pub enum BatchFlusher {
    /// `add` runs on the scan thread.
    Inline,
    Concurrent(ConcurrentFlushPopulator),
}

impl BatchFlusher {
    pub fn new(config: &PopulationConfig) -> Result<Self> {
        Ok(match config.mode() {
            FlushMode::Inline => BatchFlusher::Inline,
            FlushMode::Concurrent => BatchFlusher::Concurrent(ConcurrentFlushPopulator::new(
                config.flush_workers,
                config.max_pending_flushes,
            )?),
        })
    }

    pub fn flush(
        &self,
        engine: &Arc<IndexPopulationEngine>,
        population: &Arc<IndexPopulation>,
        batch: Vec<IndexEntryUpdate>,
    ) {
        match self {
            BatchFlusher::Inline => {
                if let Err(e) = catch_panic(|| population.populator.add(batch)) {
                    engine.fail(population, e);
                }
            }
            BatchFlusher::Concurrent(pool) => {
                if let Err(e) = pool.do_flush(engine, population, batch) {
                    engine.fail(population, e);
                }
            }
        }
    }

    pub fn await_completion(&self, timeout: Duration) -> Result<()> {
        match self {
            BatchFlusher::Inline => Ok(()),
            BatchFlusher::Concurrent(pool) => pool.await_completion(timeout),
        }
    }

    pub fn shutdown(&self) {
        if let BatchFlusher::Concurrent(pool) = self {
            pool.shutdown();
        }
    }
}

#[derive(Debug, Clone)]
struct FlushTask {
    index: IndexId,
    batch_size: usize,
    submitted: Instant,
}

#[derive(Default)]
struct ActiveTasks {
    count: Mutex<usize>,
    changed: Condvar,
}

/// Flushes batches on a bounded rayon pool so the scan never waits for a
/// populator, unless too many flushes are already pending.
pub struct ConcurrentFlushPopulator {
    pool: rayon::ThreadPool,
    active: Arc<ActiveTasks>,
    in_flight: Arc<DashMap<u64, FlushTask>>,
    next_task: AtomicU64,
    max_pending: usize,
    shut_down: AtomicBool,
}

impl ConcurrentFlushPopulator {
    pub fn new(workers: usize, max_pending: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("index-flush-{idx}"))
            .panic_handler(|_| error!("Index flush worker panicked"))
            .build()?;
        Ok(Self {
            pool,
            active: Arc::new(ActiveTasks::default()),
            in_flight: Arc::new(DashMap::new()),
            next_task: AtomicU64::new(0),
            max_pending: max_pending.max(1),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn active_tasks(&self) -> usize {
        *self.active.count.lock()
    }

    /// Submits `batch` for `population`. Blocks while `max_pending` flushes
    /// are outstanding.
    pub fn do_flush(
        &self,
        engine: &Arc<IndexPopulationEngine>,
        population: &Arc<IndexPopulation>,
        batch: Vec<IndexEntryUpdate>,
    ) -> Result<()> {
        self.reserve()?;

        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            task_id,
            FlushTask {
                index: population.index_id(),
                batch_size: batch.len(),
                submitted: Instant::now(),
            },
        );

        let engine = Arc::clone(engine);
        let population = Arc::clone(population);
        let done = TaskDone {
            task_id,
            active: Arc::clone(&self.active),
            in_flight: Arc::clone(&self.in_flight),
        };
        self.pool.spawn(move || {
            let _done = done;
            if let Err(e) = catch_panic(|| population.populator.add(batch)) {
                engine.fail(&population, e);
            }
        });
        Ok(())
    }

    /// Takes a slot for one more flush, waiting for one to free up.
    fn reserve(&self) -> Result<()> {
        let mut count = self.active.count.lock();
        while *count >= self.max_pending {
            self.active.changed.wait(&mut count);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(IndexError::IllegalState(
                "index flush pool is shut down".into(),
            ));
        }
        *count += 1;
        Ok(())
    }

    /// Waits until no flush is outstanding.
    pub fn await_completion(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut count = self.active.count.lock();
        while *count > 0 {
            if self.active.changed.wait_until(&mut count, deadline).timed_out() && *count > 0 {
                let active = *count;
                drop(count);
                let diagnostics = self.diagnostics(active);
                error!("Timed out waiting for index flushes: {}", diagnostics);
                return Err(IndexError::FlushTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                    diagnostics,
                });
            }
        }
        Ok(())
    }

    fn diagnostics(&self, active: usize) -> String {
        let mut out = format!(
            "{} active flushes on {} workers;",
            active,
            self.pool.current_num_threads()
        );
        let mut tasks: Vec<(u64, FlushTask)> = self
            .in_flight
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        tasks.sort_by_key(|(id, _)| *id);
        for (id, task) in tasks {
            let _ = write!(
                out,
                " task {} index {} batch {} age {}ms;",
                id,
                task.index,
                task.batch_size,
                task.submitted.elapsed().as_millis()
            );
        }
        out
    }

    /// Refuses further flushes. Flushes already submitted still run.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        debug!(
            "Shutting down index flush pool with {} active flushes",
            self.active_tasks()
        );
    }
}

/// Decrements the active count however the task ends.
struct TaskDone {
    task_id: u64,
    active: Arc<ActiveTasks>,
    in_flight: Arc<DashMap<u64, FlushTask>>,
}

impl Drop for TaskDone {
    fn drop(&mut self) {
        self.in_flight.remove(&self.task_id);
        let mut count = self.active.count.lock();
        *count = count.saturating_sub(1);
        self.active.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_for_zero_workers() {
        let config = PopulationConfig::default().flush_workers(0);
        assert!(matches!(BatchFlusher::new(&config).unwrap(), BatchFlusher::Inline));
        let config = PopulationConfig::default().flush_workers(2);
        assert!(matches!(
            BatchFlusher::new(&config).unwrap(),
            BatchFlusher::Concurrent(_)
        ));
    }

    #[test]
    fn test_await_with_nothing_pending() {
        let pool = ConcurrentFlushPopulator::new(2, 4).unwrap();
        pool.await_completion(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.active_tasks(), 0);
    }

    #[test]
    fn test_timeout_reports_pending_tasks() {
        let pool = ConcurrentFlushPopulator::new(1, 4).unwrap();
        *pool.active.count.lock() += 1;
        pool.in_flight.insert(
            0,
            FlushTask {
                index: 42,
                batch_size: 100,
                submitted: Instant::now(),
            },
        );

        match pool.await_completion(Duration::from_millis(20)) {
            Err(IndexError::FlushTimeout { diagnostics, .. }) => {
                assert!(diagnostics.contains("index 42"));
                assert!(diagnostics.contains("batch 100"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Releasing the task unblocks waiters
        drop(TaskDone {
            task_id: 0,
            active: Arc::clone(&pool.active),
            in_flight: Arc::clone(&pool.in_flight),
        });
        pool.await_completion(Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn test_no_flush_after_shutdown() {
        let pool = ConcurrentFlushPopulator::new(1, 4).unwrap();
        pool.reserve().unwrap();
        *pool.active.count.lock() -= 1;

        pool.shutdown();
        assert!(matches!(pool.reserve(), Err(IndexError::IllegalState(_))));
        assert_eq!(pool.active_tasks(), 0);
    }
}
