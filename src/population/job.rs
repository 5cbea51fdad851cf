use super::failure::catch_panic;
use super::multiple::{IndexPopulation, IndexPopulationEngine};
use super::traits::{IndexPopulator, IndexStoreView, StoreScan};
use crate::error::Result;
use crate::proxy::{
    FailedIndexProxyFactory, FlipTarget, FlippableIndexProxy, IndexBehavior, PopulatingIndex,
};
use crate::schema::IndexDescriptor;
use crate::types::{IndexEntryUpdate, PopulationProgress};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Background job populating one or more indexes from a single scan.
///
/// `run` creates the populators, scans the store and flips every target that
/// survived. It always releases the engine and signals completion, whether
/// it succeeded, failed or was cancelled.
pub struct IndexPopulationJob {
    engine: Arc<IndexPopulationEngine>,
    store: Arc<dyn IndexStoreView>,
    verify_before_flipping: bool,
    scan: Mutex<Option<Arc<dyn StoreScan>>>,
    cancelled: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl IndexPopulationJob {
    pub fn new(
        engine: Arc<IndexPopulationEngine>,
        store: Arc<dyn IndexStoreView>,
        verify_before_flipping: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            verify_before_flipping,
            scan: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        })
    }

    pub fn engine(&self) -> &Arc<IndexPopulationEngine> {
        &self.engine
    }

    /// Registers a target and puts its proxy into the populating behavior.
    /// `flip_target` builds the behavior it gets once populated.
    pub fn add_population(
        self: &Arc<Self>,
        descriptor: IndexDescriptor,
        populator: Arc<dyn IndexPopulator>,
        flipper: Arc<FlippableIndexProxy>,
        flip_target: FlipTarget,
    ) -> Result<Arc<IndexPopulation>> {
        let failed = FailedIndexProxyFactory::new(descriptor.id, Arc::clone(&populator));
        let population =
            self.engine
                .add_populator(descriptor, populator, Arc::clone(&flipper), failed)?;
        flipper.flip_to(IndexBehavior::Populating(PopulatingIndex::new(self, &population)));
        flipper.set_flip_target(flip_target);
        Ok(population)
    }

    pub fn run(&self) -> Result<()> {
        let result = catch_panic(|| self.populate());
        if let Err(e) = &result {
            error!("Failed to populate indexes: {}", e);
            self.engine.cancel(e);
        }
        self.engine.close();
        self.signal_done();
        result
    }

    fn populate(&self) -> Result<()> {
        if !self.engine.has_populators() || self.is_cancelled() {
            self.engine.stop_all();
            return Ok(());
        }

        let started = Instant::now();
        self.engine.create();
        self.engine.reset_index_counts();

        let scan = self.engine.index_all_entities(self.store.as_ref());
        *self.scan.lock() = Some(Arc::clone(&scan));
        // A cancel that raced the line above could not stop the scan
        if self.is_cancelled() {
            self.engine.stop_all();
            return Ok(());
        }

        scan.run(&self.engine.external_updates())?;
        if self.is_cancelled() {
            self.engine.stop_all();
            return Ok(());
        }

        self.engine.flush_all()?;
        self.engine.flip_after_store_scan(self.verify_before_flipping);
        info!(
            "Index population job finished in {} ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Stops the scan. Remaining targets are closed without being flipped.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(scan) = self.scan.lock().as_ref() {
            scan.stop();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn signal_done(&self) {
        *self.done.lock() = true;
        self.done_signal.notify_all();
    }

    /// Returns whether the job finished within `timeout`.
    pub fn await_completion(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_signal.wait_until(&mut done, deadline).timed_out() {
                return Ok(*done);
            }
        }
        Ok(true)
    }

    pub fn progress(&self) -> PopulationProgress {
        if self.is_done() {
            return PopulationProgress::DONE;
        }
        self.scan
            .lock()
            .as_ref()
            .map(|scan| scan.progress())
            .unwrap_or(PopulationProgress::NONE)
    }

    /// Queues an update from a live transaction for a populating index.
    pub fn queue_update(&self, update: IndexEntryUpdate) {
        self.engine.queue_update(update);
    }

    /// Drops one target. The job is cancelled once no target remains.
    pub fn drop_population(&self, population: &Arc<IndexPopulation>) -> Result<()> {
        let result = self.engine.cancel_population(population);
        self.cancel_if_empty();
        result
    }

    /// Closes one target without dropping its storage.
    pub fn stop_population(&self, population: &Arc<IndexPopulation>) -> Result<()> {
        let result = self.engine.stop_population(population);
        self.cancel_if_empty();
        result
    }

    fn cancel_if_empty(&self) {
        if !self.engine.has_populators() {
            self.cancel();
        }
    }
}
