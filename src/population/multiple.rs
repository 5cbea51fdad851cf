//! Multi-index population engine.
//!
//! One store scan feeds every registered target. Scanned entities are turned
//! into per-target updates by the [`SchemaMatcher`] and collected into batches
//! that are flushed to the populators. Updates committed by live transactions
//! meanwhile are queued and interleaved into the scan by cursor position.
//!
//! A failure only ever affects its own target: it is removed from the active
//! set and flipped to failed while the scan and the other targets continue.

use super::batching::BatchFlusher;
use super::failure::{catch_panic, IndexPopulationFailure};
use super::queue::{ConcurrentUpdateQueue, ScanCursor};
use super::traits::{
    EntityVisitor, ExternalUpdatesCheck, IndexPopulator, IndexStoreView, IndexUpdater,
    ScanFilter, StoreScan,
};
use super::PopulationConfig;
use crate::error::{IndexError, Result};
use crate::proxy::{FailedIndexProxyFactory, FlippableIndexProxy};
use crate::schema::{IndexDescriptor, SchemaMatcher};
use crate::stats::IndexStatisticsStore;
use crate::types::{EntityType, EntityUpdates, IndexEntryUpdate, IndexId};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Entries collected for one target between flushes.
#[derive(Debug, Default)]
pub struct PopulationBatch {
    updates: Vec<IndexEntryUpdate>,
    bytes: usize,
}

impl PopulationBatch {
    pub fn push(&mut self, update: IndexEntryUpdate) {
        self.bytes += update.rough_size();
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Hands the entries off and leaves an empty batch behind.
    pub fn take(&mut self) -> Vec<IndexEntryUpdate> {
        self.bytes = 0;
        std::mem::take(&mut self.updates)
    }

    pub fn clear(&mut self) {
        self.bytes = 0;
        self.updates = Vec::new();
    }
}

const ONGOING: u8 = 0;
const COMPLETED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

/// One target under construction.
pub struct IndexPopulation {
    pub descriptor: IndexDescriptor,
    pub(crate) populator: Arc<dyn IndexPopulator>,
    pub(crate) flipper: Arc<FlippableIndexProxy>,
    failed_factory: FailedIndexProxyFactory,
    user_description: String,
    batch: Mutex<PopulationBatch>,
    // Serializes create, cancel and flip for this target only.
    populator_lock: ReentrantMutex<()>,
    // Whoever moves this away from ONGOING owns the populator's shutdown.
    status: AtomicU8,
}

impl IndexPopulation {
    pub fn index_id(&self) -> IndexId {
        self.descriptor.id
    }

    pub fn user_description(&self) -> &str {
        &self.user_description
    }

    pub fn is_ongoing(&self) -> bool {
        self.status.load(Ordering::Acquire) == ONGOING
    }

    pub fn is_failed(&self) -> bool {
        self.status.load(Ordering::Acquire) == FAILED
    }

    pub fn pending_batch_size(&self) -> usize {
        self.batch.lock().len()
    }

    fn claim(&self, to: u8) -> std::result::Result<(), u8> {
        self.status
            .compare_exchange(ONGOING, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Appends to the batch. Returns whether the batch should be flushed now.
    fn batch_update(&self, update: IndexEntryUpdate, config: &PopulationConfig) -> bool {
        let mut batch = self.batch.lock();
        batch.push(update);
        batch.len() >= config.batch_size || batch.byte_size() >= config.batch_max_byte_size
    }

    fn take_batch(&self) -> Vec<IndexEntryUpdate> {
        self.batch.lock().take()
    }

    fn clear_batch(&self) {
        self.batch.lock().clear();
    }
}

/// Scans the store once on behalf of many targets.
pub struct IndexPopulationEngine {
    config: PopulationConfig,
    entity_type: EntityType,
    populations: RwLock<Vec<Arc<IndexPopulation>>>,
    queue: ConcurrentUpdateQueue,
    matcher: Arc<dyn SchemaMatcher>,
    stats: Arc<IndexStatisticsStore>,
    flusher: BatchFlusher,
}

impl IndexPopulationEngine {
    pub fn new(
        config: PopulationConfig,
        entity_type: EntityType,
        matcher: Arc<dyn SchemaMatcher>,
        stats: Arc<IndexStatisticsStore>,
    ) -> Result<Arc<Self>> {
        let flusher = BatchFlusher::new(&config)?;
        Ok(Arc::new(Self {
            config,
            entity_type,
            populations: RwLock::new(Vec::new()),
            queue: ConcurrentUpdateQueue::new(),
            matcher,
            stats,
            flusher,
        }))
    }

    pub fn config(&self) -> &PopulationConfig {
        &self.config
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Registers a target. Its proxy is expected to be populating.
    pub fn add_populator(
        &self,
        descriptor: IndexDescriptor,
        populator: Arc<dyn IndexPopulator>,
        flipper: Arc<FlippableIndexProxy>,
        failed_factory: FailedIndexProxyFactory,
    ) -> Result<Arc<IndexPopulation>> {
        if descriptor.schema.entity_type != self.entity_type {
            return Err(IndexError::IllegalState(format!(
                "index {} targets {:?}, population scans {:?}",
                descriptor.id, descriptor.schema.entity_type, self.entity_type
            )));
        }
        let population = Arc::new(IndexPopulation {
            user_description: descriptor.user_description(),
            descriptor,
            populator,
            flipper,
            failed_factory,
            batch: Mutex::new(PopulationBatch::default()),
            populator_lock: ReentrantMutex::new(()),
            status: AtomicU8::new(ONGOING),
        });
        self.populations.write().push(Arc::clone(&population));
        Ok(population)
    }

    /// Snapshot of the targets still being populated.
    pub fn populations(&self) -> Vec<Arc<IndexPopulation>> {
        self.populations.read().clone()
    }

    pub fn has_populators(&self) -> bool {
        !self.populations.read().is_empty()
    }

    pub fn population(&self, index: IndexId) -> Option<Arc<IndexPopulation>> {
        self.populations
            .read()
            .iter()
            .find(|p| p.index_id() == index)
            .cloned()
    }

    fn remove(&self, population: &Arc<IndexPopulation>) -> bool {
        let mut populations = self.populations.write();
        let before = populations.len();
        populations.retain(|p| !Arc::ptr_eq(p, population));
        populations.len() != before
    }

    /// Tells every populator to create its storage. A populator that fails
    /// to create fails its own target only.
    pub fn create(&self) {
        for population in self.populations() {
            let result = {
                let _lock = population.populator_lock.lock();
                if population.is_ongoing() {
                    info!("Index population started: [{}]", population.user_description);
                    catch_panic(|| population.populator.create())
                } else {
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.fail(&population, e);
            }
        }
    }

    pub fn reset_index_counts(&self) {
        for population in self.populations() {
            self.stats.reset(population.index_id());
        }
    }

    /// Starts a scan over every entity relevant to at least one target.
    /// The scan runs when the returned handle's `run` is called.
    pub fn index_all_entities(self: &Arc<Self>, store: &dyn IndexStoreView) -> Arc<dyn StoreScan> {
        let filter = {
            let populations = self.populations.read();
            ScanFilter::for_descriptors(self.entity_type, populations.iter().map(|p| &p.descriptor))
        };
        let visitor = Arc::new(PopulationVisitor {
            engine: Arc::clone(self),
        });
        store.visit_entities(filter, visitor)
    }

    /// Handle the scan calls between batches.
    pub fn external_updates(self: &Arc<Self>) -> PopulationUpdatesCheck {
        PopulationUpdatesCheck {
            engine: Arc::clone(self),
        }
    }

    /// Queues an update committed while the scan runs.
    pub fn queue_update(&self, update: IndexEntryUpdate) {
        self.queue.push(update);
    }

    pub fn queued_updates(&self) -> usize {
        self.queue.len()
    }

    pub fn need_to_apply_external_updates(&self) -> bool {
        self.queue
            .needs_drain(self.config.queue_threshold, self.config.batch_max_byte_size)
    }

    /// Flushes all batches, waits for them, then applies queued updates the
    /// scan has already passed.
    pub fn apply_external_updates(self: &Arc<Self>, cursor: ScanCursor) -> Result<()> {
        self.flush_all()?;
        for (population, cause) in self.drain_queue(cursor) {
            self.fail(&population, cause);
        }
        Ok(())
    }

    /// Turns scanned entities into per-target updates and batches them.
    fn add_entities(self: &Arc<Self>, entities: Vec<EntityUpdates>) {
        let populations = self.populations();
        let active: Vec<&Arc<IndexPopulation>> =
            populations.iter().filter(|p| p.is_ongoing()).collect();
        if active.is_empty() {
            return;
        }
        let descriptors: Vec<&IndexDescriptor> = active.iter().map(|p| &p.descriptor).collect();
        let by_id: AHashMap<IndexId, &Arc<IndexPopulation>> =
            active.iter().map(|p| (p.index_id(), *p)).collect();

        for entity in &entities {
            for update in self.matcher.index_updates(entity, &descriptors) {
                let Some(population) = by_id.get(&update.index_id) else {
                    continue;
                };
                if !population.is_ongoing() {
                    continue;
                }
                let sampled = catch_panic(|| {
                    population.populator.include_sample(&update);
                    Ok(())
                });
                if let Err(e) = sampled {
                    self.fail(population, e);
                    continue;
                }
                if population.batch_update(update, &self.config) {
                    self.flush(population);
                }
            }
        }
    }

    /// Hands the target's batch to the flusher.
    pub fn flush(self: &Arc<Self>, population: &Arc<IndexPopulation>) {
        let batch = population.take_batch();
        if batch.is_empty() || !population.is_ongoing() {
            return;
        }
        self.flusher.flush(self, population, batch);
    }

    /// Flushes every pending batch and waits for all flushes to land.
    pub fn flush_all(self: &Arc<Self>) -> Result<()> {
        for population in self.populations() {
            self.flush(&population);
        }
        self.flusher
            .await_completion(self.config.await_timeout())
            .map_err(|e| self.with_pending_batches(e))
    }

    fn with_pending_batches(&self, err: IndexError) -> IndexError {
        match err {
            IndexError::FlushTimeout { waited_ms, mut diagnostics } => {
                for population in self.populations() {
                    let _ = write!(
                        diagnostics,
                        "; index {} pending batch {}",
                        population.index_id(),
                        population.pending_batch_size()
                    );
                }
                IndexError::FlushTimeout { waited_ms, diagnostics }
            }
            other => other,
        }
    }

    /// Applies queued updates whose entity the scan has passed. Returns the
    /// targets that failed while applying.
    fn drain_queue(&self, cursor: ScanCursor) -> Vec<(Arc<IndexPopulation>, IndexError)> {
        let by_id: AHashMap<IndexId, Arc<IndexPopulation>> = self
            .populations()
            .into_iter()
            .filter(|p| p.is_ongoing())
            .map(|p| (p.index_id(), p))
            .collect();

        let mut updaters: AHashMap<IndexId, Box<dyn IndexUpdater>> = AHashMap::new();
        let mut failed: AHashSet<IndexId> = AHashSet::new();
        let mut failures = Vec::new();
        let mut left_to_scan = 0usize;

        let drained = self.queue.drain(|update| {
            if !cursor.has_passed(update.entity_id) {
                left_to_scan += 1;
                return;
            }
            let index = update.index_id;
            let Some(population) = by_id.get(&index) else {
                return;
            };
            if failed.contains(&index) {
                return;
            }
            let updater = match updaters.entry(index) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(v) => {
                    match catch_panic(|| population.populator.new_populating_updater()) {
                        Ok(updater) => v.insert(updater),
                        Err(e) => {
                            failed.insert(index);
                            failures.push((Arc::clone(population), e));
                            return;
                        }
                    }
                }
            };
            let processed = catch_panic(|| {
                population.populator.include_sample(&update);
                updater.process(update)
            });
            if let Err(e) = processed {
                failed.insert(index);
                updaters.remove(&index);
                failures.push((Arc::clone(population), e));
            }
        });

        for (index, updater) in updaters {
            if let Err(e) = catch_panic(|| updater.close()) {
                if let Some(population) = by_id.get(&index) {
                    failures.push((Arc::clone(population), e));
                }
            }
        }

        if drained > 0 {
            debug!(
                "Drained {} concurrent updates at {:?}, {} left to the scan",
                drained, cursor, left_to_scan
            );
        }
        failures
    }

    /// Flips every remaining target after the scan. Targets that fail to
    /// flip are failed individually.
    pub fn flip_after_store_scan(&self, verify_before_flipping: bool) {
        for population in self.populations() {
            if !population.is_ongoing() {
                continue;
            }
            if let Err(e) = catch_panic(|| population.populator.scan_completed()) {
                self.fail(&population, e);
                continue;
            }
            self.flip(&population, verify_before_flipping);
        }
    }

    fn flip(&self, population: &Arc<IndexPopulation>, verify: bool) {
        // Failures of other targets found while draining are handled after
        // this proxy's write lock is released.
        let mut deferred: Vec<(Arc<IndexPopulation>, IndexError)> = Vec::new();

        let result = population.flipper.flip(
            || catch_panic(|| {
                let _lock = population.populator_lock.lock();
                if !population.is_ongoing() {
                    return Ok(false);
                }
                let mut own_failure = None;
                for (target, cause) in self.drain_queue(ScanCursor::End) {
                    if Arc::ptr_eq(&target, population) {
                        own_failure.get_or_insert(cause);
                    } else {
                        deferred.push((target, cause));
                    }
                }
                if let Some(cause) = own_failure {
                    return Err(cause);
                }
                if verify {
                    population.populator.verify_deferred_constraints()?;
                }
                self.stats
                    .replace(population.index_id(), population.populator.sample_result());
                population.populator.close(true)?;
                Ok(population.claim(COMPLETED).is_ok())
            }),
            &population.failed_factory,
        );

        match result {
            Ok(true) => {
                self.remove(population);
                population.clear_batch();
                info!("Index creation finished for index [{}].", population.user_description);
            }
            Ok(false) => {}
            Err(IndexError::ProxyAlreadyClosed(index)) => {
                debug!("Index {} was closed before it could be flipped", index);
            }
            Err(e) => self.fail(population, e),
        }

        for (target, cause) in deferred {
            self.fail(&target, cause);
        }
    }

    /// Fails one target. Does nothing if the target already completed,
    /// failed or was cancelled.
    pub fn fail(&self, population: &Arc<IndexPopulation>, cause: IndexError) {
        if population.claim(FAILED).is_err() {
            return;
        }
        self.remove(population);

        let failure = IndexPopulationFailure::new(cause);
        error!(
            "Failed to populate index: [{}]: {}",
            population.user_description,
            failure.as_string()
        );

        population
            .flipper
            .flip_to(population.failed_factory.create(failure.clone()));
        population.clear_batch();

        if let Err(e) = population.populator.mark_as_failed(&failure.as_string()) {
            error!(
                "Unable to mark index as failed [{}]: {}",
                population.user_description, e
            );
        }
        if let Err(e) = population.populator.close(false) {
            error!(
                "Unable to close failed populator for index [{}]: {}",
                population.user_description, e
            );
        }
    }

    /// Fails every remaining target with a job-level cause.
    pub fn cancel(&self, cause: &IndexError) {
        for population in self.populations() {
            let cause = IndexError::PopulationFailed {
                index: population.index_id(),
                cause: Box::new(cause.clone()),
            };
            self.fail(&population, cause);
        }
    }

    /// Removes a target dropped while populating and drops its storage.
    pub fn cancel_population(&self, population: &Arc<IndexPopulation>) -> Result<()> {
        self.disconnect(population, true)
    }

    /// Removes a target closed while populating; its storage is kept.
    pub fn stop_population(&self, population: &Arc<IndexPopulation>) -> Result<()> {
        self.disconnect(population, false)
    }

    /// Stops every remaining target without flipping it.
    pub fn stop_all(&self) {
        for population in self.populations() {
            if let Err(e) = self.stop_population(&population) {
                warn!(
                    "Unable to close populator for index [{}]: {}",
                    population.user_description, e
                );
            }
        }
    }

    fn disconnect(&self, population: &Arc<IndexPopulation>, drop_storage: bool) -> Result<()> {
        let _lock = population.populator_lock.lock();
        match population.claim(CANCELLED) {
            Ok(()) => {
                self.remove(population);
                population.clear_batch();
                self.stats.remove(population.index_id());
                if drop_storage {
                    population.populator.drop_index()
                } else {
                    population.populator.close(false)
                }
            }
            // A failed target's storage is still there to drop
            Err(FAILED) if drop_storage => population.populator.drop_index(),
            Err(_) => Ok(()),
        }
    }

    /// Waits for outstanding flushes and releases the flush workers.
    pub fn close(&self) {
        if let Err(e) = self.flusher.await_completion(self.config.await_timeout()) {
            error!("Index population closed with flushes outstanding: {}", e);
        }
        self.flusher.shutdown();
    }
}

/// Feeds scanned entities into the engine.
struct PopulationVisitor {
    engine: Arc<IndexPopulationEngine>,
}

impl EntityVisitor for PopulationVisitor {
    fn visit(&self, batch: Vec<EntityUpdates>) -> Result<()> {
        self.engine.add_entities(batch);
        Ok(())
    }
}

/// Lets the scan interleave queued updates between its batches.
pub struct PopulationUpdatesCheck {
    engine: Arc<IndexPopulationEngine>,
}

impl ExternalUpdatesCheck for PopulationUpdatesCheck {
    fn need_to_apply_external_updates(&self) -> bool {
        self.engine.need_to_apply_external_updates()
    }

    fn apply_external_updates(&self, cursor: ScanCursor) -> Result<()> {
        self.engine.apply_external_updates(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryIndexProvider, InMemoryStoreView};
    use crate::population::{IndexProvider, FlushMode};
    use crate::proxy::{IndexBehavior, IndexProxy, RecoveringIndex};
    use crate::schema::{PropertySchemaMatcher, SchemaDescriptor};
    use crate::types::InternalIndexState;
    use serde_json::json;

    fn engine(mode: FlushMode) -> Arc<IndexPopulationEngine> {
        let config = PopulationConfig::default()
            .flush_mode(mode)
            .batch_size(4)
            .queue_threshold(3);
        IndexPopulationEngine::new(
            config,
            EntityType::Node,
            Arc::new(PropertySchemaMatcher),
            Arc::new(IndexStatisticsStore::new()),
        )
        .unwrap()
    }

    fn add_target(
        engine: &IndexPopulationEngine,
        provider: &InMemoryIndexProvider,
        id: IndexId,
    ) -> Arc<IndexPopulation> {
        let desc = IndexDescriptor::new(id, format!("idx_{id}"), SchemaDescriptor::for_nodes(&[1], &[id as u32]));
        let populator = provider.populator(&desc).unwrap();
        let accessor = provider.online_accessor(&desc).unwrap();
        let flipper = Arc::new(FlippableIndexProxy::new(
            desc.clone(),
            IndexBehavior::Recovering(RecoveringIndex::new(id)),
        ));
        flipper.set_flip_target(Box::new(move || {
            Ok(IndexBehavior::Online(crate::proxy::OnlineIndex::new(accessor)))
        }));
        let factory = FailedIndexProxyFactory::new(id, Arc::clone(&populator));
        engine.add_populator(desc, populator, flipper, factory).unwrap()
    }

    fn store_with(entities: u64) -> InMemoryStoreView {
        let store = InMemoryStoreView::new();
        for id in 0..entities {
            store
                .create(id, EntityType::Node, &[1], vec![(1, json!(format!("v{}", id % 5)))])
                .unwrap();
        }
        store
    }

    fn populate(engine: &Arc<IndexPopulationEngine>, store: &InMemoryStoreView) {
        engine.create();
        let scan = engine.index_all_entities(store);
        scan.run(&engine.external_updates()).unwrap();
        engine.flush_all().unwrap();
        engine.flip_after_store_scan(false);
        engine.close();
    }

    #[test]
    fn test_batch_take_leaves_empty() {
        let mut batch = PopulationBatch::default();
        batch.push(IndexEntryUpdate::added(1, 1, vec![json!("a")]));
        assert_eq!(batch.len(), 1);
        assert!(batch.byte_size() > 0);
        assert_eq!(batch.take().len(), 1);
        assert!(batch.is_empty());
        assert_eq!(batch.byte_size(), 0);
    }

    #[test]
    fn test_populates_and_flips_inline_and_concurrent() {
        for mode in [FlushMode::Inline, FlushMode::Concurrent] {
            let provider = InMemoryIndexProvider::new();
            let engine = engine(mode);
            let population = add_target(&engine, &provider, 1);
            populate(&engine, &store_with(25));

            assert_eq!(population.flipper.state(), InternalIndexState::Online);
            assert!(!engine.has_populators());
            assert_eq!(provider.entries(1), 25);
        }
    }

    #[test]
    fn test_wrong_entity_type_is_rejected() {
        let provider = InMemoryIndexProvider::new();
        let engine = engine(FlushMode::Inline);
        let desc = IndexDescriptor::new(5, "rel", SchemaDescriptor::for_relationships(&[1], &[1]));
        let populator = provider.populator(&desc).unwrap();
        let flipper = Arc::new(FlippableIndexProxy::new(
            desc.clone(),
            IndexBehavior::Recovering(RecoveringIndex::new(5)),
        ));
        let factory = FailedIndexProxyFactory::new(5, Arc::clone(&populator));
        assert!(engine.add_populator(desc, populator, flipper, factory).is_err());
    }

    #[test]
    fn test_fail_twice_is_same_as_once() {
        let provider = InMemoryIndexProvider::new();
        let engine = engine(FlushMode::Inline);
        let population = add_target(&engine, &provider, 1);
        let other = add_target(&engine, &provider, 2);
        engine.create();

        engine.fail(&population, IndexError::Populator("first".into()));
        engine.fail(&population, IndexError::Populator("second".into()));

        assert_eq!(population.flipper.state(), InternalIndexState::Failed);
        assert!(population.flipper.failure().unwrap().as_string().contains("first"));
        assert_eq!(provider.failure_marks(1), 1);
        assert!(other.is_ongoing());
        assert_eq!(engine.populations().len(), 1);
    }

    #[test]
    fn test_cancel_population_drops_once() {
        let provider = InMemoryIndexProvider::new();
        let engine = engine(FlushMode::Inline);
        let population = add_target(&engine, &provider, 1);
        engine.create();

        engine.cancel_population(&population).unwrap();
        engine.cancel_population(&population).unwrap();
        assert_eq!(provider.drop_count(1), 1);
        assert!(!engine.has_populators());
        // A cancelled target cannot be failed afterwards
        engine.fail(&population, IndexError::Populator("late".into()));
        assert_eq!(provider.failure_marks(1), 0);
    }

    #[test]
    fn test_queued_update_behind_cursor_is_applied() {
        let provider = InMemoryIndexProvider::new();
        let engine = engine(FlushMode::Inline);
        add_target(&engine, &provider, 1);
        engine.create();

        engine.queue_update(IndexEntryUpdate::added(1, 3, vec![json!("x")]));
        engine.queue_update(IndexEntryUpdate::added(1, 10, vec![json!("y")]));
        engine.apply_external_updates(ScanCursor::At(10)).unwrap();

        // 3 is behind the cursor, 10 is left to the scan
        assert_eq!(provider.lookup(1, &[json!("x")]), vec![3]);
        assert!(provider.lookup(1, &[json!("y")]).is_empty());
        assert_eq!(engine.queued_updates(), 0);
    }
}
