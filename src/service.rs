//! Indexing service: owns every index proxy and the jobs populating them.
//!
//! # Example
//! ```ignore
//! use graphidx::memory::{InMemoryIndexProvider, InMemoryStoreView};
//! use graphidx::{IndexingConfig, IndexingService, PropertySchemaMatcher};
//!
//! let store = Arc::new(InMemoryStoreView::new());
//! let service = IndexingService::new(
//!     IndexingConfig::default(),
//!     Arc::new(InMemoryIndexProvider::new()),
//!     store.clone(),
//!     Arc::new(PropertySchemaMatcher),
//! );
//! service.create_indexes(vec![descriptor])?;
//! let changed = store.set_property(7, name_key, json!("Ada"))?;
//! service.apply_updates(&[changed])?;
//! ```

use crate::error::{IndexError, Result};
use crate::index_map::IndexMap;
use crate::population::{
    IndexPopulationEngine, IndexPopulationJob, IndexProvider, IndexStoreView, PopulationConfig,
};
use crate::proxy::{
    FlipTarget, FlippableIndexProxy, GuardedIndexProxy, IndexBehavior, IndexLifecycleGuard,
    IndexProxy, LifecycleState, OnlineIndex, RecoveringIndex, TentativeConstraintIndex,
};
use crate::scheduler::{JobScheduler, PopulationJobController, ThreadPoolScheduler};
use crate::schema::{IndexDescriptor, SchemaMatcher};
use crate::stats::IndexStatisticsStore;
use crate::types::{
    EntityType, EntityUpdates, IndexEntryUpdate, IndexId, IndexSample, IndexUpdateMode,
    InternalIndexState,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Indexing service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub population: PopulationConfig,
    /// Threads running population jobs
    pub job_threads: usize,
    /// How long `shutdown` waits for each population job
    pub stop_timeout_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            population: PopulationConfig::default(),
            job_threads: 2,
            stop_timeout_secs: 60,
        }
    }
}

impl IndexingConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn population(mut self, population: PopulationConfig) -> Self {
        self.population = population;
        self
    }

    pub fn job_threads(mut self, threads: usize) -> Self {
        self.job_threads = threads.max(1);
        self
    }

    pub fn stop_timeout_secs(mut self, secs: u64) -> Self {
        self.stop_timeout_secs = secs;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

pub struct IndexingService {
    config: IndexingConfig,
    provider: Arc<dyn IndexProvider>,
    store: Arc<dyn IndexStoreView>,
    matcher: Arc<dyn SchemaMatcher>,
    stats: Arc<IndexStatisticsStore>,
    indexes: IndexMap,
    controller: PopulationJobController,
    recovering: Mutex<Vec<IndexDescriptor>>,
}

impl IndexingService {
    pub fn new(
        config: IndexingConfig,
        provider: Arc<dyn IndexProvider>,
        store: Arc<dyn IndexStoreView>,
        matcher: Arc<dyn SchemaMatcher>,
    ) -> Self {
        let scheduler = Arc::new(ThreadPoolScheduler::new(config.job_threads));
        Self::with_scheduler(config, provider, store, matcher, scheduler)
    }

    pub fn with_scheduler(
        config: IndexingConfig,
        provider: Arc<dyn IndexProvider>,
        store: Arc<dyn IndexStoreView>,
        matcher: Arc<dyn SchemaMatcher>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        let controller = PopulationJobController::new(scheduler, config.stop_timeout());
        Self {
            config,
            provider,
            store,
            matcher,
            stats: Arc::new(IndexStatisticsStore::new()),
            indexes: IndexMap::new(),
            controller,
            recovering: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    /// Creates `descriptors` and populates them in the background. Indexes
    /// over the same entity type share one job and one scan.
    pub fn create_indexes(&self, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        let mut seen = AHashSet::with_capacity(descriptors.len());
        for desc in &descriptors {
            if self.indexes.contains(desc.id) {
                return Err(IndexError::IllegalState(format!(
                    "index {} already exists",
                    desc.id
                )));
            }
            if !seen.insert(desc.id) {
                return Err(IndexError::IllegalState(format!(
                    "index {} is given more than once",
                    desc.id
                )));
            }
        }

        let mut by_type: Vec<(EntityType, Vec<IndexDescriptor>)> = Vec::new();
        for desc in descriptors {
            let entity_type = desc.schema.entity_type;
            match by_type.iter_mut().find(|(t, _)| *t == entity_type) {
                Some((_, group)) => group.push(desc),
                None => by_type.push((entity_type, vec![desc])),
            }
        }

        for (entity_type, group) in by_type {
            self.start_population(entity_type, group)?;
        }
        Ok(())
    }

    fn start_population(&self, entity_type: EntityType, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        let engine = IndexPopulationEngine::new(
            self.config.population.clone(),
            entity_type,
            Arc::clone(&self.matcher),
            Arc::clone(&self.stats),
        )?;
        let job = IndexPopulationJob::new(engine, Arc::clone(&self.store), true);

        let mut registered = Vec::with_capacity(descriptors.len());
        let result = descriptors
            .into_iter()
            .try_for_each(|desc| self.register_population(&job, desc, &mut registered))
            .and_then(|()| self.controller.start_index_population(Arc::clone(&job)));

        if let Err(e) = result {
            for index in registered {
                if let Some(proxy) = self.indexes.remove(index) {
                    if let Err(close_err) = proxy.close() {
                        warn!("Unable to close index {} after a failed start: {}", index, close_err);
                    }
                }
            }
            job.engine().stop_all();
            return Err(e);
        }
        Ok(())
    }

    fn register_population(
        &self,
        job: &Arc<IndexPopulationJob>,
        desc: IndexDescriptor,
        registered: &mut Vec<IndexId>,
    ) -> Result<()> {
        let populator = self.provider.populator(&desc)?;
        let accessor = self.provider.online_accessor(&desc)?;
        let unique = desc.unique;
        let flip_target: FlipTarget = Box::new(move || {
            Ok(if unique {
                IndexBehavior::TentativeConstraint(TentativeConstraintIndex::new(accessor))
            } else {
                IndexBehavior::Online(OnlineIndex::new(accessor))
            })
        });

        let flipper = Arc::new(FlippableIndexProxy::new(
            desc.clone(),
            IndexBehavior::Recovering(RecoveringIndex::new(desc.id)),
        ));
        job.add_population(desc.clone(), populator, Arc::clone(&flipper), flip_target)?;

        let proxy = Arc::new(IndexLifecycleGuard::new(flipper));
        proxy.create()?;
        self.indexes.insert(proxy);
        registered.push(desc.id);
        info!("Scheduled population of index [{}]", desc.user_description());
        Ok(())
    }

    pub fn get_index_proxy(&self, index: IndexId) -> Result<Arc<GuardedIndexProxy>> {
        self.indexes.get(index).ok_or(IndexError::IndexNotFound(index))
    }

    pub fn get_all_index_proxies(&self) -> Vec<Arc<GuardedIndexProxy>> {
        self.indexes.all()
    }

    pub fn statistics(&self, index: IndexId) -> Option<IndexSample> {
        self.stats.sample(index)
    }

    /// Routes committed entity changes to every live index. Failed, closed
    /// and recovering indexes are skipped. The first error is returned after all
    /// indexes were updated.
    pub fn apply_updates(&self, entities: &[EntityUpdates]) -> Result<()> {
        let recovering: Vec<IndexId> = self.recovering.lock().iter().map(|d| d.id).collect();
        let proxies: Vec<Arc<GuardedIndexProxy>> = self
            .indexes
            .all()
            .into_iter()
            .filter(|p| accepts_updates(p) && !recovering.contains(&p.descriptor().id))
            .collect();
        if proxies.is_empty() {
            return Ok(());
        }
        let descriptors: Vec<&IndexDescriptor> = proxies.iter().map(|p| p.descriptor()).collect();

        let mut routed: AHashMap<IndexId, Vec<IndexEntryUpdate>> = AHashMap::new();
        for entity in entities {
            for update in self.matcher.index_updates(entity, &descriptors) {
                routed.entry(update.index_id).or_default().push(update);
            }
        }

        let mut first_error = None;
        for proxy in &proxies {
            let Some(updates) = routed.remove(&proxy.descriptor().id) else {
                continue;
            };
            match proxy.update(updates, IndexUpdateMode::Online) {
                Ok(()) => {}
                // Dropped or failed concurrently
                Err(IndexError::ProxyClosed(_)) | Err(IndexError::IndexFailed { .. }) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drops an index in any state. A drop refused because calls are in
    /// flight leaves the index registered so it can be retried.
    pub fn drop_index(&self, index: IndexId) -> Result<()> {
        let proxy = self
            .indexes
            .remove(index)
            .ok_or(IndexError::IndexNotFound(index))?;
        match proxy.drop_index() {
            Ok(()) => {
                self.stats.remove(index);
                info!("Dropped index [{}]", proxy.descriptor().user_description());
                Ok(())
            }
            Err(e @ IndexError::ConcurrentOperation { .. }) => {
                self.indexes.insert(proxy);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuilds a failed index from scratch with a new population job.
    pub fn repopulate(&self, index: IndexId) -> Result<()> {
        let proxy = self.get_index_proxy(index)?;
        if proxy.state() != InternalIndexState::Failed {
            return Err(IndexError::IllegalState(format!(
                "index {index} is {:?}, only failed indexes can be repopulated",
                proxy.state()
            )));
        }
        let descriptor = proxy.descriptor().clone();
        self.drop_index(index)?;
        self.create_indexes(vec![descriptor])
    }

    /// Registers indexes found at startup. They reject updates until
    /// `start` repopulates them.
    pub fn register_recovering(&self, descriptors: Vec<IndexDescriptor>) -> Result<()> {
        for desc in descriptors {
            let flipper = Arc::new(FlippableIndexProxy::new(
                desc.clone(),
                IndexBehavior::Recovering(RecoveringIndex::new(desc.id)),
            ));
            let proxy = Arc::new(IndexLifecycleGuard::new(flipper));
            proxy.create()?;
            if let Some(previous) = self.indexes.insert(proxy) {
                warn!(
                    "Replaced index [{}] while registering recovery",
                    previous.descriptor().user_description()
                );
            }
            self.recovering.lock().push(desc);
        }
        Ok(())
    }

    /// Repopulates every index registered as recovering.
    pub fn start(&self) -> Result<()> {
        let descriptors = std::mem::take(&mut *self.recovering.lock());
        if descriptors.is_empty() {
            return Ok(());
        }
        for desc in &descriptors {
            if let Some(proxy) = self.indexes.remove(desc.id) {
                proxy.close()?;
            }
        }
        info!("Repopulating {} recovered indexes", descriptors.len());
        self.create_indexes(descriptors)
    }

    pub fn validate(&self, index: IndexId) -> Result<()> {
        self.get_index_proxy(index)?.validate()
    }

    pub fn activate(&self, index: IndexId) -> Result<()> {
        self.get_index_proxy(index)?.activate()
    }

    /// Returns whether the index left the populating state within `timeout`.
    pub fn await_population(&self, index: IndexId, timeout: Duration) -> Result<bool> {
        let proxy = self.get_index_proxy(index)?;
        if proxy.await_store_scan_completed(timeout)? {
            return Ok(true);
        }
        Ok(proxy.state() != InternalIndexState::Populating)
    }

    pub fn active_jobs(&self) -> usize {
        self.controller.active_jobs()
    }

    /// Stops all population jobs, then closes every index.
    pub fn shutdown(&self) -> Result<()> {
        let stopped = self.controller.stop();
        for proxy in self.indexes.all() {
            if proxy.lifecycle_state() == LifecycleState::Failed
                || proxy.state() == InternalIndexState::Failed
            {
                continue;
            }
            if let Err(e) = proxy.close() {
                if !matches!(e, IndexError::ProxyClosed(_)) {
                    warn!(
                        "Unable to close index [{}]: {}",
                        proxy.descriptor().user_description(),
                        e
                    );
                }
            }
        }
        stopped
    }
}

fn accepts_updates(proxy: &GuardedIndexProxy) -> bool {
    !matches!(
        proxy.lifecycle_state(),
        LifecycleState::Closed | LifecycleState::Failed
    ) && proxy.state() != InternalIndexState::Failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_json() {
        let config = IndexingConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(60));

        let config = IndexingConfig::from_json(
            r#"{"job_threads": 4, "population": {"queue_threshold": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.job_threads, 4);
        assert_eq!(config.population.queue_threshold, 7);
        assert_eq!(config.stop_timeout_secs, 60);
    }
}
