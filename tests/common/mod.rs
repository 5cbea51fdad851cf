#![allow(dead_code)]

use ahash::AHashMap;
use graphidx::error::{IndexError, Result};
use graphidx::memory::{InMemoryIndexProvider, InMemoryStoreView};
use graphidx::population::{
    EntityVisitor, IndexAccessor, IndexPopulator, IndexProvider, IndexStoreView, IndexUpdater,
    ScanFilter, StoreScan,
};
use graphidx::schema::{IndexDescriptor, SchemaDescriptor};
use graphidx::types::{
    values_key, EntityId, EntityType, EntityUpdates, IndexEntryUpdate, IndexId, IndexSample,
    PropertyKeyId,
};
use graphidx::{IndexingConfig, IndexingService, PopulationConfig, PropertySchemaMatcher};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PERSON: u32 = 1;
pub const NAME: PropertyKeyId = 1;
pub const AGE: PropertyKeyId = 2;
pub const EMAIL: PropertyKeyId = 3;

pub const WAIT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn index_on(id: IndexId, key: PropertyKeyId) -> IndexDescriptor {
    IndexDescriptor::new(id, format!("person_{key}"), SchemaDescriptor::for_nodes(&[PERSON], &[key]))
}

/// `count` people with a name, an age and a unique email.
pub fn people(count: u64) -> InMemoryStoreView {
    let store = InMemoryStoreView::new().with_scan_batch_size(25);
    for id in 0..count {
        store
            .create(
                id,
                EntityType::Node,
                &[PERSON],
                vec![
                    (NAME, json!(format!("name{}", id % 37))),
                    (AGE, json!(id % 90)),
                    (EMAIL, json!(format!("p{id}@example.com"))),
                ],
            )
            .unwrap();
    }
    store
}

/// Small batches and a low queue threshold, so scans interleave queued
/// updates often.
pub fn eager_population() -> PopulationConfig {
    PopulationConfig::default()
        .batch_size(16)
        .queue_threshold(2)
        .flush_workers(2)
}

pub fn service(
    provider: Arc<dyn IndexProvider>,
    store: Arc<dyn IndexStoreView>,
    population: PopulationConfig,
) -> Arc<IndexingService> {
    init_tracing();
    let config = IndexingConfig::default()
        .population(population)
        .stop_timeout_secs(10);
    Arc::new(IndexingService::new(
        config,
        provider,
        store,
        Arc::new(PropertySchemaMatcher),
    ))
}

/// What an index over `key` must contain for the entities in `ids`.
pub fn expected_entries(
    store: &InMemoryStoreView,
    ids: impl IntoIterator<Item = EntityId>,
    key: PropertyKeyId,
) -> Vec<(EntityId, String)> {
    let mut out: Vec<(EntityId, String)> = ids
        .into_iter()
        .filter_map(|id| {
            let record = store.get(id)?;
            if record.entity_type != EntityType::Node || !record.tokens.contains(&PERSON) {
                return None;
            }
            let value = record.properties.get(&key)?;
            Some((id, values_key(std::slice::from_ref(value))))
        })
        .collect();
    out.sort();
    out
}

// ── Scan hook ────────────────────────────────────────────────────────────────

/// Called after each scanned batch with the batch number (from 1) and the
/// last entity id of the batch.
pub type ScanHook = Box<dyn Fn(usize, EntityId) + Send + Sync>;

/// Store view that runs a hook on the scan thread between batches.
pub struct HookStore {
    pub inner: Arc<InMemoryStoreView>,
    hook: Arc<Mutex<Option<ScanHook>>>,
}

impl HookStore {
    pub fn new(inner: InMemoryStoreView) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            hook: Arc::new(Mutex::new(None)),
        })
    }

    pub fn set_hook(&self, hook: impl Fn(usize, EntityId) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }
}

impl IndexStoreView for HookStore {
    fn visit_entities(
        &self,
        filter: ScanFilter,
        visitor: Arc<dyn EntityVisitor>,
    ) -> Arc<dyn StoreScan> {
        let hooked = Arc::new(HookVisitor {
            inner: visitor,
            hook: Arc::clone(&self.hook),
            batches: AtomicUsize::new(0),
        });
        self.inner.visit_entities(filter, hooked)
    }
}

struct HookVisitor {
    inner: Arc<dyn EntityVisitor>,
    hook: Arc<Mutex<Option<ScanHook>>>,
    batches: AtomicUsize,
}

impl EntityVisitor for HookVisitor {
    fn visit(&self, batch: Vec<EntityUpdates>) -> Result<()> {
        let last = batch.last().map(|e| e.entity_id);
        self.inner.visit(batch)?;
        let n = self.batches.fetch_add(1, Ordering::AcqRel) + 1;
        if let (Some(last), Some(hook)) = (last, self.hook.lock().as_ref()) {
            hook(n, last);
        }
        Ok(())
    }
}

// ── Fault injection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Create,
    Add,
    ScanCompleted,
    /// Panics instead of returning an error.
    PanicOnCreate,
    PanicOnAdd,
}

/// In-memory provider whose populators fail on demand.
#[derive(Default)]
pub struct FaultyProvider {
    pub inner: InMemoryIndexProvider,
    // index -> (fault, populators left to break)
    faults: Mutex<AHashMap<IndexId, (Fault, usize)>>,
}

impl FaultyProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `times` populators handed out for `index` fail with `fault`.
    pub fn inject(&self, index: IndexId, fault: Fault, times: usize) {
        self.faults.lock().insert(index, (fault, times));
    }
}

impl IndexProvider for FaultyProvider {
    fn populator(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexPopulator>> {
        let inner = self.inner.populator(descriptor)?;
        let mut faults = self.faults.lock();
        match faults.get_mut(&descriptor.id) {
            Some((fault, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(Arc::new(FaultyPopulator { inner, fault: *fault }))
            }
            _ => Ok(inner),
        }
    }

    fn online_accessor(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexAccessor>> {
        self.inner.online_accessor(descriptor)
    }
}

struct FaultyPopulator {
    inner: Arc<dyn IndexPopulator>,
    fault: Fault,
}

impl FaultyPopulator {
    fn check(&self, at: Fault) -> Result<()> {
        match (self.fault, at) {
            (fault, at) if fault == at => {
                Err(IndexError::Populator(format!("injected {at:?} failure")))
            }
            (Fault::PanicOnCreate, Fault::Create) | (Fault::PanicOnAdd, Fault::Add) => {
                panic!("injected {at:?} panic")
            }
            _ => Ok(()),
        }
    }
}

impl IndexPopulator for FaultyPopulator {
    fn create(&self) -> Result<()> {
        self.check(Fault::Create)?;
        self.inner.create()
    }

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        self.check(Fault::Add)?;
        self.inner.add(updates)
    }

    fn new_populating_updater(&self) -> Result<Box<dyn IndexUpdater>> {
        self.inner.new_populating_updater()
    }

    fn include_sample(&self, update: &IndexEntryUpdate) {
        self.inner.include_sample(update)
    }

    fn scan_completed(&self) -> Result<()> {
        self.check(Fault::ScanCompleted)?;
        self.inner.scan_completed()
    }

    fn verify_deferred_constraints(&self) -> Result<()> {
        self.inner.verify_deferred_constraints()
    }

    fn sample_result(&self) -> IndexSample {
        self.inner.sample_result()
    }

    fn close(&self, populated: bool) -> Result<()> {
        self.inner.close(populated)
    }

    fn mark_as_failed(&self, failure: &str) -> Result<()> {
        self.inner.mark_as_failed(failure)
    }

    fn drop_index(&self) -> Result<()> {
        self.inner.drop_index()
    }
}
