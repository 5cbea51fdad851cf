//! Collaborator contracts consumed by the population engine.
//!
//! The engine never persists anything itself: index storage lives behind
//! [`IndexPopulator`] / [`IndexAccessor`], existing data is read through
//! [`IndexStoreView`].

use super::queue::ScanCursor;
use crate::error::Result;
use crate::schema::IndexDescriptor;
use crate::types::{
    EntityId, EntityType, EntityUpdates, IndexEntryUpdate, IndexSample, IndexUpdateMode,
    PopulationProgress,
};
use roaring::RoaringBitmap;
use serde_json::Value;
use std::sync::Arc;

/// Applies a stream of updates to one index. Must be closed to make the
/// updates durable; dropping without `close` releases resources only.
pub trait IndexUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()>;

    fn close(self: Box<Self>) -> Result<()>;
}

/// Read access to an online index.
pub trait IndexReader {
    fn query_exact(&self, values: &[Value]) -> Vec<EntityId>;

    /// Number of entities other than `entity_id` indexed under `values`.
    fn count_others(&self, entity_id: EntityId, values: &[Value]) -> u64;

    fn size(&self) -> u64;
}

/// Builds index storage from scan batches and queued updates.
///
/// Implementations:
/// - `InMemoryPopulator`: shared in-memory storage, used by tests and embedded setups
///
/// `add` may be called concurrently from the flush workers; every other
/// method is called by one thread at a time.
pub trait IndexPopulator: Send + Sync {
    fn create(&self) -> Result<()>;

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()>;

    /// Updater for queued concurrent updates, applied between scan batches.
    fn new_populating_updater(&self) -> Result<Box<dyn IndexUpdater>>;

    fn include_sample(&self, update: &IndexEntryUpdate);

    /// Called once the scan finished and every batch was applied.
    fn scan_completed(&self) -> Result<()> {
        Ok(())
    }

    fn verify_deferred_constraints(&self) -> Result<()>;

    fn sample_result(&self) -> IndexSample;

    fn close(&self, populated: bool) -> Result<()>;

    fn mark_as_failed(&self, failure: &str) -> Result<()>;

    fn drop_index(&self) -> Result<()>;
}

/// Serves reads and writes for an online index.
pub trait IndexAccessor: Send + Sync {
    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>>;

    fn force(&self) -> Result<()>;

    fn drop_index(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn new_reader(&self) -> Result<Box<dyn IndexReader>>;
}

/// Creates populators and accessors for descriptors.
pub trait IndexProvider: Send + Sync {
    fn populator(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexPopulator>>;

    fn online_accessor(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexAccessor>>;
}

/// Hook the scan calls between batches so queued concurrent updates can be
/// interleaved into the scan.
pub trait ExternalUpdatesCheck {
    fn need_to_apply_external_updates(&self) -> bool;

    /// `cursor` is the first entity id the scan has not read yet.
    fn apply_external_updates(&self, cursor: ScanCursor) -> Result<()>;
}

/// Receives scanned entities in id order.
pub trait EntityVisitor: Send + Sync {
    fn visit(&self, batch: Vec<EntityUpdates>) -> Result<()>;
}

/// A blocking full-store scan.
pub trait StoreScan: Send + Sync {
    fn run(&self, external_updates: &dyn ExternalUpdatesCheck) -> Result<()>;

    /// Cooperative: checked between entities.
    fn stop(&self);

    fn progress(&self) -> PopulationProgress;
}

/// Which entities and properties a scan needs to produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    pub entity_type: EntityType,
    pub entity_tokens: RoaringBitmap,
    pub property_keys: RoaringBitmap,
}

impl ScanFilter {
    pub fn for_descriptors<'a>(
        entity_type: EntityType,
        descriptors: impl IntoIterator<Item = &'a IndexDescriptor>,
    ) -> Self {
        let mut filter = ScanFilter { entity_type, ..Default::default() };
        for desc in descriptors {
            filter.entity_tokens.extend(desc.schema.entity_tokens.iter().copied());
            filter.property_keys.extend(desc.schema.property_keys.iter().copied());
        }
        filter
    }

    pub fn accepts_tokens(&self, tokens: &[u32]) -> bool {
        tokens.iter().any(|t| self.entity_tokens.contains(*t))
    }
}

pub trait IndexStoreView: Send + Sync {
    fn visit_entities(
        &self,
        filter: ScanFilter,
        visitor: Arc<dyn EntityVisitor>,
    ) -> Arc<dyn StoreScan>;
}
