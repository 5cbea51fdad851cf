//! In-memory index storage shared by a populator and its online accessor.
//!
//! Entries live in two DashMaps, key -> entities and entity -> key, so an
//! entity can be moved or removed without knowing its previous value.

use crate::error::{IndexError, Result};
use crate::population::{IndexAccessor, IndexPopulator, IndexProvider, IndexReader, IndexUpdater};
use crate::schema::IndexDescriptor;
use crate::types::{
    values_key, EntityId, IndexEntryUpdate, IndexId, IndexSample, IndexUpdateMode, ValueChange,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type EntitySet = SmallVec<[EntityId; 2]>;

/// Entries of one index plus counters tests and tools can inspect.
pub struct IndexStorage {
    index: IndexId,
    unique: bool,
    forward: DashMap<String, EntitySet>,
    reverse: DashMap<EntityId, String>,
    dropped: AtomicBool,
    sampled: AtomicU64,
    drops: AtomicU64,
    failure_marks: AtomicU64,
    populated: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl IndexStorage {
    fn new(descriptor: &IndexDescriptor) -> Self {
        Self {
            index: descriptor.id,
            unique: descriptor.unique,
            forward: DashMap::new(),
            reverse: DashMap::new(),
            dropped: AtomicBool::new(false),
            sampled: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            failure_marks: AtomicU64::new(0),
            populated: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Fails with `error` once the index has been dropped.
    fn check_live(&self, error: fn(String) -> IndexError) -> Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(error(format!("index {} was dropped", self.index)));
        }
        Ok(())
    }

    fn insert(&self, entity: EntityId, values: &[Value]) {
        self.remove(entity);
        let key = values_key(values);
        {
            let mut entities = self.forward.entry(key.clone()).or_default();
            if let Err(pos) = entities.binary_search(&entity) {
                entities.insert(pos, entity);
            }
        }
        self.reverse.insert(entity, key);
    }

    fn remove(&self, entity: EntityId) {
        if let Some((_, key)) = self.reverse.remove(&entity) {
            if let Some(mut entities) = self.forward.get_mut(&key) {
                entities.retain(|e| *e != entity);
                if entities.is_empty() {
                    drop(entities);
                    self.forward.remove_if(&key, |_, v| v.is_empty());
                }
            }
        }
    }

    fn apply(&self, update: &IndexEntryUpdate) {
        match &update.change {
            ValueChange::Added(values) | ValueChange::Changed { after: values, .. } => {
                self.insert(update.entity_id, values)
            }
            ValueChange::Removed(_) => self.remove(update.entity_id),
        }
    }

    /// Entity other than `entity` already holding `values`, if any.
    fn conflicting(&self, entity: EntityId, values: &[Value]) -> Option<EntityId> {
        self.forward
            .get(&values_key(values))
            .and_then(|entities| entities.iter().copied().find(|e| *e != entity))
    }

    fn clear(&self) {
        self.forward.clear();
        self.reverse.clear();
        self.sampled.store(0, Ordering::Relaxed);
    }

    pub fn entries(&self) -> usize {
        self.reverse.len()
    }

    pub fn lookup(&self, values: &[Value]) -> Vec<EntityId> {
        self.forward
            .get(&values_key(values))
            .map(|e| e.to_vec())
            .unwrap_or_default()
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Acquire)
    }

    pub fn failure_marks(&self) -> u64 {
        self.failure_marks.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Builds an [`IndexStorage`] during population.
pub struct InMemoryPopulator {
    storage: Arc<IndexStorage>,
}

impl IndexPopulator for InMemoryPopulator {
    fn create(&self) -> Result<()> {
        self.storage.dropped.store(false, Ordering::Release);
        self.storage.populated.store(false, Ordering::Release);
        *self.storage.failure.lock() = None;
        self.storage.clear();
        Ok(())
    }

    fn add(&self, updates: Vec<IndexEntryUpdate>) -> Result<()> {
        self.storage.check_live(IndexError::Populator)?;
        for update in &updates {
            self.storage.apply(update);
        }
        Ok(())
    }

    fn new_populating_updater(&self) -> Result<Box<dyn IndexUpdater>> {
        self.storage.check_live(IndexError::Populator)?;
        Ok(Box::new(StorageUpdater {
            storage: Arc::clone(&self.storage),
            check_unique: false,
        }))
    }

    fn include_sample(&self, _update: &IndexEntryUpdate) {
        self.storage.sampled.fetch_add(1, Ordering::Relaxed);
    }

    fn verify_deferred_constraints(&self) -> Result<()> {
        if !self.storage.unique {
            return Ok(());
        }
        for entry in self.storage.forward.iter() {
            if let [existing, added, ..] = entry.value().as_slice() {
                return Err(IndexError::EntryConflict {
                    index: self.storage.index,
                    values: entry.key().clone(),
                    existing: *existing,
                    added: *added,
                });
            }
        }
        Ok(())
    }

    fn sample_result(&self) -> IndexSample {
        IndexSample::new(
            self.storage.reverse.len() as u64,
            self.storage.forward.len() as u64,
            self.storage.sampled.load(Ordering::Relaxed),
        )
    }

    fn close(&self, populated: bool) -> Result<()> {
        self.storage.populated.store(populated, Ordering::Release);
        Ok(())
    }

    fn mark_as_failed(&self, failure: &str) -> Result<()> {
        self.storage.failure_marks.fetch_add(1, Ordering::AcqRel);
        *self.storage.failure.lock() = Some(failure.to_string());
        Ok(())
    }

    fn drop_index(&self) -> Result<()> {
        self.storage.drops.fetch_add(1, Ordering::AcqRel);
        self.storage.dropped.store(true, Ordering::Release);
        self.storage.clear();
        Ok(())
    }
}

/// Serves an online [`IndexStorage`].
pub struct InMemoryAccessor {
    storage: Arc<IndexStorage>,
}

impl IndexAccessor for InMemoryAccessor {
    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        self.storage.check_live(IndexError::Accessor)?;
        Ok(Box::new(StorageUpdater {
            storage: Arc::clone(&self.storage),
            // Recovery may replay updates the index already holds
            check_unique: self.storage.unique && mode == IndexUpdateMode::Online,
        }))
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn drop_index(&self) -> Result<()> {
        self.storage.drops.fetch_add(1, Ordering::AcqRel);
        self.storage.dropped.store(true, Ordering::Release);
        self.storage.clear();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        self.storage.check_live(IndexError::Accessor)?;
        Ok(Box::new(StorageReader {
            storage: Arc::clone(&self.storage),
        }))
    }
}

struct StorageUpdater {
    storage: Arc<IndexStorage>,
    check_unique: bool,
}

impl IndexUpdater for StorageUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.storage.check_live(IndexError::Populator)?;
        if self.check_unique {
            if let Some(values) = update.values() {
                if let Some(existing) = self.storage.conflicting(update.entity_id, values) {
                    return Err(IndexError::EntryConflict {
                        index: self.storage.index,
                        values: values_key(values),
                        existing,
                        added: update.entity_id,
                    });
                }
            }
        }
        self.storage.apply(&update);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct StorageReader {
    storage: Arc<IndexStorage>,
}

impl IndexReader for StorageReader {
    fn query_exact(&self, values: &[Value]) -> Vec<EntityId> {
        self.storage.lookup(values)
    }

    fn count_others(&self, entity_id: EntityId, values: &[Value]) -> u64 {
        self.storage
            .forward
            .get(&values_key(values))
            .map(|e| e.iter().filter(|id| **id != entity_id).count() as u64)
            .unwrap_or(0)
    }

    fn size(&self) -> u64 {
        self.storage.entries() as u64
    }
}

/// Provider keeping one [`IndexStorage`] per index id.
#[derive(Default)]
pub struct InMemoryIndexProvider {
    storages: DashMap<IndexId, Arc<IndexStorage>>,
}

impl InMemoryIndexProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn storage_for(&self, descriptor: &IndexDescriptor) -> Arc<IndexStorage> {
        Arc::clone(
            self.storages
                .entry(descriptor.id)
                .or_insert_with(|| Arc::new(IndexStorage::new(descriptor)))
                .value(),
        )
    }

    pub fn storage(&self, index: IndexId) -> Option<Arc<IndexStorage>> {
        self.storages.get(&index).map(|s| Arc::clone(s.value()))
    }

    pub fn entries(&self, index: IndexId) -> usize {
        self.storage(index).map(|s| s.entries()).unwrap_or(0)
    }

    /// Entities indexed under `values`, ascending.
    pub fn lookup(&self, index: IndexId, values: &[Value]) -> Vec<EntityId> {
        self.storage(index)
            .map(|s| s.lookup(values))
            .unwrap_or_default()
    }

    /// Every (entity, key) pair of the index, sorted by entity.
    pub fn snapshot(&self, index: IndexId) -> Vec<(EntityId, String)> {
        let mut out: Vec<(EntityId, String)> = self
            .storage(index)
            .map(|s| {
                s.reverse
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn drop_count(&self, index: IndexId) -> u64 {
        self.storage(index).map(|s| s.drop_count()).unwrap_or(0)
    }

    pub fn failure_marks(&self, index: IndexId) -> u64 {
        self.storage(index).map(|s| s.failure_marks()).unwrap_or(0)
    }
}

impl IndexProvider for InMemoryIndexProvider {
    fn populator(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexPopulator>> {
        Ok(Arc::new(InMemoryPopulator {
            storage: self.storage_for(descriptor),
        }))
    }

    fn online_accessor(&self, descriptor: &IndexDescriptor) -> Result<Arc<dyn IndexAccessor>> {
        Ok(Arc::new(InMemoryAccessor {
            storage: self.storage_for(descriptor),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDescriptor;
    use serde_json::json;

    fn unique_desc() -> IndexDescriptor {
        IndexDescriptor::new(3, "email", SchemaDescriptor::for_nodes(&[1], &[2])).unique()
    }

    #[test]
    fn test_changed_moves_entity() {
        let provider = InMemoryIndexProvider::new();
        let desc = IndexDescriptor::new(1, "name", SchemaDescriptor::for_nodes(&[1], &[1]));
        let populator = provider.populator(&desc).unwrap();
        populator.create().unwrap();
        populator
            .add(vec![
                IndexEntryUpdate::added(1, 5, vec![json!("a")]),
                IndexEntryUpdate::changed(1, 5, vec![json!("a")], vec![json!("b")]),
                IndexEntryUpdate::added(1, 6, vec![json!("b")]),
            ])
            .unwrap();
        assert!(provider.lookup(1, &[json!("a")]).is_empty());
        assert_eq!(provider.lookup(1, &[json!("b")]), vec![5, 6]);

        // Re-applying is harmless
        populator.add(vec![IndexEntryUpdate::added(1, 6, vec![json!("b")])]).unwrap();
        assert_eq!(provider.entries(1), 2);

        populator.add(vec![IndexEntryUpdate::removed(1, 5, vec![json!("b")])]).unwrap();
        assert_eq!(provider.lookup(1, &[json!("b")]), vec![6]);
    }

    #[test]
    fn test_deferred_unique_check() {
        let provider = InMemoryIndexProvider::new();
        let populator = provider.populator(&unique_desc()).unwrap();
        populator.create().unwrap();
        populator
            .add(vec![
                IndexEntryUpdate::added(3, 1, vec![json!("x@y")]),
                IndexEntryUpdate::added(3, 2, vec![json!("x@y")]),
            ])
            .unwrap();
        match populator.verify_deferred_constraints() {
            Err(IndexError::EntryConflict { existing, added, .. }) => {
                assert_eq!((existing, added), (1, 2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_online_updater_rejects_duplicate() {
        let provider = InMemoryIndexProvider::new();
        let accessor = provider.online_accessor(&unique_desc()).unwrap();
        let mut updater = accessor.new_updater(IndexUpdateMode::Online).unwrap();
        updater.process(IndexEntryUpdate::added(3, 1, vec![json!("x@y")])).unwrap();
        let err = updater
            .process(IndexEntryUpdate::added(3, 2, vec![json!("x@y")]))
            .unwrap_err();
        assert!(err.is_entry_conflict());

        let reader = accessor.new_reader().unwrap();
        assert_eq!(reader.count_others(2, &[json!("x@y")]), 1);
        assert_eq!(reader.size(), 1);
    }

    #[test]
    fn test_add_after_drop_fails() {
        let provider = InMemoryIndexProvider::new();
        let desc = IndexDescriptor::new(1, "name", SchemaDescriptor::for_nodes(&[1], &[1]));
        let populator = provider.populator(&desc).unwrap();
        populator.create().unwrap();
        populator.drop_index().unwrap();
        assert!(matches!(
            populator.add(vec![IndexEntryUpdate::added(1, 1, vec![json!(1)])]),
            Err(IndexError::Populator(_))
        ));
        assert_eq!(provider.drop_count(1), 1);

        let accessor = provider.online_accessor(&desc).unwrap();
        assert!(matches!(accessor.new_reader(), Err(IndexError::Accessor(_))));
        assert!(matches!(
            accessor.new_updater(IndexUpdateMode::Online),
            Err(IndexError::Accessor(_))
        ));
    }
}
