//! In-memory entity store with a cursor-ordered scan.

use crate::error::{IndexError, Result};
use crate::population::{
    EntityVisitor, ExternalUpdatesCheck, IndexStoreView, ScanCursor, ScanFilter, StoreScan,
};
use crate::types::{
    EntityId, EntityType, EntityUpdates, PopulationProgress, PropertyKeyId, PropertyUpdate,
    TokenId, TokenSet,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub tokens: TokenSet,
    pub properties: BTreeMap<PropertyKeyId, Value>,
}

type EntityMap = BTreeMap<EntityId, EntityRecord>;

/// Entities keyed by id. Every mutation returns the full before/after state
/// of the entity, ready to be matched against indexes.
pub struct InMemoryStoreView {
    entities: Arc<RwLock<EntityMap>>,
    scan_batch_size: usize,
}

impl Default for InMemoryStoreView {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStoreView {
    pub fn new() -> Self {
        Self {
            entities: Arc::new(RwLock::new(BTreeMap::new())),
            scan_batch_size: 100,
        }
    }

    /// Entities read per scan batch; queued updates are checked between batches.
    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<EntityRecord> {
        self.entities.read().get(&id).cloned()
    }

    pub fn create(
        &self,
        id: EntityId,
        entity_type: EntityType,
        tokens: &[TokenId],
        properties: Vec<(PropertyKeyId, Value)>,
    ) -> Result<EntityUpdates> {
        let mut entities = self.entities.write();
        if entities.contains_key(&id) {
            return Err(IndexError::EntityExists(id));
        }
        let record = EntityRecord {
            entity_type,
            tokens: TokenSet::from_slice(tokens),
            properties: properties.into_iter().collect(),
        };
        let updates = diff(id, None, &record);
        entities.insert(id, record);
        Ok(updates)
    }

    pub fn set_property(&self, id: EntityId, key: PropertyKeyId, value: Value) -> Result<EntityUpdates> {
        self.modify(id, |record| {
            record.properties.insert(key, value);
        })
    }

    pub fn remove_property(&self, id: EntityId, key: PropertyKeyId) -> Result<EntityUpdates> {
        self.modify(id, |record| {
            record.properties.remove(&key);
        })
    }

    pub fn set_tokens(&self, id: EntityId, tokens: &[TokenId]) -> Result<EntityUpdates> {
        self.modify(id, |record| {
            record.tokens = TokenSet::from_slice(tokens);
        })
    }

    pub fn delete(&self, id: EntityId) -> Result<EntityUpdates> {
        let mut entities = self.entities.write();
        let before = entities.remove(&id).ok_or(IndexError::EntityNotFound(id))?;
        let mut updates = diff(id, Some(&before), &before);
        updates.tokens_after = TokenSet::new();
        for property in &mut updates.properties {
            property.after = None;
        }
        Ok(updates)
    }

    fn modify(&self, id: EntityId, f: impl FnOnce(&mut EntityRecord)) -> Result<EntityUpdates> {
        let mut entities = self.entities.write();
        let record = entities.get_mut(&id).ok_or(IndexError::EntityNotFound(id))?;
        let before = record.clone();
        f(record);
        Ok(diff(id, Some(&before), record))
    }
}

fn diff(id: EntityId, before: Option<&EntityRecord>, after: &EntityRecord) -> EntityUpdates {
    let keys: BTreeSet<PropertyKeyId> = before
        .into_iter()
        .flat_map(|b| b.properties.keys().copied())
        .chain(after.properties.keys().copied())
        .collect();
    EntityUpdates {
        entity_id: id,
        entity_type: after.entity_type,
        tokens_before: before.map(|b| b.tokens.clone()).unwrap_or_default(),
        tokens_after: after.tokens.clone(),
        properties: keys
            .into_iter()
            .map(|key| PropertyUpdate {
                key,
                before: before.and_then(|b| b.properties.get(&key).cloned()),
                after: after.properties.get(&key).cloned(),
            })
            .collect(),
    }
}

impl IndexStoreView for InMemoryStoreView {
    fn visit_entities(
        &self,
        filter: ScanFilter,
        visitor: Arc<dyn EntityVisitor>,
    ) -> Arc<dyn StoreScan> {
        Arc::new(InMemoryStoreScan {
            entities: Arc::clone(&self.entities),
            filter,
            visitor,
            batch_size: self.scan_batch_size,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        })
    }
}

/// Reads entities in id order, one batch at a time, re-seeking from the
/// cursor so entities created behind or ahead of it are handled by id alone.
struct InMemoryStoreScan {
    entities: Arc<RwLock<EntityMap>>,
    filter: ScanFilter,
    visitor: Arc<dyn EntityVisitor>,
    batch_size: usize,
    started: AtomicBool,
    stopped: AtomicBool,
    completed: AtomicU64,
    total: AtomicU64,
}

impl InMemoryStoreScan {
    fn accepts(&self, record: &EntityRecord) -> bool {
        record.entity_type == self.filter.entity_type && self.filter.accepts_tokens(&record.tokens)
    }

    fn to_updates(&self, id: EntityId, record: &EntityRecord) -> EntityUpdates {
        EntityUpdates::from_scan(
            id,
            record.entity_type,
            record.tokens.clone(),
            record
                .properties
                .iter()
                .filter(|(key, _)| self.filter.property_keys.contains(**key))
                .map(|(key, value)| (*key, value.clone())),
        )
    }
}

impl StoreScan for InMemoryStoreScan {
    fn run(&self, external_updates: &dyn ExternalUpdatesCheck) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(IndexError::Scan("store scan already ran".into()));
        }
        self.total
            .store(self.entities.read().len() as u64, Ordering::Release);
        let mut cursor = ScanCursor::At(0);

        while let ScanCursor::At(from) = cursor {
            let mut batch = Vec::new();
            let mut scanned = 0u64;
            let mut next = ScanCursor::End;
            {
                let entities = self.entities.read();
                for (id, record) in entities.range(from..) {
                    if self.stopped.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    if scanned as usize == self.batch_size {
                        next = ScanCursor::At(*id);
                        break;
                    }
                    scanned += 1;
                    if self.accepts(record) {
                        batch.push(self.to_updates(*id, record));
                    }
                }
            }
            cursor = next;
            self.completed.fetch_add(scanned, Ordering::AcqRel);

            if !batch.is_empty() {
                self.visitor.visit(batch)?;
            }
            if let ScanCursor::At(_) = cursor {
                if external_updates.need_to_apply_external_updates() {
                    external_updates.apply_external_updates(cursor)?;
                }
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn progress(&self) -> PopulationProgress {
        let total = self.total.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire).min(total);
        PopulationProgress::new(completed, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexDescriptor, SchemaDescriptor};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<EntityId>>,
    }

    impl EntityVisitor for Collect {
        fn visit(&self, batch: Vec<EntityUpdates>) -> Result<()> {
            self.seen.lock().extend(batch.iter().map(|e| e.entity_id));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Cursors {
        seen: Mutex<Vec<ScanCursor>>,
    }

    impl ExternalUpdatesCheck for Cursors {
        fn need_to_apply_external_updates(&self) -> bool {
            true
        }

        fn apply_external_updates(&self, cursor: ScanCursor) -> Result<()> {
            self.seen.lock().push(cursor);
            Ok(())
        }
    }

    fn filter() -> ScanFilter {
        let desc = IndexDescriptor::new(1, "n", SchemaDescriptor::for_nodes(&[1], &[1]));
        ScanFilter::for_descriptors(EntityType::Node, [&desc])
    }

    #[test]
    fn test_mutations_report_before_and_after() {
        let store = InMemoryStoreView::new();
        let created = store.create(1, EntityType::Node, &[1], vec![(1, json!("a"))]).unwrap();
        assert_eq!(created.after(1), Some(&json!("a")));
        assert!(created.tokens_before.is_empty());

        let changed = store.set_property(1, 1, json!("b")).unwrap();
        assert_eq!(changed.before(1), Some(&json!("a")));
        assert_eq!(changed.after(1), Some(&json!("b")));

        let deleted = store.delete(1).unwrap();
        assert_eq!(deleted.before(1), Some(&json!("b")));
        assert_eq!(deleted.after(1), None);
        assert!(deleted.tokens_after.is_empty());

        assert!(matches!(store.delete(1), Err(IndexError::EntityNotFound(1))));
    }

    #[test]
    fn test_scan_filters_and_reports_cursor() {
        let store = InMemoryStoreView::new().with_scan_batch_size(2);
        for id in 0..5 {
            let label = if id == 3 { 2 } else { 1 };
            store.create(id, EntityType::Node, &[label], vec![(1, json!(id))]).unwrap();
        }
        store.create(9, EntityType::Relationship, &[1], vec![(1, json!(9))]).unwrap();

        let visitor = Arc::new(Collect::default());
        let scan = store.visit_entities(filter(), visitor.clone());
        let check = Cursors::default();
        scan.run(&check).unwrap();

        assert_eq!(*visitor.seen.lock(), vec![0, 1, 2, 4]);
        // Cursor is the first id not yet read
        assert_eq!(*check.seen.lock(), vec![ScanCursor::At(2), ScanCursor::At(4)]);
        assert_eq!(scan.progress(), PopulationProgress::new(6, 6));

        assert!(matches!(scan.run(&check), Err(IndexError::Scan(_))));
        assert_eq!(visitor.seen.lock().len(), 4);
    }

    #[test]
    fn test_stopped_scan_visits_nothing() {
        let store = InMemoryStoreView::new();
        store.create(1, EntityType::Node, &[1], vec![(1, json!(1))]).unwrap();
        let visitor = Arc::new(Collect::default());
        let scan = store.visit_entities(filter(), visitor.clone());
        scan.stop();
        scan.run(&Cursors::default()).unwrap();
        assert!(visitor.seen.lock().is_empty());
    }
}
