//! Shared value types: ids, entity deltas, index entry updates, samples.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

pub type IndexId = u64;
pub type EntityId = u64;
pub type TokenId = u32;
pub type PropertyKeyId = u32;

/// Token list of one entity (labels for nodes, the type for relationships).
pub type TokenSet = SmallVec<[TokenId; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityType {
    #[default]
    Node,
    Relationship,
}

/// State of an index as seen by readers of its proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalIndexState {
    Populating,
    Online,
    Failed,
}

/// Mode for updaters obtained from an online accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexUpdateMode {
    #[default]
    Online,
    /// Applied while replaying the log; updates may be seen twice.
    Recovery,
}

/// Canonical, hashable rendering of an index key.
pub fn values_key(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

fn rough_value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(rough_value_size).sum::<usize>() + 8,
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + rough_value_size(v))
            .sum::<usize>()
            + 8,
    }
}

/// Value change carried by an [`IndexEntryUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValueChange {
    Added(Vec<Value>),
    Changed { before: Vec<Value>, after: Vec<Value> },
    Removed(Vec<Value>),
}

/// One change to one index, for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntryUpdate {
    pub index_id: IndexId,
    pub entity_id: EntityId,
    pub change: ValueChange,
}

impl IndexEntryUpdate {
    pub fn added(index_id: IndexId, entity_id: EntityId, values: Vec<Value>) -> Self {
        Self { index_id, entity_id, change: ValueChange::Added(values) }
    }

    pub fn changed(
        index_id: IndexId,
        entity_id: EntityId,
        before: Vec<Value>,
        after: Vec<Value>,
    ) -> Self {
        Self { index_id, entity_id, change: ValueChange::Changed { before, after } }
    }

    pub fn removed(index_id: IndexId, entity_id: EntityId, values: Vec<Value>) -> Self {
        Self { index_id, entity_id, change: ValueChange::Removed(values) }
    }

    /// Values the entity has in the index after this update, if any.
    pub fn values(&self) -> Option<&[Value]> {
        match &self.change {
            ValueChange::Added(v) => Some(v),
            ValueChange::Changed { after, .. } => Some(after),
            ValueChange::Removed(_) => None,
        }
    }

    /// Approximate heap footprint, used for queue back-pressure.
    pub fn rough_size(&self) -> usize {
        let values: usize = match &self.change {
            ValueChange::Added(v) | ValueChange::Removed(v) => v.iter().map(rough_value_size).sum(),
            ValueChange::Changed { before, after } => before
                .iter()
                .chain(after.iter())
                .map(rough_value_size)
                .sum(),
        };
        32 + values
    }

    pub fn describe(&self) -> String {
        match &self.change {
            ValueChange::Added(v) => {
                format!("index {} entity {} +{}", self.index_id, self.entity_id, values_key(v))
            }
            ValueChange::Changed { before, after } => format!(
                "index {} entity {} {} -> {}",
                self.index_id,
                self.entity_id,
                values_key(before),
                values_key(after)
            ),
            ValueChange::Removed(v) => {
                format!("index {} entity {} -{}", self.index_id, self.entity_id, values_key(v))
            }
        }
    }
}

/// Property state before and after a change. Unchanged properties carry the
/// same value on both sides so composite keys can be built.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub key: PropertyKeyId,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Full before/after state of one entity, as produced by a store scan (where
/// `before` is always empty) or by a committing transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityUpdates {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub tokens_before: TokenSet,
    pub tokens_after: TokenSet,
    pub properties: Vec<PropertyUpdate>,
}

impl EntityUpdates {
    /// Entity state as seen by a store scan: nothing before, everything after.
    pub fn from_scan(
        entity_id: EntityId,
        entity_type: EntityType,
        tokens: TokenSet,
        properties: impl IntoIterator<Item = (PropertyKeyId, Value)>,
    ) -> Self {
        Self {
            entity_id,
            entity_type,
            tokens_before: TokenSet::new(),
            tokens_after: tokens,
            properties: properties
                .into_iter()
                .map(|(key, value)| PropertyUpdate { key, before: None, after: Some(value) })
                .collect(),
        }
    }

    pub fn before(&self, key: PropertyKeyId) -> Option<&Value> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .and_then(|p| p.before.as_ref())
    }

    pub fn after(&self, key: PropertyKeyId) -> Option<&Value> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .and_then(|p| p.after.as_ref())
    }
}

/// Sampling result recorded in the statistics store when an index flips online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexSample {
    pub index_size: u64,
    pub unique_values: u64,
    pub sample_size: u64,
}

impl IndexSample {
    pub fn new(index_size: u64, unique_values: u64, sample_size: u64) -> Self {
        Self { index_size, unique_values, sample_size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulationProgress {
    pub completed: u64,
    pub total: u64,
}

impl PopulationProgress {
    pub const NONE: PopulationProgress = PopulationProgress { completed: 0, total: 0 };
    pub const DONE: PopulationProgress = PopulationProgress { completed: 1, total: 1 };

    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f32 / self.total as f32).min(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_key_distinguishes_types() {
        assert_ne!(values_key(&[json!(1)]), values_key(&[json!("1")]));
        assert_eq!(values_key(&[json!("a"), json!(2)]), r#"["a",2]"#);
    }

    #[test]
    fn test_rough_size_grows_with_values() {
        let small = IndexEntryUpdate::added(1, 1, vec![json!("a")]);
        let large = IndexEntryUpdate::added(1, 1, vec![json!("a".repeat(100))]);
        assert!(large.rough_size() > small.rough_size());
    }

    #[test]
    fn test_entity_updates_lookup() {
        let updates = EntityUpdates::from_scan(
            7,
            EntityType::Node,
            TokenSet::from_slice(&[1]),
            vec![(10, json!("x"))],
        );
        assert_eq!(updates.after(10), Some(&json!("x")));
        assert_eq!(updates.before(10), None);
        assert_eq!(updates.after(11), None);
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(PopulationProgress::NONE.progress(), 0.0);
        assert_eq!(PopulationProgress::new(5, 10).progress(), 0.5);
    }
}
