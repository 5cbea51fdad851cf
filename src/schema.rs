//! Index descriptors and the schema matcher that turns entity deltas into
//! index entry updates.

use crate::types::{
    EntityType, EntityUpdates, IndexEntryUpdate, IndexId, PropertyKeyId, TokenId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::fmt;

/// Entity tokens plus the ordered property keys an index covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub entity_type: EntityType,
    pub entity_tokens: SmallVec<[TokenId; 4]>,
    pub property_keys: SmallVec<[PropertyKeyId; 4]>,
}

impl SchemaDescriptor {
    pub fn for_nodes(tokens: &[TokenId], property_keys: &[PropertyKeyId]) -> Self {
        Self {
            entity_type: EntityType::Node,
            entity_tokens: SmallVec::from_slice(tokens),
            property_keys: SmallVec::from_slice(property_keys),
        }
    }

    pub fn for_relationships(types: &[TokenId], property_keys: &[PropertyKeyId]) -> Self {
        Self {
            entity_type: EntityType::Relationship,
            entity_tokens: SmallVec::from_slice(types),
            property_keys: SmallVec::from_slice(property_keys),
        }
    }

    pub fn matches_tokens(&self, tokens: &[TokenId]) -> bool {
        tokens.iter().any(|t| self.entity_tokens.contains(t))
    }

    /// Composite key for an entity, or `None` if it is not covered.
    fn key_for<'a>(
        &self,
        tokens: &[TokenId],
        lookup: impl Fn(PropertyKeyId) -> Option<&'a Value>,
    ) -> Option<Vec<Value>> {
        if !self.matches_tokens(tokens) {
            return None;
        }
        self.property_keys
            .iter()
            .map(|k| lookup(*k).cloned())
            .collect()
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.entity_type {
            EntityType::Node => ":",
            EntityType::Relationship => "-[:",
        };
        write!(f, "{}{:?}({:?})", prefix, self.entity_tokens.as_slice(), self.property_keys.as_slice())
    }
}

/// Query predicates an index can accelerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexPredicate {
    Exact,
    Range,
    Prefix,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCapability {
    pub predicates: SmallVec<[IndexPredicate; 4]>,
}

impl IndexCapability {
    pub fn range() -> Self {
        Self {
            predicates: SmallVec::from_slice(&[
                IndexPredicate::Exact,
                IndexPredicate::Range,
                IndexPredicate::Prefix,
                IndexPredicate::Exists,
            ]),
        }
    }

    pub fn supports(&self, predicate: IndexPredicate) -> bool {
        self.predicates.contains(&predicate)
    }
}

impl Default for IndexCapability {
    fn default() -> Self {
        Self::range()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub name: String,
    pub schema: SchemaDescriptor,
    #[serde(default)]
    pub capability: IndexCapability,
    /// Backs a uniqueness constraint; conflicts fail population.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(id: IndexId, name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self {
            id,
            name: name.into(),
            schema,
            capability: IndexCapability::default(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn user_description(&self) -> String {
        format!("Index( id={}, name='{}', schema={} )", self.id, self.name, self.schema)
    }
}

/// Decides which indexes an entity change touches and with which values.
pub trait SchemaMatcher: Send + Sync {
    fn index_updates(
        &self,
        entity: &EntityUpdates,
        targets: &[&IndexDescriptor],
    ) -> Vec<IndexEntryUpdate>;
}

/// Default matcher: an entity is in an index when it carries one of the
/// index's tokens and has every indexed property.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertySchemaMatcher;

impl SchemaMatcher for PropertySchemaMatcher {
    fn index_updates(
        &self,
        entity: &EntityUpdates,
        targets: &[&IndexDescriptor],
    ) -> Vec<IndexEntryUpdate> {
        let mut out = Vec::new();
        for desc in targets {
            let schema = &desc.schema;
            if schema.entity_type != entity.entity_type {
                continue;
            }
            let before = schema.key_for(&entity.tokens_before, |k| entity.before(k));
            let after = schema.key_for(&entity.tokens_after, |k| entity.after(k));
            let update = match (before, after) {
                (None, Some(after)) => IndexEntryUpdate::added(desc.id, entity.entity_id, after),
                (Some(before), None) => {
                    IndexEntryUpdate::removed(desc.id, entity.entity_id, before)
                }
                (Some(before), Some(after)) if before != after => {
                    IndexEntryUpdate::changed(desc.id, entity.entity_id, before, after)
                }
                _ => continue,
            };
            out.push(update);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PropertyUpdate, TokenSet, ValueChange};
    use serde_json::json;

    fn person_name() -> IndexDescriptor {
        IndexDescriptor::new(1, "person_name", SchemaDescriptor::for_nodes(&[1], &[10]))
    }

    #[test]
    fn test_scan_entity_is_added() {
        let desc = person_name();
        let entity = EntityUpdates::from_scan(
            5,
            EntityType::Node,
            TokenSet::from_slice(&[1]),
            vec![(10, json!("Taylor"))],
        );
        let updates = PropertySchemaMatcher.index_updates(&entity, &[&desc]);
        assert_eq!(updates, vec![IndexEntryUpdate::added(1, 5, vec![json!("Taylor")])]);
    }

    #[test]
    fn test_entity_without_token_or_property_is_ignored() {
        let desc = person_name();
        let other_label = EntityUpdates::from_scan(
            5,
            EntityType::Node,
            TokenSet::from_slice(&[2]),
            vec![(10, json!("Taylor"))],
        );
        let missing_property =
            EntityUpdates::from_scan(6, EntityType::Node, TokenSet::from_slice(&[1]), vec![]);
        assert!(PropertySchemaMatcher.index_updates(&other_label, &[&desc]).is_empty());
        assert!(PropertySchemaMatcher.index_updates(&missing_property, &[&desc]).is_empty());
    }

    #[test]
    fn test_changed_and_removed() {
        let desc = person_name();
        let changed = EntityUpdates {
            entity_id: 5,
            entity_type: EntityType::Node,
            tokens_before: TokenSet::from_slice(&[1]),
            tokens_after: TokenSet::from_slice(&[1]),
            properties: vec![PropertyUpdate {
                key: 10,
                before: Some(json!("a")),
                after: Some(json!("b")),
            }],
        };
        let updates = PropertySchemaMatcher.index_updates(&changed, &[&desc]);
        assert_eq!(
            updates[0].change,
            ValueChange::Changed { before: vec![json!("a")], after: vec![json!("b")] }
        );

        // Label removed: entity leaves the index
        let mut unlabeled = changed.clone();
        unlabeled.tokens_after = TokenSet::new();
        let updates = PropertySchemaMatcher.index_updates(&unlabeled, &[&desc]);
        assert_eq!(updates[0].change, ValueChange::Removed(vec![json!("a")]));
    }

    #[test]
    fn test_composite_key_requires_all_properties() {
        let desc = IndexDescriptor::new(2, "composite", SchemaDescriptor::for_nodes(&[1], &[10, 11]));
        let partial = EntityUpdates::from_scan(
            1,
            EntityType::Node,
            TokenSet::from_slice(&[1]),
            vec![(10, json!(1))],
        );
        assert!(PropertySchemaMatcher.index_updates(&partial, &[&desc]).is_empty());

        let full = EntityUpdates::from_scan(
            1,
            EntityType::Node,
            TokenSet::from_slice(&[1]),
            vec![(11, json!(2)), (10, json!(1))],
        );
        let updates = PropertySchemaMatcher.index_updates(&full, &[&desc]);
        assert_eq!(updates[0].values(), Some(&[json!(1), json!(2)][..]));
    }

    #[test]
    fn test_descriptor_from_json() {
        let desc: IndexDescriptor = serde_json::from_str(
            r#"{"id":4,"name":"email","schema":{"entity_type":"Node","entity_tokens":[3],"property_keys":[7]},"unique":true}"#,
        )
        .unwrap();
        assert!(desc.unique);
        assert!(desc.capability.supports(IndexPredicate::Range));
    }
}
