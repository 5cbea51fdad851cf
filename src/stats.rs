//! In-memory index statistics.

use crate::types::{IndexId, IndexSample};
use dashmap::DashMap;

/// Latest sample per index. Reset when population starts, replaced when the
/// index flips online.
#[derive(Debug, Default)]
pub struct IndexStatisticsStore {
    samples: DashMap<IndexId, IndexSample>,
}

impl IndexStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, index: IndexId) {
        self.samples.insert(index, IndexSample::default());
    }

    pub fn replace(&self, index: IndexId, sample: IndexSample) {
        self.samples.insert(index, sample);
    }

    pub fn remove(&self, index: IndexId) {
        self.samples.remove(&index);
    }

    pub fn sample(&self, index: IndexId) -> Option<IndexSample> {
        self.samples.get(&index).map(|s| *s)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_then_replace() {
        let stats = IndexStatisticsStore::new();
        stats.reset(1);
        assert_eq!(stats.sample(1), Some(IndexSample::default()));
        stats.replace(1, IndexSample::new(10, 4, 10));
        assert_eq!(stats.sample(1).unwrap().unique_values, 4);
        stats.remove(1);
        assert!(stats.is_empty());
    }
}
