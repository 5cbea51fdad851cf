//! Registry of index proxies by id.

use crate::proxy::{GuardedIndexProxy, IndexProxy};
use crate::schema::IndexDescriptor;
use crate::types::IndexId;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct IndexMap {
    proxies: DashMap<IndexId, Arc<GuardedIndexProxy>>,
}

impl IndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the proxy previously registered under the same id.
    pub fn insert(&self, proxy: Arc<GuardedIndexProxy>) -> Option<Arc<GuardedIndexProxy>> {
        self.proxies.insert(proxy.descriptor().id, proxy)
    }

    pub fn get(&self, index: IndexId) -> Option<Arc<GuardedIndexProxy>> {
        self.proxies.get(&index).map(|p| Arc::clone(p.value()))
    }

    pub fn remove(&self, index: IndexId) -> Option<Arc<GuardedIndexProxy>> {
        self.proxies.remove(&index).map(|(_, p)| p)
    }

    pub fn contains(&self, index: IndexId) -> bool {
        self.proxies.contains_key(&index)
    }

    /// All proxies, ordered by index id.
    pub fn all(&self) -> Vec<Arc<GuardedIndexProxy>> {
        let mut proxies: Vec<_> = self.proxies.iter().map(|p| Arc::clone(p.value())).collect();
        proxies.sort_by_key(|p| p.descriptor().id);
        proxies
    }

    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.all().iter().map(|p| p.descriptor().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
