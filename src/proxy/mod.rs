//! Index proxies: the object callers hold for one index, whatever state it is in.
//!
//! A proxy is layered as
//! `IndexLifecycleGuard<Arc<FlippableIndexProxy>>`:
//! - [`IndexLifecycleGuard`] enforces the legal call sequence and counts
//!   in-flight calls
//! - [`FlippableIndexProxy`] holds the current [`IndexBehavior`] and swaps it
//!   atomically when population finishes

mod behavior;
mod contract;
mod flip;

pub use behavior::{
    FailedIndex, FailedIndexProxyFactory, IndexBehavior, OnlineIndex, PopulatingIndex,
    RecoveringIndex, TentativeConstraintIndex,
};
pub use contract::{IndexLifecycleGuard, LifecycleState};
pub use flip::{FlipTarget, FlippableIndexProxy};

use crate::error::Result;
use crate::population::{IndexPopulationFailure, IndexReader, IndexUpdater};
use crate::schema::IndexDescriptor;
use crate::types::{IndexEntryUpdate, IndexUpdateMode, InternalIndexState, PopulationProgress};
use std::sync::Arc;
use std::time::Duration;

/// Proxy type handed out by the indexing service.
pub type GuardedIndexProxy = IndexLifecycleGuard<Arc<FlippableIndexProxy>>;

/// Operations every index proxy layer supports.
pub trait IndexProxy: Send + Sync {
    fn descriptor(&self) -> &IndexDescriptor;

    fn state(&self) -> InternalIndexState;

    fn create(&self) -> Result<()>;

    /// Updater that keeps the proxy's current behavior pinned until closed.
    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater + '_>>;

    fn force(&self) -> Result<()>;

    fn drop_index(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn failure(&self) -> Option<IndexPopulationFailure>;

    fn new_reader(&self) -> Result<Box<dyn IndexReader>>;

    /// Blocks until the store scan feeding this index finished. Returns
    /// `false` if it did not finish within `timeout`, or if the index is not
    /// populating.
    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool>;

    /// Fails if the index cannot be activated, e.g. a uniqueness conflict.
    fn validate(&self) -> Result<()>;

    fn activate(&self) -> Result<()>;

    fn progress(&self) -> PopulationProgress;

    /// Applies `updates` through one updater.
    fn update(&self, updates: Vec<IndexEntryUpdate>, mode: IndexUpdateMode) -> Result<()> {
        let mut updater = self.new_updater(mode)?;
        for update in updates {
            updater.process(update)?;
        }
        updater.close()
    }
}

impl<T: IndexProxy + ?Sized> IndexProxy for Arc<T> {
    fn descriptor(&self) -> &IndexDescriptor {
        (**self).descriptor()
    }

    fn state(&self) -> InternalIndexState {
        (**self).state()
    }

    fn create(&self) -> Result<()> {
        (**self).create()
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater + '_>> {
        (**self).new_updater(mode)
    }

    fn force(&self) -> Result<()> {
        (**self).force()
    }

    fn drop_index(&self) -> Result<()> {
        (**self).drop_index()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn failure(&self) -> Option<IndexPopulationFailure> {
        (**self).failure()
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        (**self).new_reader()
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        (**self).await_store_scan_completed(timeout)
    }

    fn validate(&self) -> Result<()> {
        (**self).validate()
    }

    fn activate(&self) -> Result<()> {
        (**self).activate()
    }

    fn progress(&self) -> PopulationProgress {
        (**self).progress()
    }
}
