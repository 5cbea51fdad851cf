//! The concrete behaviors a [`super::FlippableIndexProxy`] switches between.

use crate::error::{IndexError, Result};
use crate::population::{
    IndexAccessor, IndexPopulation, IndexPopulationFailure, IndexPopulationJob, IndexPopulator,
    IndexReader, IndexUpdater,
};
use crate::types::{
    IndexEntryUpdate, IndexId, IndexUpdateMode, InternalIndexState, PopulationProgress,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Current behavior of an index. The set is closed, so dispatch is a match.
pub enum IndexBehavior {
    Populating(PopulatingIndex),
    Online(OnlineIndex),
    Failed(FailedIndex),
    Recovering(RecoveringIndex),
    TentativeConstraint(TentativeConstraintIndex),
}

impl IndexBehavior {
    pub fn state(&self) -> InternalIndexState {
        match self {
            IndexBehavior::Populating(_) | IndexBehavior::Recovering(_) => {
                InternalIndexState::Populating
            }
            IndexBehavior::Online(_) | IndexBehavior::TentativeConstraint(_) => {
                InternalIndexState::Online
            }
            IndexBehavior::Failed(_) => InternalIndexState::Failed,
        }
    }

    pub fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater>> {
        match self {
            IndexBehavior::Populating(b) => Ok(Box::new(QueueingUpdater { job: b.job.clone() })),
            IndexBehavior::Online(b) => b.accessor.new_updater(mode),
            IndexBehavior::TentativeConstraint(b) => Ok(Box::new(TentativeUpdater {
                inner: b.accessor.new_updater(mode)?,
                conflicts: Arc::clone(&b.conflicts),
            })),
            IndexBehavior::Failed(b) => Err(IndexError::IndexFailed {
                index: b.index,
                cause: b.failure.as_string(),
            }),
            IndexBehavior::Recovering(b) => Err(IndexError::IllegalState(format!(
                "index {} is recovering and accepts no updates",
                b.index
            ))),
        }
    }

    pub fn force(&self) -> Result<()> {
        match self {
            IndexBehavior::Online(b) => b.accessor.force(),
            IndexBehavior::TentativeConstraint(b) => b.accessor.force(),
            _ => Ok(()),
        }
    }

    pub fn drop_index(&self) -> Result<()> {
        match self {
            IndexBehavior::Populating(b) => match b.live() {
                Some((job, population)) => job.drop_population(&population),
                None => Ok(()),
            },
            IndexBehavior::Online(b) => b.accessor.drop_index(),
            IndexBehavior::TentativeConstraint(b) => b.accessor.drop_index(),
            IndexBehavior::Failed(b) => b.populator.drop_index(),
            IndexBehavior::Recovering(_) => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            IndexBehavior::Populating(b) => match b.live() {
                Some((job, population)) => job.stop_population(&population),
                None => Ok(()),
            },
            IndexBehavior::Online(b) => b.accessor.close(),
            IndexBehavior::TentativeConstraint(b) => b.accessor.close(),
            IndexBehavior::Failed(_) | IndexBehavior::Recovering(_) => Ok(()),
        }
    }

    pub fn failure(&self) -> Option<IndexPopulationFailure> {
        match self {
            IndexBehavior::Failed(b) => Some(b.failure.clone()),
            _ => None,
        }
    }

    pub fn new_reader(&self, index: IndexId) -> Result<Box<dyn IndexReader>> {
        match self {
            IndexBehavior::Online(b) => b.accessor.new_reader(),
            IndexBehavior::TentativeConstraint(b) => b.accessor.new_reader(),
            IndexBehavior::Failed(b) => Err(IndexError::IndexFailed {
                index,
                cause: b.failure.as_string(),
            }),
            _ => Err(IndexError::IndexNotOnline(index)),
        }
    }

    /// Population job to wait on, if this index is still populating.
    pub fn population_job(&self) -> Option<Arc<IndexPopulationJob>> {
        match self {
            IndexBehavior::Populating(b) => b.job.upgrade(),
            _ => None,
        }
    }

    pub fn progress(&self) -> PopulationProgress {
        match self {
            IndexBehavior::Populating(b) => b
                .job
                .upgrade()
                .map(|job| job.progress())
                .unwrap_or(PopulationProgress::NONE),
            IndexBehavior::Recovering(_) => PopulationProgress::NONE,
            _ => PopulationProgress::DONE,
        }
    }

    pub fn validate(&self, index: IndexId) -> Result<()> {
        match self {
            IndexBehavior::Online(_) => Ok(()),
            IndexBehavior::TentativeConstraint(b) => b.first_conflict().map_or(Ok(()), Err),
            IndexBehavior::Failed(b) => Err(b.failure_error()),
            IndexBehavior::Populating(_) | IndexBehavior::Recovering(_) => Err(
                IndexError::IllegalState(format!("index {index} is still populating")),
            ),
        }
    }
}

/// Index whose store scan is still running. Updates are queued on the
/// population job and interleaved into the scan.
pub struct PopulatingIndex {
    job: Weak<IndexPopulationJob>,
    population: Weak<IndexPopulation>,
}

impl PopulatingIndex {
    pub fn new(job: &Arc<IndexPopulationJob>, population: &Arc<IndexPopulation>) -> Self {
        Self {
            job: Arc::downgrade(job),
            population: Arc::downgrade(population),
        }
    }

    fn live(&self) -> Option<(Arc<IndexPopulationJob>, Arc<IndexPopulation>)> {
        Some((self.job.upgrade()?, self.population.upgrade()?))
    }
}

pub struct OnlineIndex {
    accessor: Arc<dyn IndexAccessor>,
}

impl OnlineIndex {
    pub fn new(accessor: Arc<dyn IndexAccessor>) -> Self {
        Self { accessor }
    }
}

pub struct FailedIndex {
    index: IndexId,
    populator: Arc<dyn IndexPopulator>,
    failure: IndexPopulationFailure,
}

impl FailedIndex {
    fn failure_error(&self) -> IndexError {
        let cause = self.failure.cause();
        if cause.is_entry_conflict() {
            return cause.clone();
        }
        IndexError::IndexFailed {
            index: self.index,
            cause: self.failure.as_string(),
        }
    }
}

/// Index loaded during recovery; it becomes usable once repopulated.
pub struct RecoveringIndex {
    index: IndexId,
}

impl RecoveringIndex {
    pub fn new(index: IndexId) -> Self {
        Self { index }
    }
}

/// Online uniqueness index whose constraint is not yet enforced. Conflicts
/// are recorded instead of rejected and reported by `validate`.
pub struct TentativeConstraintIndex {
    accessor: Arc<dyn IndexAccessor>,
    conflicts: Arc<Mutex<Vec<IndexError>>>,
}

impl TentativeConstraintIndex {
    pub fn new(accessor: Arc<dyn IndexAccessor>) -> Self {
        Self {
            accessor,
            conflicts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn accessor(&self) -> Arc<dyn IndexAccessor> {
        Arc::clone(&self.accessor)
    }

    fn first_conflict(&self) -> Option<IndexError> {
        self.conflicts.lock().first().cloned()
    }
}

/// Builds the failed behavior an index flips to when population fails.
#[derive(Clone)]
pub struct FailedIndexProxyFactory {
    index: IndexId,
    populator: Arc<dyn IndexPopulator>,
}

impl FailedIndexProxyFactory {
    pub fn new(index: IndexId, populator: Arc<dyn IndexPopulator>) -> Self {
        Self { index, populator }
    }

    pub fn create(&self, failure: IndexPopulationFailure) -> IndexBehavior {
        IndexBehavior::Failed(FailedIndex {
            index: self.index,
            populator: Arc::clone(&self.populator),
            failure,
        })
    }
}

struct QueueingUpdater {
    job: Weak<IndexPopulationJob>,
}

impl IndexUpdater for QueueingUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        // A finished job has nothing left to feed
        if let Some(job) = self.job.upgrade() {
            job.queue_update(update);
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct TentativeUpdater {
    inner: Box<dyn IndexUpdater>,
    conflicts: Arc<Mutex<Vec<IndexError>>>,
}

impl IndexUpdater for TentativeUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        match self.inner.process(update) {
            Err(e) if e.is_entry_conflict() => {
                self.conflicts.lock().push(e);
                Ok(())
            }
            other => other,
        }
    }

    fn close(self: Box<Self>) -> Result<()> {
        let TentativeUpdater { inner, conflicts } = *self;
        match inner.close() {
            Err(e) if e.is_entry_conflict() => {
                conflicts.lock().push(e);
                Ok(())
            }
            other => other,
        }
    }
}
