use super::behavior::{FailedIndexProxyFactory, IndexBehavior, OnlineIndex};
use super::IndexProxy;
use crate::error::{IndexError, Result};
use crate::population::{IndexPopulationFailure, IndexReader, IndexUpdater};
use crate::schema::IndexDescriptor;
use crate::types::{IndexEntryUpdate, IndexUpdateMode, InternalIndexState, PopulationProgress};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Produces the behavior installed by a successful flip.
pub type FlipTarget = Box<dyn FnOnce() -> Result<IndexBehavior> + Send + Sync>;

struct FlipState {
    delegate: IndexBehavior,
    flip_target: Option<FlipTarget>,
}

/// Proxy whose behavior can be replaced atomically.
///
/// Every delegated call holds the read side of the lock for its duration (an
/// updater holds it until closed), a flip holds the write side. A flip
/// therefore waits for in-flight calls, and no call observes a half-switched
/// proxy. Reads are recursive so a thread holding an updater can still query
/// the proxy while a flip is pending.
pub struct FlippableIndexProxy {
    descriptor: IndexDescriptor,
    state: RwLock<FlipState>,
    closed: AtomicBool,
}

impl FlippableIndexProxy {
    pub fn new(descriptor: IndexDescriptor, initial: IndexBehavior) -> Self {
        Self {
            descriptor,
            state: RwLock::new(FlipState {
                delegate: initial,
                flip_target: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_flip_target(&self, target: FlipTarget) {
        self.state.write().flip_target = Some(target);
    }

    /// Runs `action` exclusively. If it returns `true` the proxy switches to
    /// the flip target. If it fails, or the target cannot be built, the proxy
    /// switches to the failed behavior and the error is returned.
    ///
    /// A proxy already dropped or closed is never switched.
    pub fn flip<F>(&self, action: F, failed: &FailedIndexProxyFactory) -> Result<bool>
    where
        F: FnOnce() -> Result<bool>,
    {
        let mut state = self.state.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::ProxyAlreadyClosed(self.descriptor.id));
        }

        let outcome = action().and_then(|flip| {
            if !flip {
                return Ok(None);
            }
            let target = state.flip_target.take().ok_or_else(|| {
                IndexError::IllegalState(format!(
                    "no flip target set for index {}",
                    self.descriptor.id
                ))
            })?;
            target().map(Some)
        });

        match outcome {
            Ok(Some(behavior)) => {
                state.delegate = behavior;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                state.delegate = failed.create(IndexPopulationFailure::new(e.clone()));
                Err(e)
            }
        }
    }

    /// Unconditional switch, e.g. to the failed behavior.
    pub fn flip_to(&self, behavior: IndexBehavior) {
        self.state.write().delegate = behavior;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read(&self) -> RwLockReadGuard<'_, FlipState> {
        self.state.read_recursive()
    }
}

impl IndexProxy for FlippableIndexProxy {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    fn state(&self) -> InternalIndexState {
        self.read().delegate.state()
    }

    fn create(&self) -> Result<()> {
        Ok(())
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater + '_>> {
        let guard = self.read();
        let inner = guard.delegate.new_updater(mode)?;
        Ok(Box::new(PinnedUpdater { inner, _guard: guard }))
    }

    fn force(&self) -> Result<()> {
        self.read().delegate.force()
    }

    fn drop_index(&self) -> Result<()> {
        let guard = self.read();
        self.closed.store(true, Ordering::Release);
        guard.delegate.drop_index()
    }

    fn close(&self) -> Result<()> {
        let guard = self.read();
        self.closed.store(true, Ordering::Release);
        guard.delegate.close()
    }

    fn failure(&self) -> Option<IndexPopulationFailure> {
        self.read().delegate.failure()
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        self.read().delegate.new_reader(self.descriptor.id)
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        // The job flips this proxy when it finishes: never wait under the lock.
        let job = self.read().delegate.population_job();
        match job {
            Some(job) => job.await_completion(timeout),
            None => Ok(false),
        }
    }

    fn validate(&self) -> Result<()> {
        self.read().delegate.validate(self.descriptor.id)
    }

    fn activate(&self) -> Result<()> {
        let mut state = self.state.write();
        let accessor = match &state.delegate {
            IndexBehavior::Online(_) => return Ok(()),
            IndexBehavior::TentativeConstraint(tentative) => {
                state.delegate.validate(self.descriptor.id)?;
                tentative.accessor()
            }
            other => return other.validate(self.descriptor.id),
        };
        state.delegate = IndexBehavior::Online(OnlineIndex::new(accessor));
        Ok(())
    }

    fn progress(&self) -> PopulationProgress {
        self.read().delegate.progress()
    }
}

struct PinnedUpdater<'a> {
    // Declared first: closes before the lock is released.
    inner: Box<dyn IndexUpdater>,
    _guard: RwLockReadGuard<'a, FlipState>,
}

impl IndexUpdater for PinnedUpdater<'_> {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.inner.process(update)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let PinnedUpdater { inner, _guard } = *self;
        inner.close()
    }
}
