//! Call-sequence contract for index proxies.

use super::IndexProxy;
use crate::error::{IndexError, Result};
use crate::population::{IndexPopulationFailure, IndexReader, IndexUpdater};
use crate::schema::IndexDescriptor;
use crate::types::{IndexEntryUpdate, IndexUpdateMode, InternalIndexState, PopulationProgress};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle of a guarded proxy.
///
/// ```text
/// Init -> Creating -> Created -> Online  -> Closed
///   |                    |   \-> Failed  -> Closed (drop only)
///   \-> Closed           \-> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Init = 0,
    Creating = 1,
    Created = 2,
    Online = 3,
    Failed = 4,
    Closed = 5,
}

impl LifecycleState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => LifecycleState::Init,
            1 => LifecycleState::Creating,
            2 => LifecycleState::Created,
            3 => LifecycleState::Online,
            4 => LifecycleState::Failed,
            _ => LifecycleState::Closed,
        }
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Init, Creating)
                | (Init, Closed)
                | (Creating, Created)
                | (Created, Online)
                | (Created, Failed)
                | (Created, Closed)
                | (Online, Closed)
                | (Failed, Closed)
        )
    }

    /// States in which updates and force calls are admitted.
    fn admits_calls(self) -> bool {
        matches!(self, LifecycleState::Created | LifecycleState::Online)
    }
}

// State byte in the top 8 bits, in-flight call count below.
const STATE_SHIFT: u32 = 56;
const COUNT_MASK: u64 = (1 << STATE_SHIFT) - 1;

#[inline]
fn pack(state: LifecycleState, count: u64) -> u64 {
    ((state as u64) << STATE_SHIFT) | (count & COUNT_MASK)
}

#[inline]
fn unpack(word: u64) -> (LifecycleState, u64) {
    (
        LifecycleState::from_bits((word >> STATE_SHIFT) as u8),
        word & COUNT_MASK,
    )
}

/// Wraps a proxy and rejects calls that violate the lifecycle:
/// - `create` exactly once, first
/// - updates and `force` only while created or online
/// - `close`/`drop_index` only with no call in flight, and only once
///
/// State and in-flight count share one atomic word, so admitting a call and
/// closing can never both succeed against the same snapshot.
pub struct IndexLifecycleGuard<P: IndexProxy> {
    delegate: P,
    word: AtomicU64,
}

impl<P: IndexProxy> IndexLifecycleGuard<P> {
    pub fn new(delegate: P) -> Self {
        Self {
            delegate,
            word: AtomicU64::new(pack(LifecycleState::Init, 0)),
        }
    }

    pub fn delegate(&self) -> &P {
        &self.delegate
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        unpack(self.word.load(Ordering::Acquire)).0
    }

    pub fn in_flight(&self) -> u64 {
        unpack(self.word.load(Ordering::Acquire)).1
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        debug_assert!(from.can_transition_to(to));
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (state, count) = unpack(current);
            if state != from {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                pack(to, count),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Follows the delegate from created to online or failed.
    fn sync_with_delegate(&self) {
        if self.lifecycle_state() != LifecycleState::Created {
            return;
        }
        match self.delegate.state() {
            InternalIndexState::Online => {
                self.transition(LifecycleState::Created, LifecycleState::Online);
            }
            InternalIndexState::Failed => {
                self.transition(LifecycleState::Created, LifecycleState::Failed);
            }
            InternalIndexState::Populating => {}
        }
    }

    fn enter_call(&self, operation: &str) -> Result<InFlightCall<'_>> {
        self.sync_with_delegate();
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (state, count) = unpack(current);
            if !state.admits_calls() {
                return Err(self.rejection(operation, state));
            }
            match self.word.compare_exchange_weak(
                current,
                pack(state, count + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(InFlightCall { word: &self.word }),
                Err(actual) => current = actual,
            }
        }
    }

    fn rejection(&self, operation: &str, state: LifecycleState) -> IndexError {
        let id = self.delegate.descriptor().id;
        match state {
            LifecycleState::Closed => {
                IndexError::ProxyClosed(format!("{operation} on closed index {id}"))
            }
            LifecycleState::Failed => IndexError::IndexFailed {
                index: id,
                cause: self
                    .delegate
                    .failure()
                    .map(|f| f.as_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            other => IndexError::IllegalState(format!(
                "{operation} on index {id} in state {other:?}"
            )),
        }
    }

    /// Moves to `Closed` if no call is in flight. Returns whether the
    /// delegate still needs to be shut down.
    fn enter_closed(&self, operation: &str) -> Result<bool> {
        self.sync_with_delegate();
        let id = self.delegate.descriptor().id;
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let (state, count) = unpack(current);
            let delegate = match state {
                LifecycleState::Init => false,
                LifecycleState::Created | LifecycleState::Online => true,
                LifecycleState::Failed if operation == "drop" => true,
                LifecycleState::Failed => {
                    return Err(IndexError::IllegalState(format!(
                        "{operation} on failed index {id}, only drop is allowed"
                    )))
                }
                LifecycleState::Creating => {
                    return Err(IndexError::IllegalState(format!(
                        "{operation} on index {id} while it is being created"
                    )))
                }
                LifecycleState::Closed => {
                    return Err(IndexError::ProxyClosed(format!(
                        "{operation} on already closed index {id}"
                    )))
                }
            };
            if count > 0 {
                return Err(IndexError::ConcurrentOperation {
                    operation: operation.to_string(),
                    in_flight: count,
                });
            }
            match self.word.compare_exchange_weak(
                current,
                pack(LifecycleState::Closed, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(delegate),
                Err(actual) => current = actual,
            }
        }
    }
}

impl<P: IndexProxy> IndexProxy for IndexLifecycleGuard<P> {
    fn descriptor(&self) -> &IndexDescriptor {
        self.delegate.descriptor()
    }

    fn state(&self) -> InternalIndexState {
        self.delegate.state()
    }

    fn create(&self) -> Result<()> {
        if !self.transition(LifecycleState::Init, LifecycleState::Creating) {
            return Err(IndexError::IllegalState(format!(
                "create on index {} in state {:?}",
                self.delegate.descriptor().id,
                self.lifecycle_state()
            )));
        }
        let _created = CreateDone { guard: self };
        self.delegate.create()
    }

    fn new_updater(&self, mode: IndexUpdateMode) -> Result<Box<dyn IndexUpdater + '_>> {
        let call = self.enter_call("update")?;
        let inner = self.delegate.new_updater(mode)?;
        Ok(Box::new(GuardedUpdater { inner, _call: call }))
    }

    fn force(&self) -> Result<()> {
        let _call = self.enter_call("force")?;
        self.delegate.force()
    }

    fn drop_index(&self) -> Result<()> {
        if self.enter_closed("drop")? {
            self.delegate.drop_index()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.enter_closed("close")? {
            self.delegate.close()?;
        }
        Ok(())
    }

    fn failure(&self) -> Option<IndexPopulationFailure> {
        self.delegate.failure()
    }

    fn new_reader(&self) -> Result<Box<dyn IndexReader>> {
        if self.lifecycle_state() == LifecycleState::Closed {
            return Err(self.rejection("read", LifecycleState::Closed));
        }
        self.delegate.new_reader()
    }

    fn await_store_scan_completed(&self, timeout: Duration) -> Result<bool> {
        self.delegate.await_store_scan_completed(timeout)
    }

    fn validate(&self) -> Result<()> {
        self.delegate.validate()
    }

    fn activate(&self) -> Result<()> {
        if self.lifecycle_state() == LifecycleState::Closed {
            return Err(self.rejection("activate", LifecycleState::Closed));
        }
        self.delegate.activate()?;
        self.sync_with_delegate();
        Ok(())
    }

    fn progress(&self) -> PopulationProgress {
        self.delegate.progress()
    }
}

/// Marks the guard created when the delegate's create ends, however it ends.
struct CreateDone<'a, P: IndexProxy> {
    guard: &'a IndexLifecycleGuard<P>,
}

impl<P: IndexProxy> Drop for CreateDone<'_, P> {
    fn drop(&mut self) {
        self.guard
            .transition(LifecycleState::Creating, LifecycleState::Created);
    }
}

/// Decrements the in-flight count when the call ends, however it ends.
struct InFlightCall<'a> {
    word: &'a AtomicU64,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.word.fetch_sub(1, Ordering::AcqRel);
    }
}

struct GuardedUpdater<'a> {
    inner: Box<dyn IndexUpdater + 'a>,
    _call: InFlightCall<'a>,
}

impl IndexUpdater for GuardedUpdater<'_> {
    fn process(&mut self, update: IndexEntryUpdate) -> Result<()> {
        self.inner.process(update)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let GuardedUpdater { inner, _call } = *self;
        inner.close()
    }
}
