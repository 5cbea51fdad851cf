//! Queue of updates committed by live transactions while a scan is running.

use crate::types::{EntityId, IndexEntryUpdate};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Position of a store scan.
///
/// `At(id)` means every entity with an id below `id` has been read and none at
/// or above it. An update for exactly `id` is therefore still ahead of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCursor {
    At(EntityId),
    End,
}

impl ScanCursor {
    /// Whether the scan has already read `entity_id` and will not see it again.
    #[inline]
    pub fn has_passed(&self, entity_id: EntityId) -> bool {
        match self {
            ScanCursor::At(cursor) => entity_id < *cursor,
            ScanCursor::End => true,
        }
    }
}

/// Unbounded multi-producer, single-consumer FIFO.
pub struct ConcurrentUpdateQueue {
    tx: Sender<IndexEntryUpdate>,
    rx: Receiver<IndexEntryUpdate>,
    byte_size: AtomicUsize,
}

impl ConcurrentUpdateQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx, byte_size: AtomicUsize::new(0) }
    }

    pub fn push(&self, update: IndexEntryUpdate) {
        self.byte_size.fetch_add(update.rough_size(), Ordering::AcqRel);
        // Both ends live in self, the channel cannot be disconnected here.
        let _ = self.tx.send(update);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.byte_size.load(Ordering::Acquire)
    }

    /// Whether the scan should stop and drain: the queue crossed the length
    /// threshold or holds too many bytes.
    pub fn needs_drain(&self, queue_threshold: usize, max_bytes: usize) -> bool {
        let len = self.len();
        (len > 0 && len >= queue_threshold) || self.byte_size() >= max_bytes
    }

    /// Pops everything currently queued, including updates pushed while
    /// draining. Bytes are subtracted per popped update so concurrent pushes
    /// do not make the counter drift.
    pub fn drain(&self, mut f: impl FnMut(IndexEntryUpdate)) -> usize {
        let mut drained = 0;
        let mut bytes = 0;
        while let Ok(update) = self.rx.try_recv() {
            bytes += update.rough_size();
            drained += 1;
            f(update);
        }
        self.byte_size.fetch_sub(bytes, Ordering::AcqRel);
        drained
    }
}

impl Default for ConcurrentUpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}
