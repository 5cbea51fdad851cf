//! Index population: one store scan feeding many index builders.
//!
//! # Example
//! ```ignore
//! use graphidx::population::{FlushMode, PopulationConfig};
//!
//! // Concurrent flushing on the default worker count
//! let config = PopulationConfig::default();
//!
//! // Apply batches on the scan thread
//! let config = PopulationConfig::default().flush_mode(FlushMode::Inline);
//! ```

mod batching;
mod failure;
mod job;
mod multiple;
mod queue;
mod traits;

pub use batching::{BatchFlusher, ConcurrentFlushPopulator};
pub use failure::IndexPopulationFailure;
pub use job::IndexPopulationJob;
pub use multiple::{IndexPopulation, IndexPopulationEngine, PopulationBatch};
pub use queue::{ConcurrentUpdateQueue, ScanCursor};
pub use traits::{
    EntityVisitor, ExternalUpdatesCheck, IndexAccessor, IndexPopulator, IndexProvider,
    IndexReader, IndexStoreView, IndexUpdater, ScanFilter, StoreScan,
};

use crate::error::Result;
use serde::Deserialize;
use std::time::Duration;

/// Where scan batches are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// On the scan thread
    Inline,
    /// On a bounded worker pool, off the scan thread (default)
    #[default]
    Concurrent,
}

impl FlushMode {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "inline" | "off" | "sync" => FlushMode::Inline,
            "concurrent" | "pool" | "on" => FlushMode::Concurrent,
            _ => FlushMode::default(),
        }
    }
}

fn default_flush_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Population tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Queued concurrent updates that make the scan pause and drain
    pub queue_threshold: usize,
    /// Entries per target batch before it is flushed
    pub batch_size: usize,
    /// Byte limit for one batch, and for the update queue
    pub batch_max_byte_size: usize,
    /// Flush worker threads (0 = inline)
    pub flush_workers: usize,
    /// Submitted flushes allowed before the scan blocks
    pub max_pending_flushes: usize,
    /// Wait limit for outstanding flushes
    pub await_timeout_minutes: u64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        let workers = default_flush_workers();
        Self {
            queue_threshold: 20_000,
            batch_size: 10_000,
            batch_max_byte_size: 10 * 1024 * 1024,
            flush_workers: workers,
            max_pending_flushes: workers * 2,
            await_timeout_minutes: 30,
        }
    }
}

impl PopulationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn queue_threshold(mut self, threshold: usize) -> Self {
        self.queue_threshold = threshold;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn batch_max_byte_size(mut self, bytes: usize) -> Self {
        self.batch_max_byte_size = bytes;
        self
    }

    pub fn flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    pub fn max_pending_flushes(mut self, pending: usize) -> Self {
        self.max_pending_flushes = pending.max(1);
        self
    }

    pub fn await_timeout_minutes(mut self, minutes: u64) -> Self {
        self.await_timeout_minutes = minutes;
        self
    }

    /// Set flush mode; `Concurrent` keeps the configured worker count.
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        match mode {
            FlushMode::Inline => self.flush_workers = 0,
            FlushMode::Concurrent if self.flush_workers == 0 => {
                self.flush_workers = default_flush_workers()
            }
            FlushMode::Concurrent => {}
        }
        self
    }

    pub fn mode(&self) -> FlushMode {
        if self.flush_workers == 0 {
            FlushMode::Inline
        } else {
            FlushMode::Concurrent
        }
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_secs(self.await_timeout_minutes.saturating_mul(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_mode_parse() {
        assert_eq!(FlushMode::from_str("INLINE"), FlushMode::Inline);
        assert_eq!(FlushMode::from_str("off"), FlushMode::Inline);
        assert_eq!(FlushMode::from_str("pool"), FlushMode::Concurrent);
        assert_eq!(FlushMode::from_str("whatever"), FlushMode::Concurrent);
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = PopulationConfig::from_json(r#"{"queue_threshold": 5, "flush_workers": 0}"#).unwrap();
        assert_eq!(config.queue_threshold, 5);
        assert_eq!(config.mode(), FlushMode::Inline);
        assert_eq!(config.batch_size, PopulationConfig::default().batch_size);
        assert!(PopulationConfig::from_json("{\"batch_size\": \"x\"}").is_err());
    }

    #[test]
    fn test_builder() {
        let config = PopulationConfig::default()
            .flush_mode(FlushMode::Inline)
            .batch_size(0)
            .await_timeout_minutes(2);
        assert_eq!(config.mode(), FlushMode::Inline);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.await_timeout(), Duration::from_secs(120));
        assert_eq!(config.flush_mode(FlushMode::Concurrent).mode(), FlushMode::Concurrent);
    }
}
