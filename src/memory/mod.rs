//! In-memory collaborators: index storage and an entity store.
//!
//! Used by tests and by embedders that keep their graph in memory.

mod index;
mod store;

pub use index::{IndexStorage, InMemoryAccessor, InMemoryIndexProvider, InMemoryPopulator};
pub use store::{EntityRecord, InMemoryStoreView};
