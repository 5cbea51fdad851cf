// graphidx - index lifecycle and concurrent population for a graph store
// One store scan builds many indexes while writes keep flowing.

pub mod error;
pub mod index_map;
pub mod memory;
pub mod population;
pub mod proxy;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod stats;
pub mod types;

// Re-export main types
pub use error::{IndexError, Result};
pub use population::{
    FlushMode, IndexPopulationEngine, IndexPopulationJob, IndexProvider, IndexStoreView,
    PopulationConfig,
};
pub use proxy::{FlippableIndexProxy, GuardedIndexProxy, IndexLifecycleGuard, IndexProxy, LifecycleState};
pub use schema::{IndexDescriptor, PropertySchemaMatcher, SchemaDescriptor, SchemaMatcher};
pub use service::{IndexingConfig, IndexingService};
pub use stats::IndexStatisticsStore;
pub use types::{EntityType, EntityUpdates, IndexEntryUpdate, IndexId, InternalIndexState};
