//! # Mesh Storage
//!
//! Adaptive vector storage for VectorMesh: keeps high-dimensional embedding
//! data available in memory under bounded resource budgets while the dataset
//! is horizontally partitioned across shards.
//!
//! Three mechanisms cooperate:
//!
//! - [`cache::VectorCache`] - per-namespace store with LRU + TTL eviction and
//!   transparent lossy compression for large vectors,
//! - [`sharding`] - deterministic key routing with online rebalancing and
//!   validated data migration,
//! - [`governor::ResourceGovernor`] - a timer-driven backpressure loop that
//!   turns memory pressure into eviction, compression and rebalancing.
//!
//! Everything is explicitly constructed and dependency-injected;
//! [`context::MeshContext`] owns a wired instance of the whole subsystem.

pub mod backend;
pub mod cache;
pub mod compress;
pub mod config;
pub mod context;
pub mod events;
pub mod governor;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod sharding;

// Re-exports
pub use cache::{CacheError, CacheStats, NamespaceConfig, VectorCache};
pub use compress::{CodecReport, CompressError, Compressor, Method, MethodParams};
pub use config::MeshConfig;
pub use context::MeshContext;
pub use events::{Event, EventSink, MemorySink, NullSink, TracingSink};
pub use governor::{GovernorConfig, ResourceGovernor, ResourceSnapshot};
pub use memory::MemoryTracker;
pub use sharding::{
    EntityShardConfig, MigrationCoordinator, ShardError, ShardId, ShardManager, ShardRouter,
    Strategy,
};
