//! Wired application context.
//!
//! Every component is explicitly constructed and dependency-injected; there
//! are no singletons. [`MeshContext`] is the single owner the surrounding
//! application holds, handing `Arc` references to consumers. Fresh contexts
//! are cheap, which keeps unit tests isolated.

use crate::backend::{BackupService, InMemoryBackups, InMemoryStore, RecordStore};
use crate::cache::{NamespaceConfig, VectorCache};
use crate::compress::{Compressor, MethodParams};
use crate::config::MeshConfig;
use crate::events::{EventSink, TracingSink};
use crate::governor::{GovernorConfig, ResourceGovernor};
use crate::memory::MemoryTracker;
use crate::metrics::MetricsRegistry;
use crate::sharding::{EntityShardConfig, MigrationCoordinator, ShardManager, ShardRouter};
use mesh_core::{EntityKind, NodeHandle};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Builder for [`MeshContext`].
pub struct MeshContextBuilder {
    config: MeshConfig,
    events: Arc<dyn EventSink>,
    store: Arc<dyn RecordStore>,
    backup: Arc<dyn BackupService>,
}

impl MeshContextBuilder {
    /// Swaps the event sink (defaults to [`TracingSink`]).
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Swaps the persistence collaborator (defaults to [`InMemoryStore`]).
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    /// Swaps the backup collaborator (defaults to [`InMemoryBackups`]).
    pub fn with_backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = backup;
        self
    }

    /// Wires everything together.
    pub fn build(self) -> MeshContext {
        let config = self.config;

        let memory = Arc::new(MemoryTracker::new(config.governor.heap_limit_mb, 0.9));
        let compressor = Arc::new(Compressor::new(
            config.compression.min_accuracy,
            self.events.clone(),
        ));
        let params = MethodParams {
            nsubvectors: config.compression.nsubvectors,
            nbits: config.compression.nbits,
            nlist: config.compression.nlist,
        };
        let cache = Arc::new(
            VectorCache::new(compressor.clone(), memory.clone(), self.events.clone())
                .with_params(params),
        );

        let manager = Arc::new(RwLock::new(ShardManager::new()));
        let router = Arc::new(ShardRouter::new(manager.clone()));
        let coordinator = Arc::new(
            MigrationCoordinator::new(
                manager.clone(),
                self.store,
                self.backup,
                self.events.clone(),
            )
            .with_batch_size(config.sharding.migration_batch_size),
        );

        let governor_config = GovernorConfig {
            tick_interval: Duration::from_secs(config.governor.tick_interval_secs),
            heap_limit_bytes: config.governor.heap_limit_mb * 1024 * 1024,
            gc_threshold: config.governor.gc_threshold,
            max_cache_bytes: config.governor.max_cache_mb * 1024 * 1024,
            ..Default::default()
        };
        let governor = Arc::new(
            ResourceGovernor::new(
                governor_config,
                cache.clone(),
                compressor.clone(),
                memory.clone(),
                self.events.clone(),
            )
            .with_sharding(router.clone(), coordinator.clone()),
        );

        let metrics = Arc::new(MetricsRegistry::new().expect("metric names are static"));

        MeshContext {
            config,
            events: self.events,
            memory,
            compressor,
            cache,
            manager,
            router,
            coordinator,
            governor,
            metrics,
        }
    }
}

/// The wired subsystem: one owner, `Arc`-shared components.
pub struct MeshContext {
    pub config: MeshConfig,
    pub events: Arc<dyn EventSink>,
    pub memory: Arc<MemoryTracker>,
    pub compressor: Arc<Compressor>,
    pub cache: Arc<VectorCache>,
    pub manager: Arc<RwLock<ShardManager>>,
    pub router: Arc<ShardRouter>,
    pub coordinator: Arc<MigrationCoordinator>,
    pub governor: Arc<ResourceGovernor>,
    pub metrics: Arc<MetricsRegistry>,
}

impl MeshContext {
    /// Starts building a context from configuration.
    pub fn builder(config: MeshConfig) -> MeshContextBuilder {
        MeshContextBuilder {
            config,
            events: Arc::new(TracingSink),
            store: Arc::new(InMemoryStore::new()),
            backup: Arc::new(InMemoryBackups::new()),
        }
    }

    /// Builds a context with all defaults.
    pub fn from_config(config: MeshConfig) -> Self {
        Self::builder(config).build()
    }

    /// Namespace config derived from the configured cache defaults.
    pub fn namespace_config(&self) -> NamespaceConfig {
        let cache = &self.config.cache;
        NamespaceConfig {
            max_entries: cache.max_entries,
            max_bytes: cache.max_bytes,
            default_ttl: cache.default_ttl_secs.map(Duration::from_secs),
            update_age_on_get: cache.update_age_on_get,
            compression_enabled: cache.compression_enabled,
            compression_dim_threshold: cache.compression_dim_threshold,
        }
    }

    /// Initializes a shard table, using configured defaults for the counts.
    pub fn init_entity(
        &self,
        kind: EntityKind,
        key_field: &str,
        nodes: &[NodeHandle],
    ) -> Result<(), crate::sharding::ShardError> {
        let config = EntityShardConfig::hash(key_field, self.config.sharding.default_shard_count)
            .with_replication(self.config.sharding.replication_factor);
        self.manager.write().unwrap().init_entity(kind, config, nodes)
    }

    /// Pushes current gauge values into the metrics registry.
    ///
    /// Call from the application's scrape path; counters are updated by the
    /// components themselves through events.
    pub fn update_metrics(&self) {
        self.metrics.set_cache_bytes(self.cache.total_bytes() as i64);
        self.metrics.set_vector_count(self.cache.total_entries() as i64);
        self.metrics.set_heap_used(self.memory.used_bytes() as i64);
        self.metrics
            .set_compression_ratio(self.compressor.average_ratio() as f64);
    }
}

impl std::fmt::Debug for MeshContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshContext")
            .field("cache", &self.cache)
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_defaults() {
        let ctx = MeshContext::from_config(MeshConfig::default());
        assert_eq!(ctx.cache.total_entries(), 0);
        assert_eq!(ctx.memory.used_bytes(), 0);

        let ns = ctx.namespace_config();
        assert!(ns.compression_enabled);
        assert_eq!(ns.compression_dim_threshold, 512);
    }

    #[test]
    fn test_init_entity_uses_defaults() {
        let ctx = MeshContext::from_config(MeshConfig::default());
        let kind = EntityKind::new("novel");
        ctx.init_entity(kind.clone(), "id", &[NodeHandle::new("node-a")])
            .unwrap();

        let manager = ctx.manager.read().unwrap();
        assert_eq!(
            manager.shards(&kind).unwrap().len(),
            ctx.config.sharding.default_shard_count as usize
        );
    }

    #[test]
    fn test_fresh_contexts_are_isolated() {
        let a = MeshContext::from_config(MeshConfig::default());
        let b = MeshContext::from_config(MeshConfig::default());

        a.cache
            .create_namespace("anchors", a.namespace_config())
            .unwrap();
        assert!(b.cache.namespace_names().is_empty());
    }
}
