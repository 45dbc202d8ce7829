//! Prometheus metrics export for VectorMesh.
//!
//! # Feature Flag
//!
//! Metrics are only available when the `metrics` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! mesh-storage = { version = "*", features = ["metrics"] }
//! ```
//!
//! # Metrics Exported
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `vectormesh_cache_hits_total` | Counter | Cache hit count |
//! | `vectormesh_cache_misses_total` | Counter | Cache miss count |
//! | `vectormesh_cache_evictions_total` | Counter | Evicted entries |
//! | `vectormesh_cache_bytes` | Gauge | Aggregate cache footprint |
//! | `vectormesh_vectors_total` | Gauge | Cached vector count |
//! | `vectormesh_heap_used_bytes` | Gauge | Tracked heap usage |
//! | `vectormesh_compression_ratio` | Gauge | Mean compression ratio |
//! | `vectormesh_gc_cycles_total` | Counter | Governor reclamation passes |
//! | `vectormesh_migrations_total` | CounterVec | Migrations by outcome |

#[cfg(feature = "metrics")]
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Gauge, Opts, Registry, TextEncoder};

/// Error type for metrics operations.
#[derive(Debug)]
pub struct MetricsError(String);

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsError: {}", self.0)
    }
}

impl std::error::Error for MetricsError {}

#[cfg(feature = "metrics")]
impl From<prometheus::Error> for MetricsError {
    fn from(e: prometheus::Error) -> Self {
        MetricsError(e.to_string())
    }
}

/// Metrics registry for the storage subsystem.
#[cfg(feature = "metrics")]
pub struct MetricsRegistry {
    registry: Registry,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_evictions: IntCounter,
    cache_bytes: IntGauge,
    vector_count: IntGauge,
    heap_used: IntGauge,
    compression_ratio: Gauge,
    gc_cycles: IntCounter,
    migrations: IntCounterVec,
}

#[cfg(feature = "metrics")]
impl MetricsRegistry {
    /// Creates a registry with all metrics registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let cache_hits =
            IntCounter::new("vectormesh_cache_hits_total", "Total cache hits")?;
        let cache_misses =
            IntCounter::new("vectormesh_cache_misses_total", "Total cache misses")?;
        let cache_evictions = IntCounter::new(
            "vectormesh_cache_evictions_total",
            "Entries evicted by capacity pressure or trim",
        )?;
        let cache_bytes = IntGauge::new(
            "vectormesh_cache_bytes",
            "Aggregate cache payload bytes across namespaces",
        )?;
        let vector_count =
            IntGauge::new("vectormesh_vectors_total", "Total cached vectors")?;
        let heap_used = IntGauge::new(
            "vectormesh_heap_used_bytes",
            "Bytes attributed to the subsystem",
        )?;
        let compression_ratio = Gauge::new(
            "vectormesh_compression_ratio",
            "Mean compression ratio across codecs",
        )?;
        let gc_cycles = IntCounter::new(
            "vectormesh_gc_cycles_total",
            "Governor reclamation passes completed",
        )?;
        let migrations = IntCounterVec::new(
            Opts::new("vectormesh_migrations_total", "Migration tasks by outcome"),
            &["outcome"], // "completed" or "failed"
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_bytes.clone()))?;
        registry.register(Box::new(vector_count.clone()))?;
        registry.register(Box::new(heap_used.clone()))?;
        registry.register(Box::new(compression_ratio.clone()))?;
        registry.register(Box::new(gc_cycles.clone()))?;
        registry.register(Box::new(migrations.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_bytes,
            vector_count,
            heap_used,
            compression_ratio,
            gc_cycles,
            migrations,
        })
    }

    /// Records a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    /// Records a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    /// Records evicted entries.
    pub fn record_evictions(&self, count: u64) {
        self.cache_evictions.inc_by(count);
    }

    /// Sets the aggregate cache footprint.
    pub fn set_cache_bytes(&self, bytes: i64) {
        self.cache_bytes.set(bytes);
    }

    /// Sets the cached vector count.
    pub fn set_vector_count(&self, count: i64) {
        self.vector_count.set(count);
    }

    /// Sets tracked heap usage.
    pub fn set_heap_used(&self, bytes: i64) {
        self.heap_used.set(bytes);
    }

    /// Sets the mean compression ratio.
    pub fn set_compression_ratio(&self, ratio: f64) {
        self.compression_ratio.set(ratio);
    }

    /// Records a completed governor reclamation pass.
    pub fn record_gc_cycle(&self) {
        self.gc_cycles.inc();
    }

    /// Records a completed migration.
    pub fn record_migration_completed(&self) {
        self.migrations.with_label_values(&["completed"]).inc();
    }

    /// Records a failed migration.
    pub fn record_migration_failed(&self) {
        self.migrations.with_label_values(&["failed"]).inc();
    }

    /// Exports all metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    /// Cache hit rate (0.0 to 1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get() as f64;
        let misses = self.cache_misses.get() as f64;
        let total = hits + misses;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

#[cfg(feature = "metrics")]
impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("cache_hits", &self.cache_hits.get())
            .field("cache_misses", &self.cache_misses.get())
            .field("cache_bytes", &self.cache_bytes.get())
            .field("gc_cycles", &self.gc_cycles.get())
            .finish()
    }
}

// =============================================================================
// No-op Implementation (when the metrics feature is disabled)
// =============================================================================

/// No-op metrics registry when the `metrics` feature is disabled.
///
/// All methods are no-ops so call sites need no conditional compilation.
#[cfg(not(feature = "metrics"))]
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry;

#[cfg(not(feature = "metrics"))]
impl MetricsRegistry {
    /// Creates a no-op registry.
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self)
    }

    /// No-op.
    pub fn record_cache_hit(&self) {}
    /// No-op.
    pub fn record_cache_miss(&self) {}
    /// No-op.
    pub fn record_evictions(&self, _count: u64) {}
    /// No-op.
    pub fn set_cache_bytes(&self, _bytes: i64) {}
    /// No-op.
    pub fn set_vector_count(&self, _count: i64) {}
    /// No-op.
    pub fn set_heap_used(&self, _bytes: i64) {}
    /// No-op.
    pub fn set_compression_ratio(&self, _ratio: f64) {}
    /// No-op.
    pub fn record_gc_cycle(&self) {}
    /// No-op.
    pub fn record_migration_completed(&self) {}
    /// No-op.
    pub fn record_migration_failed(&self) {}

    /// Returns an empty string (nothing to export).
    pub fn export(&self) -> Result<String, MetricsError> {
        Ok(String::new())
    }

    /// Returns 0.0 (no data).
    pub fn cache_hit_rate(&self) -> f64 {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.set_cache_bytes(1024);
        metrics.set_compression_ratio(3.5);
        metrics.record_gc_cycle();
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_export_contains_metrics() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_cache_hit();
        metrics.record_migration_completed();
        metrics.set_vector_count(42);

        let output = metrics.export().unwrap();
        assert!(output.contains("vectormesh_cache_hits_total"));
        assert!(output.contains("vectormesh_vectors_total"));
        assert!(output.contains("vectormesh_migrations_total"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_cache_hit_rate() {
        let metrics = MetricsRegistry::new().unwrap();
        assert_eq!(metrics.cache_hit_rate(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        assert!((metrics.cache_hit_rate() - 0.75).abs() < 0.01);
    }
}
