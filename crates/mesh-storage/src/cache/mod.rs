//! In-memory vector cache with per-namespace budgets and lossy compression.
//!
//! The cache keeps embedding vectors hot under bounded budgets. Each
//! namespace has its own capacity, TTL and compression policy; namespaces are
//! fully independent and serialized by their own lock. Vectors above a
//! namespace's dimension threshold are handed to the [`Compressor`] on write
//! and transparently reconstructed on [`VectorCache::get_vector`] — callers
//! never need to know whether a given entry is compressed.
//!
//! Compression is a best-effort space optimization, not a correctness
//! requirement: if it fails, or does not actually shrink the payload, the
//! entry is stored raw and a `compression_fallback` event is emitted.

mod namespace;

pub use namespace::{CacheStats, Entry, NamespaceConfig, Payload};

use crate::compress::{CompressError, Compressor, Method, MethodParams};
use crate::events::{Event, EventSink};
use crate::memory::MemoryTracker;
use mesh_core::FieldValue;
use namespace::Namespace;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Cache errors surfaced to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("namespace {0} already exists with a different config")]
    ConfigConflict(String),

    #[error("codec failure: {0}")]
    Codec(#[from] CompressError),
}

/// Multi-namespace vector cache.
pub struct VectorCache {
    namespaces: RwLock<HashMap<String, Arc<Mutex<Namespace>>>>,
    compressor: Arc<Compressor>,
    memory: Arc<MemoryTracker>,
    events: Arc<dyn EventSink>,
    params: MethodParams,
}

impl VectorCache {
    /// Creates a cache wired to its collaborators.
    pub fn new(
        compressor: Arc<Compressor>,
        memory: Arc<MemoryTracker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            compressor,
            memory,
            events,
            params: MethodParams::default(),
        }
    }

    /// Overrides the codec parameters used for entry compression.
    pub fn with_params(mut self, params: MethodParams) -> Self {
        self.params = params;
        self
    }

    // =========================================================================
    // Namespace management
    // =========================================================================

    /// Creates a namespace.
    ///
    /// Idempotent when the namespace already exists with an identical config;
    /// fails with `ConfigConflict` otherwise.
    pub fn create_namespace(
        &self,
        name: &str,
        config: NamespaceConfig,
    ) -> Result<(), CacheError> {
        let mut namespaces = self.namespaces.write().unwrap();
        if let Some(existing) = namespaces.get(name) {
            let existing = existing.lock().unwrap();
            if *existing.config() == config {
                return Ok(());
            }
            return Err(CacheError::ConfigConflict(name.to_string()));
        }
        namespaces.insert(
            name.to_string(),
            Arc::new(Mutex::new(Namespace::new(name, config))),
        );
        Ok(())
    }

    /// Destroys a namespace entirely. Returns whether it existed.
    pub fn drop_namespace(&self, name: &str) -> bool {
        let removed = self.namespaces.write().unwrap().remove(name);
        match removed {
            Some(ns) => {
                let freed = ns.lock().unwrap().clear();
                self.memory.release(freed);
                true
            }
            None => false,
        }
    }

    /// Names of all live namespaces.
    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.read().unwrap().keys().cloned().collect()
    }

    fn namespace(&self, name: &str) -> Result<Arc<Mutex<Namespace>>, CacheError> {
        self.namespaces
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::NamespaceNotFound(name.to_string()))
    }

    // =========================================================================
    // Entry operations
    // =========================================================================

    /// Stores a vector under `key`, using the namespace's default TTL.
    pub fn set(
        &self,
        namespace: &str,
        key: &str,
        vector: Vec<f32>,
        metadata: BTreeMap<String, FieldValue>,
    ) -> Result<(), CacheError> {
        self.set_with_ttl(namespace, key, vector, metadata, None)
    }

    /// Stores a vector with an explicit TTL override.
    pub fn set_with_ttl(
        &self,
        namespace: &str,
        key: &str,
        vector: Vec<f32>,
        metadata: BTreeMap<String, FieldValue>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let ns = self.namespace(namespace)?;
        let mut ns = ns.lock().unwrap();

        let payload = self.encode_payload(ns.config(), namespace, key, vector);
        let outcome = ns.insert(key.to_string(), payload, metadata, ttl);
        drop(ns);

        self.settle(namespace, outcome.bytes_delta, &outcome.evicted);
        Ok(())
    }

    /// Builds the payload for a write, compressing when the namespace policy
    /// asks for it. Compression errors never fail the write.
    fn encode_payload(
        &self,
        config: &NamespaceConfig,
        namespace: &str,
        key: &str,
        vector: Vec<f32>,
    ) -> Payload {
        let dimension = vector.len();
        if !config.compression_enabled || dimension <= config.compression_dim_threshold {
            return Payload::Raw(vector);
        }

        // Single-entry compression: scalar quantization is the only codec
        // that pays off on a batch of one (PQ codebooks outweigh one vector).
        let batch = std::slice::from_ref(&vector);
        match self
            .compressor
            .compress(batch, Some(Method::ScalarQuantization), &self.params)
        {
            Ok((encoded, _)) if encoded.bytes.len() < dimension * 4 => Payload::Compressed {
                method: encoded.method,
                dimension,
                bytes: encoded.bytes,
            },
            Ok(_) => {
                self.events.emit(Event::CompressionFallback {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    reason: "no size reduction".to_string(),
                });
                Payload::Raw(vector)
            }
            Err(err) => {
                self.events.emit(Event::CompressionFallback {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    reason: err.to_string(),
                });
                Payload::Raw(vector)
            }
        }
    }

    /// Looks up an entry, recording a hit or miss.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Entry>, CacheError> {
        let ns = self.namespace(namespace)?;
        let (entry, freed) = ns.lock().unwrap().get(key);
        if freed > 0 {
            self.memory.release(freed);
        }

        self.events.emit(match entry {
            Some(_) => Event::CacheHit {
                namespace: namespace.to_string(),
                key: key.to_string(),
            },
            None => Event::CacheMiss {
                namespace: namespace.to_string(),
                key: key.to_string(),
            },
        });
        Ok(entry)
    }

    /// Looks up an entry and returns its vector, decompressing transparently.
    pub fn get_vector(&self, namespace: &str, key: &str) -> Result<Option<Vec<f32>>, CacheError> {
        let entry = match self.get(namespace, key)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        match entry.payload {
            Payload::Raw(vector) => Ok(Some(vector)),
            Payload::Compressed { method, bytes, .. } => {
                let mut vectors = self.compressor.decompress(method, &bytes)?;
                Ok(vectors.pop())
            }
        }
    }

    /// Deletes an entry. Returns whether it existed.
    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        let ns = self.namespace(namespace)?;
        let freed = ns.lock().unwrap().delete(key);
        if let Some(freed) = freed {
            self.memory.release(freed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Clears a namespace and resets its counters.
    pub fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let ns = self.namespace(namespace)?;
        let freed = ns.lock().unwrap().clear();
        self.memory.release(freed);
        Ok(())
    }

    /// Evicts least-recently-used entries until the namespace holds at most
    /// `target_bytes`. Returns the number of entries removed.
    pub fn trim(&self, namespace: &str, target_bytes: usize) -> Result<usize, CacheError> {
        let ns = self.namespace(namespace)?;
        let evicted = ns.lock().unwrap().trim(target_bytes);

        let freed: usize = evicted.iter().map(|(_, bytes)| bytes).sum();
        self.memory.release(freed);
        for (key, freed_bytes) in &evicted {
            self.events.emit(Event::CacheEvict {
                namespace: namespace.to_string(),
                key: key.clone(),
                freed_bytes: *freed_bytes,
            });
        }
        Ok(evicted.len())
    }

    /// Per-namespace counters.
    pub fn stats(&self, namespace: &str) -> Result<CacheStats, CacheError> {
        let ns = self.namespace(namespace)?;
        let stats = ns.lock().unwrap().stats();
        Ok(stats)
    }

    /// Namespace fill level as a percentage of its byte budget.
    pub fn usage_percent(&self, namespace: &str) -> Result<f64, CacheError> {
        let ns = self.namespace(namespace)?;
        let usage = ns.lock().unwrap().usage_percent();
        Ok(usage)
    }

    // =========================================================================
    // Governor surface
    // =========================================================================

    /// Total payload bytes across namespaces.
    pub fn total_bytes(&self) -> usize {
        self.for_each_namespace(|ns| ns.stats().size_bytes)
    }

    /// Total entry count across namespaces.
    pub fn total_entries(&self) -> usize {
        self.for_each_namespace(|ns| ns.len())
    }

    /// Eagerly removes expired entries everywhere.
    ///
    /// Returns `(entries_removed, bytes_freed)`.
    pub fn sweep_expired_all(&self) -> (usize, usize) {
        let handles = self.all_handles();
        let mut entries = 0;
        let mut bytes = 0;
        for (name, handle) in handles {
            let removed = handle.lock().unwrap().sweep_expired();
            for (key, freed) in &removed {
                bytes += freed;
                self.events.emit(Event::CacheEvict {
                    namespace: name.clone(),
                    key: key.clone(),
                    freed_bytes: *freed,
                });
            }
            entries += removed.len();
        }
        self.memory.release(bytes);
        (entries, bytes)
    }

    /// Trims every namespace to `target_bytes`.
    ///
    /// Returns `(total_bytes_after, entries_removed)`.
    pub fn trim_all(&self, target_bytes: usize) -> (usize, usize) {
        let mut removed = 0;
        for name in self.namespace_names() {
            if let Ok(count) = self.trim(&name, target_bytes) {
                removed += count;
            }
        }
        (self.total_bytes(), removed)
    }

    /// Compresses raw entries that exceed their namespace's dimension
    /// threshold (entries whose compression was skipped or fell back at
    /// write time). Returns the number of entries compressed.
    pub fn compress_oversize(&self) -> usize {
        let mut compressed = 0;
        for (_, handle) in self.all_handles() {
            let keys = {
                let ns = handle.lock().unwrap();
                ns.oversize_raw_keys()
            };
            for key in keys {
                let vector = {
                    let ns = handle.lock().unwrap();
                    match ns.peek_payload(&key) {
                        Some(Payload::Raw(vector)) => vector,
                        _ => continue,
                    }
                };
                let dimension = vector.len();
                let batch = std::slice::from_ref(&vector);
                let encoded = match self.compressor.compress(
                    batch,
                    Some(Method::ScalarQuantization),
                    &self.params,
                ) {
                    Ok((encoded, _)) if encoded.bytes.len() < dimension * 4 => encoded,
                    _ => continue,
                };

                let mut ns = handle.lock().unwrap();
                if let Some(delta) = ns.replace_payload(
                    &key,
                    Payload::Compressed {
                        method: encoded.method,
                        dimension,
                        bytes: encoded.bytes,
                    },
                ) {
                    if delta < 0 {
                        self.memory.release((-delta) as usize);
                    } else {
                        self.memory.record(delta as usize);
                    }
                    compressed += 1;
                }
            }
        }
        compressed
    }

    fn all_handles(&self) -> Vec<(String, Arc<Mutex<Namespace>>)> {
        self.namespaces
            .read()
            .unwrap()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    fn for_each_namespace<T: std::iter::Sum>(&self, f: impl Fn(&Namespace) -> T) -> T {
        self.all_handles()
            .into_iter()
            .map(|(_, handle)| {
                let ns = handle.lock().unwrap();
                f(&ns)
            })
            .sum()
    }

    fn settle(&self, namespace: &str, bytes_delta: i64, evicted: &[(String, usize)]) {
        if bytes_delta >= 0 {
            self.memory.record(bytes_delta as usize);
        } else {
            self.memory.release((-bytes_delta) as usize);
        }
        for (key, freed_bytes) in evicted {
            self.events.emit(Event::CacheEvict {
                namespace: namespace.to_string(),
                key: key.clone(),
                freed_bytes: *freed_bytes,
            });
        }
    }
}

impl std::fmt::Debug for VectorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorCache")
            .field("namespaces", &self.namespace_names())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    fn cache() -> (VectorCache, Arc<MemorySink>) {
        let sink = MemorySink::shared();
        let cache = VectorCache::new(
            Arc::new(Compressor::new(0.9, sink.clone())),
            Arc::new(MemoryTracker::unbounded()),
            sink.clone(),
        );
        (cache, sink)
    }

    #[test]
    fn test_unknown_namespace_errors() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.get("nope", "k"),
            Err(CacheError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            cache.set("nope", "k", vec![1.0], BTreeMap::new()),
            Err(CacheError::NamespaceNotFound(_))
        ));
    }

    #[test]
    fn test_create_namespace_idempotent() {
        let (cache, _) = cache();
        let config = NamespaceConfig::default();
        cache.create_namespace("anchors", config.clone()).unwrap();
        cache.create_namespace("anchors", config).unwrap();

        let conflicting = NamespaceConfig {
            max_entries: 1,
            ..Default::default()
        };
        assert!(matches!(
            cache.create_namespace("anchors", conflicting),
            Err(CacheError::ConfigConflict(_))
        ));
    }

    #[test]
    fn test_set_get_roundtrip_uncompressed() {
        let (cache, sink) = cache();
        cache
            .create_namespace("anchors", NamespaceConfig::default())
            .unwrap();

        let v = vec![0.1, 0.2, 0.3];
        cache.set("anchors", "a", v.clone(), BTreeMap::new()).unwrap();
        assert_eq!(cache.get_vector("anchors", "a").unwrap(), Some(v));
        assert_eq!(sink.count("cache_hit"), 1);

        assert_eq!(cache.get_vector("anchors", "absent").unwrap(), None);
        assert_eq!(sink.count("cache_miss"), 1);
    }

    #[test]
    fn test_large_vector_compressed_transparently() {
        let (cache, _) = cache();
        cache
            .create_namespace(
                "anchors",
                NamespaceConfig {
                    compression_enabled: true,
                    compression_dim_threshold: 64,
                    ..Default::default()
                },
            )
            .unwrap();

        let v: Vec<f32> = (0..512).map(|i| (i % 97) as f32 / 97.0 - 0.5).collect();
        cache.set("anchors", "big", v.clone(), BTreeMap::new()).unwrap();

        // Stored compressed...
        let entry = cache.get("anchors", "big").unwrap().unwrap();
        assert!(entry.payload.is_compressed());
        assert_eq!(entry.payload.dimension(), 512);

        // ...but reconstructed transparently, within the accuracy bound.
        let restored = cache.get_vector("anchors", "big").unwrap().unwrap();
        assert_eq!(restored.len(), 512);
        let sim = crate::compress::cosine_similarity(&v, &restored);
        assert!(sim >= 0.9, "cosine similarity {sim} below bound");
    }

    #[test]
    fn test_small_vector_not_compressed() {
        let (cache, _) = cache();
        cache
            .create_namespace(
                "anchors",
                NamespaceConfig {
                    compression_enabled: true,
                    compression_dim_threshold: 64,
                    ..Default::default()
                },
            )
            .unwrap();

        cache
            .set("anchors", "small", vec![1.0; 16], BTreeMap::new())
            .unwrap();
        let entry = cache.get("anchors", "small").unwrap().unwrap();
        assert!(!entry.payload.is_compressed());
    }

    #[test]
    fn test_capacity_two_evicts_first_inserted() {
        let (cache, sink) = cache();
        cache
            .create_namespace(
                "anchors",
                NamespaceConfig {
                    max_entries: 2,
                    max_bytes: 0,
                    ..Default::default()
                },
            )
            .unwrap();

        for key in ["a", "b", "c"] {
            cache
                .set("anchors", key, vec![1.0, 2.0], BTreeMap::new())
                .unwrap();
        }

        assert_eq!(cache.get_vector("anchors", "a").unwrap(), None);
        assert!(cache.get_vector("anchors", "b").unwrap().is_some());
        assert!(cache.get_vector("anchors", "c").unwrap().is_some());
        assert_eq!(sink.count("cache_evict"), 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let (cache, _) = cache();
        cache
            .create_namespace("anchors", NamespaceConfig::default())
            .unwrap();
        cache.set("anchors", "a", vec![1.0], BTreeMap::new()).unwrap();

        assert!(cache.delete("anchors", "a").unwrap());
        assert!(!cache.delete("anchors", "a").unwrap());

        cache.set("anchors", "b", vec![1.0], BTreeMap::new()).unwrap();
        cache.clear("anchors").unwrap();
        assert_eq!(cache.stats("anchors").unwrap().entry_count, 0);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_memory_tracker_follows_cache() {
        let sink = MemorySink::shared();
        let memory = Arc::new(MemoryTracker::unbounded());
        let cache = VectorCache::new(
            Arc::new(Compressor::new(0.9, sink.clone())),
            memory.clone(),
            sink,
        );
        cache
            .create_namespace("anchors", NamespaceConfig::default())
            .unwrap();

        cache
            .set("anchors", "a", vec![0.0; 100], BTreeMap::new())
            .unwrap();
        assert_eq!(memory.used_bytes(), cache.total_bytes());

        cache.delete("anchors", "a").unwrap();
        assert_eq!(memory.used_bytes(), 0);
    }

    #[test]
    fn test_trim_emits_cache_evict() {
        let (cache, sink) = cache();
        cache
            .create_namespace("anchors", NamespaceConfig::default())
            .unwrap();
        for i in 0..8 {
            cache
                .set("anchors", &format!("k{i}"), vec![0.0; 64], BTreeMap::new())
                .unwrap();
        }

        let removed = cache.trim("anchors", 0).unwrap();
        assert_eq!(removed, 8);
        assert_eq!(sink.count("cache_evict"), 8);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_compress_oversize_backfills() {
        let (cache, _) = cache();
        cache
            .create_namespace(
                "anchors",
                NamespaceConfig {
                    compression_enabled: true,
                    compression_dim_threshold: 64,
                    ..Default::default()
                },
            )
            .unwrap();

        // Stage a raw oversize entry directly, as if write-time compression
        // had fallen back.
        let v: Vec<f32> = (0..512).map(|i| (i % 89) as f32 / 89.0).collect();
        {
            let handle = cache.namespace("anchors").unwrap();
            handle.lock().unwrap().insert(
                "stale".into(),
                Payload::Raw(v.clone()),
                BTreeMap::new(),
                None,
            );
        }
        let before = cache.total_bytes();

        assert_eq!(cache.compress_oversize(), 1);
        assert!(cache.total_bytes() < before);

        let entry = cache.get("anchors", "stale").unwrap().unwrap();
        assert!(entry.payload.is_compressed());
        let restored = cache.get_vector("anchors", "stale").unwrap().unwrap();
        assert!(crate::compress::cosine_similarity(&v, &restored) >= 0.9);

        // Nothing left to do on a second pass.
        assert_eq!(cache.compress_oversize(), 0);
    }

    #[test]
    fn test_compression_disabled_namespace_not_backfilled() {
        let (cache, _) = cache();
        cache
            .create_namespace(
                "plain",
                NamespaceConfig {
                    compression_enabled: false,
                    ..Default::default()
                },
            )
            .unwrap();
        cache
            .set("plain", "big", vec![0.5; 512], BTreeMap::new())
            .unwrap();

        assert_eq!(cache.compress_oversize(), 0);
    }

    #[test]
    fn test_stats_hit_rate() {
        let (cache, _) = cache();
        cache
            .create_namespace("anchors", NamespaceConfig::default())
            .unwrap();
        cache.set("anchors", "a", vec![1.0], BTreeMap::new()).unwrap();

        cache.get("anchors", "a").unwrap();
        cache.get("anchors", "missing").unwrap();

        let stats = cache.stats("anchors").unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 50.0).abs() < 1e-9);
    }
}
