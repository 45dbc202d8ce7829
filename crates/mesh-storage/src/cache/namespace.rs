//! A single cache namespace: entries, LRU ordering, TTL bookkeeping.
//!
//! Namespaces are independent; the facade in `cache::mod` wraps each one in
//! its own lock. All byte accounting is incremental so `stats()` is O(1).

use crate::compress::Method;
use lru::LruCache;
use mesh_core::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Fixed per-entry overhead charged on top of payload and metadata costs.
const ENTRY_OVERHEAD: usize = 64;

/// Configuration for one namespace.
///
/// Equality is used for idempotent `create_namespace` calls: re-creating with
/// an identical config is a no-op, anything else is a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Maximum number of entries (0 = unbounded).
    pub max_entries: usize,
    /// Maximum payload bytes (0 = unbounded).
    pub max_bytes: usize,
    /// Default time-to-live for entries, if any.
    pub default_ttl: Option<Duration>,
    /// Whether a `get` refreshes the entry's TTL.
    pub update_age_on_get: bool,
    /// Whether large vectors are handed to the compressor on write.
    pub compression_enabled: bool,
    /// Vectors longer than this are compression candidates.
    pub compression_dim_threshold: usize,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl: None,
            update_age_on_get: false,
            compression_enabled: false,
            compression_dim_threshold: 512,
        }
    }
}

/// Entry payload: a raw vector or a compressed encoding, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Uncompressed f32 vector.
    Raw(Vec<f32>),
    /// Compressed payload with the codec that produced it.
    Compressed {
        method: Method,
        dimension: usize,
        bytes: Vec<u8>,
    },
}

impl Payload {
    /// The logical vector dimension regardless of representation.
    pub fn dimension(&self) -> usize {
        match self {
            Payload::Raw(v) => v.len(),
            Payload::Compressed { dimension, .. } => *dimension,
        }
    }

    /// Whether the payload is stored compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Payload::Compressed { .. })
    }

    /// Bytes attributed to this payload in cache accounting.
    pub fn cost_bytes(&self) -> usize {
        match self {
            Payload::Raw(v) => 24 + v.len() * 4,
            Payload::Compressed { bytes, .. } => 24 + bytes.len(),
        }
    }
}

/// A cached entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Entry key within its namespace.
    pub key: String,
    /// Vector payload.
    pub payload: Payload,
    /// Structured metadata attached at insert time.
    pub metadata: BTreeMap<String, FieldValue>,
    /// Insertion time.
    pub inserted_at: Instant,
    /// Last read time; drives LRU ordering.
    pub last_accessed: Instant,
    /// Absolute expiry deadline, if the entry has a TTL.
    pub expires_at: Option<Instant>,
    /// Monotonic insertion counter; breaks LRU ties (oldest first).
    pub sequence: u64,
}

impl Entry {
    fn cost_bytes(&self) -> usize {
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| 24 + k.len() + v.cost_bytes())
            .sum();
        ENTRY_OVERHEAD + self.key.len() + self.payload.cost_bytes() + metadata
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Per-namespace counters. Reset only by `clear`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing, or only an expired entry.
    pub misses: u64,
    /// Entries removed by capacity pressure or trim.
    pub evictions: u64,
    /// Entries removed by TTL expiry.
    pub expirations: u64,
    /// Current payload bytes.
    pub size_bytes: usize,
    /// Current entry count.
    pub entry_count: usize,
}

impl CacheStats {
    /// Hit rate as a percentage of all lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Outcome of an insert: what was displaced and how the footprint moved.
#[derive(Debug, Default)]
pub(crate) struct InsertOutcome {
    /// Evicted (key, freed_bytes) pairs, LRU-first.
    pub evicted: Vec<(String, usize)>,
    /// Net change in namespace bytes, including the new entry.
    pub bytes_delta: i64,
}

/// One cache namespace.
///
/// Eviction is driven manually rather than by the LRU map's own capacity so
/// that entry-count and byte budgets can be enforced together; the map is
/// used unbounded and only for its recency ordering.
pub(crate) struct Namespace {
    name: String,
    config: NamespaceConfig,
    entries: LruCache<String, Entry>,
    stats: CacheStats,
    next_sequence: u64,
}

impl Namespace {
    pub fn new(name: impl Into<String>, config: NamespaceConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: LruCache::unbounded(),
            stats: CacheStats::default(),
            next_sequence: 0,
        }
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    /// Usage as a percentage of the byte budget (0.0 when unbounded).
    pub fn usage_percent(&self) -> f64 {
        if self.config.max_bytes == 0 {
            return 0.0;
        }
        (self.stats.size_bytes as f64 / self.config.max_bytes as f64) * 100.0
    }

    /// Inserts an entry, evicting LRU entries first if at capacity.
    ///
    /// `ttl` overrides the namespace default when given.
    pub fn insert(
        &mut self,
        key: String,
        payload: Payload,
        metadata: BTreeMap<String, FieldValue>,
        ttl: Option<Duration>,
    ) -> InsertOutcome {
        let now = Instant::now();
        let mut outcome = InsertOutcome::default();

        // Replacing a key frees its previous cost first.
        if let Some(previous) = self.entries.pop(&key) {
            let freed = previous.cost_bytes();
            self.stats.size_bytes -= freed;
            outcome.bytes_delta -= freed as i64;
        }

        let effective_ttl = ttl.or(self.config.default_ttl);
        let entry = Entry {
            key: key.clone(),
            payload,
            metadata,
            inserted_at: now,
            last_accessed: now,
            expires_at: effective_ttl.map(|ttl| now + ttl),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        let cost = entry.cost_bytes();

        // Make room before inserting: entry budget, then byte budget.
        while self.config.max_entries > 0 && self.entries.len() >= self.config.max_entries {
            if !self.evict_one(&mut outcome) {
                break;
            }
        }
        while self.config.max_bytes > 0
            && self.stats.size_bytes + cost > self.config.max_bytes
            && !self.entries.is_empty()
        {
            if !self.evict_one(&mut outcome) {
                break;
            }
        }

        self.stats.size_bytes += cost;
        outcome.bytes_delta += cost as i64;
        self.entries.put(key, entry);
        self.stats.entry_count = self.entries.len();
        outcome
    }

    fn evict_one(&mut self, outcome: &mut InsertOutcome) -> bool {
        match self.entries.pop_lru() {
            Some((key, entry)) => {
                let freed = entry.cost_bytes();
                self.stats.size_bytes -= freed;
                self.stats.evictions += 1;
                outcome.bytes_delta -= freed as i64;
                outcome.evicted.push((key, freed));
                true
            }
            None => false,
        }
    }

    /// Looks up an entry, updating recency, TTL and hit/miss counters.
    ///
    /// An expired entry is removed and counted as a miss. Returns the freed
    /// bytes alongside so the caller can settle global accounting.
    pub fn get(&mut self, key: &str) -> (Option<Entry>, usize) {
        let now = Instant::now();

        let expired = match self.entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.stats.misses += 1;
                return (None, 0);
            }
        };

        if expired {
            let freed = self
                .entries
                .pop(key)
                .map(|entry| entry.cost_bytes())
                .unwrap_or(0);
            self.stats.size_bytes -= freed;
            self.stats.expirations += 1;
            self.stats.misses += 1;
            self.stats.entry_count = self.entries.len();
            return (None, freed);
        }

        // Promotes the entry to most-recently-used.
        let update_age = self.config.update_age_on_get;
        let default_ttl = self.config.default_ttl;
        let entry = self.entries.get_mut(key).expect("peeked entry present");
        entry.last_accessed = now;
        if update_age {
            if let Some(ttl) = default_ttl {
                entry.expires_at = Some(now + ttl);
            }
        }
        self.stats.hits += 1;
        (Some(entry.clone()), 0)
    }

    /// Removes an entry. Returns freed bytes if it existed.
    pub fn delete(&mut self, key: &str) -> Option<usize> {
        let entry = self.entries.pop(key)?;
        let freed = entry.cost_bytes();
        self.stats.size_bytes -= freed;
        self.stats.entry_count = self.entries.len();
        Some(freed)
    }

    /// Removes everything and resets counters. Returns freed bytes.
    pub fn clear(&mut self) -> usize {
        let freed = self.stats.size_bytes;
        self.entries.clear();
        self.stats = CacheStats::default();
        self.next_sequence = 0;
        freed
    }

    /// Evicts least-recently-used entries until the namespace holds at most
    /// `target_bytes`. Returns the evicted (key, freed_bytes) pairs.
    pub fn trim(&mut self, target_bytes: usize) -> Vec<(String, usize)> {
        let mut outcome = InsertOutcome::default();
        while self.stats.size_bytes > target_bytes {
            if !self.evict_one(&mut outcome) {
                break;
            }
        }
        self.stats.entry_count = self.entries.len();
        outcome.evicted
    }

    /// Eagerly removes expired entries. Returns the removed pairs.
    pub fn sweep_expired(&mut self) -> Vec<(String, usize)> {
        let now = Instant::now();
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(entry) = self.entries.pop(&key) {
                let freed = entry.cost_bytes();
                self.stats.size_bytes -= freed;
                self.stats.expirations += 1;
                removed.push((key, freed));
            }
        }
        self.stats.entry_count = self.entries.len();
        removed
    }

    /// Keys of raw entries above the compression threshold, LRU order.
    ///
    /// Does not touch recency; used by the governor to find entries whose
    /// compression was skipped or failed at write time.
    pub fn oversize_raw_keys(&self) -> Vec<String> {
        if !self.config.compression_enabled {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|(_, entry)| {
                !entry.payload.is_compressed()
                    && entry.payload.dimension() > self.config.compression_dim_threshold
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Reads a payload without promoting the entry.
    pub fn peek_payload(&self, key: &str) -> Option<Payload> {
        self.entries.peek(key).map(|entry| entry.payload.clone())
    }

    /// Swaps an entry's payload in place without touching recency or TTL.
    ///
    /// Returns the byte delta (new cost minus old cost).
    pub fn replace_payload(&mut self, key: &str, payload: Payload) -> Option<i64> {
        let entry = self.entries.peek_mut(key)?;
        let before = entry.cost_bytes() as i64;
        entry.payload = payload;
        let after = entry.cost_bytes() as i64;
        let delta = after - before;
        self.stats.size_bytes = (self.stats.size_bytes as i64 + delta) as usize;
        Some(delta)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .field("size_bytes", &self.stats.size_bytes)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
