//! Observability events emitted by the storage subsystem.
//!
//! Events are the only externally visible surface besides the component
//! method contracts. Every component takes an [`EventSink`] at construction;
//! there is no global event bus.
//!
//! # Example
//!
//! ```ignore
//! use mesh_storage::events::{EventSink, TracingSink};
//! use std::sync::Arc;
//!
//! let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;

/// A named, structured event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A cache lookup found a live entry.
    CacheHit { namespace: String, key: String },
    /// A cache lookup missed (absent or expired).
    CacheMiss { namespace: String, key: String },
    /// An entry was evicted to make room or by an explicit trim.
    CacheEvict {
        namespace: String,
        key: String,
        freed_bytes: usize,
    },
    /// A trim pass shrank the aggregate cache footprint.
    CacheOptimized {
        total_bytes: usize,
        entries_removed: usize,
    },
    /// Compression succeeded but reconstruction accuracy fell below the
    /// configured minimum. Soft condition; the payload is still stored.
    CompressionDegraded {
        method: String,
        accuracy: f32,
        min_accuracy: f32,
    },
    /// Compression failed during a cache write; the entry was stored raw.
    CompressionFallback {
        namespace: String,
        key: String,
        reason: String,
    },
    /// The governor completed a reclamation pass.
    GcComplete {
        reclaimed_bytes: usize,
        expired_entries: usize,
        cycle: u64,
    },
    /// Periodic snapshot of resource usage, emitted every governor tick.
    ResourceStatus {
        heap_used: usize,
        heap_limit: usize,
        cache_bytes: usize,
        vector_count: usize,
        avg_compression_ratio: f32,
        gc_cycles: u64,
    },
    /// A migration task entered `InProgress`.
    MigrationStarted {
        task: u64,
        source: u32,
        target: u32,
    },
    /// A migration task completed and shard ownership flipped.
    MigrationCompleted {
        task: u64,
        source: u32,
        target: u32,
        records_moved: u64,
    },
    /// A migration task failed; shards were reverted and the backup retained.
    MigrationFailed {
        task: u64,
        source: u32,
        target: u32,
        reason: String,
    },
    /// An internal step failed but execution continued.
    Error { context: String, reason: String },
}

impl Event {
    /// Returns the event's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::CacheHit { .. } => "cache_hit",
            Event::CacheMiss { .. } => "cache_miss",
            Event::CacheEvict { .. } => "cache_evict",
            Event::CacheOptimized { .. } => "cache_optimized",
            Event::CompressionDegraded { .. } => "compression_degraded",
            Event::CompressionFallback { .. } => "compression_fallback",
            Event::GcComplete { .. } => "gc_complete",
            Event::ResourceStatus { .. } => "resource_status",
            Event::MigrationStarted { .. } => "migration_started",
            Event::MigrationCompleted { .. } => "migration_completed",
            Event::MigrationFailed { .. } => "migration_failed",
            Event::Error { .. } => "error",
        }
    }
}

/// Sink for subsystem events.
///
/// Implementations must be cheap: sinks are invoked on cache hot paths.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Must not panic and must not block for long.
    fn emit(&self, event: Event);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Sink that forwards events to `tracing`.
///
/// Hot-path events (hits/misses) log at `trace`; state changes at `debug`;
/// failures at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            Event::CacheHit { .. } | Event::CacheMiss { .. } => {
                tracing::trace!(target: "vectormesh::events", %payload, "{}", event.name());
            }
            Event::CompressionDegraded { .. }
            | Event::CompressionFallback { .. }
            | Event::MigrationFailed { .. }
            | Event::Error { .. } => {
                tracing::warn!(target: "vectormesh::events", %payload, "{}", event.name());
            }
            _ => {
                tracing::debug!(target: "vectormesh::events", %payload, "{}", event.name());
            }
        }
    }
}

/// Sink that buffers events in memory.
///
/// Intended for tests; `take()` drains the buffer.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    /// Creates an empty sink behind an `Arc` for sharing with components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains and returns all buffered events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    /// Returns the number of buffered events with the given wire name.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// Returns clones of the buffered events with the given wire name.
    pub fn of(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// Tests
// =============================================================================
