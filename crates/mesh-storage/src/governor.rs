//! Timer-driven resource governor.
//!
//! The governor is the subsystem's backpressure loop. Every tick it
//! snapshots memory and cache state, then:
//!
//! 1. reclaims expired entries and compresses oversize vectors when heap
//!    pressure crosses the configured threshold (and, under pressure, asks
//!    the router for rebalance work),
//! 2. trims every namespace when the aggregate cache footprint exceeds its
//!    budget,
//! 3. unconditionally backfills compression for vectors that slipped
//!    through at write time,
//! 4. emits a `resource_status` event whether or not it acted.
//!
//! Steps are independent: a failing step is reported through an `error`
//! event and the tick continues. Per-step in-flight flags stop overlapping
//! ticks from doubling work. There is no reliance on any runtime garbage
//! collector - eviction and compression are the only reclamation paths.

use crate::cache::VectorCache;
use crate::compress::Compressor;
use crate::events::{Event, EventSink};
use crate::memory::MemoryTracker;
use crate::sharding::{MigrationCoordinator, ShardRouter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Governor tuning.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,
    /// Heap budget used when the memory tracker itself is unbounded.
    pub heap_limit_bytes: usize,
    /// Fraction of the heap budget that triggers a reclamation pass.
    pub gc_threshold: f64,
    /// Aggregate cache budget across namespaces.
    pub max_cache_bytes: usize,
    /// Trim target as a fraction of `max_cache_bytes`.
    pub trim_target: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            heap_limit_bytes: 1024 * 1024 * 1024,
            gc_threshold: 0.75,
            max_cache_bytes: 512 * 1024 * 1024,
            trim_target: 0.8,
        }
    }
}

/// Point-in-time view assembled at the start of every tick. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub heap_used: usize,
    pub heap_limit: usize,
    pub cache_bytes: usize,
    pub vector_count: usize,
    pub avg_compression_ratio: f32,
    pub last_gc: Option<DateTime<Utc>>,
    pub gc_cycles: u64,
    pub taken_at: DateTime<Utc>,
}

/// The backpressure loop.
pub struct ResourceGovernor {
    config: GovernorConfig,
    cache: Arc<VectorCache>,
    compressor: Arc<Compressor>,
    memory: Arc<MemoryTracker>,
    events: Arc<dyn EventSink>,
    /// Present when the governor also drives rebalancing.
    router: Option<Arc<ShardRouter>>,
    coordinator: Option<Arc<MigrationCoordinator>>,
    gc_cycles: AtomicU64,
    last_gc: RwLock<Option<DateTime<Utc>>>,
    gc_in_flight: AtomicBool,
    trim_in_flight: AtomicBool,
    compress_in_flight: AtomicBool,
    running: AtomicBool,
}

impl ResourceGovernor {
    /// Creates a governor over the cache, compressor and memory tracker.
    pub fn new(
        config: GovernorConfig,
        cache: Arc<VectorCache>,
        compressor: Arc<Compressor>,
        memory: Arc<MemoryTracker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            cache,
            compressor,
            memory,
            events,
            router: None,
            coordinator: None,
            gc_cycles: AtomicU64::new(0),
            last_gc: RwLock::new(None),
            gc_in_flight: AtomicBool::new(false),
            trim_in_flight: AtomicBool::new(false),
            compress_in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Wires in the sharding layer so memory pressure can request rebalances.
    pub fn with_sharding(
        mut self,
        router: Arc<ShardRouter>,
        coordinator: Arc<MigrationCoordinator>,
    ) -> Self {
        self.router = Some(router);
        self.coordinator = Some(coordinator);
        self
    }

    /// Takes a point-in-time resource snapshot.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let heap_limit = if self.memory.limit_bytes() > 0 {
            self.memory.limit_bytes()
        } else {
            self.config.heap_limit_bytes
        };
        ResourceSnapshot {
            heap_used: self.memory.used_bytes(),
            heap_limit,
            cache_bytes: self.cache.total_bytes(),
            vector_count: self.cache.total_entries(),
            avg_compression_ratio: self.compressor.average_ratio(),
            last_gc: *self.last_gc.read().unwrap(),
            gc_cycles: self.gc_cycles.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }

    /// Runs one full tick synchronously.
    ///
    /// Callable directly (tests, operator tooling) or from the background
    /// loop started by [`ResourceGovernor::start`].
    pub fn tick(&self) {
        let snapshot = self.snapshot();

        // Step 2: heap pressure -> reclaim and, if wired, rebalance.
        if snapshot.heap_used as f64 > self.config.gc_threshold * snapshot.heap_limit as f64 {
            self.run_guarded("gc", &self.gc_in_flight, || self.reclaim(snapshot.heap_used));
        }

        // Step 3: aggregate cache budget -> trim every namespace.
        if snapshot.cache_bytes > self.config.max_cache_bytes {
            self.run_guarded("cache_trim", &self.trim_in_flight, || {
                let target =
                    (self.config.max_cache_bytes as f64 * self.config.trim_target) as usize;
                let (total_bytes, entries_removed) = self.cache.trim_all(target);
                self.events.emit(Event::CacheOptimized {
                    total_bytes,
                    entries_removed,
                });
                Ok(())
            });
        }

        // Step 4: always backfill compression for oversize raw vectors.
        self.run_guarded("compress_backfill", &self.compress_in_flight, || {
            let compressed = self.cache.compress_oversize();
            if compressed > 0 {
                tracing::debug!(compressed, "compression backfill pass");
            }
            Ok(())
        });

        // Step 5: observability heartbeat, emitted regardless of actions.
        let current = self.snapshot();
        self.events.emit(Event::ResourceStatus {
            heap_used: current.heap_used,
            heap_limit: current.heap_limit,
            cache_bytes: current.cache_bytes,
            vector_count: current.vector_count,
            avg_compression_ratio: current.avg_compression_ratio,
            gc_cycles: current.gc_cycles,
        });
    }

    /// The reclamation pass behind the gc threshold.
    fn reclaim(&self, heap_before: usize) -> Result<(), String> {
        let (expired_entries, _) = self.cache.sweep_expired_all();
        self.cache.compress_oversize();

        let cycle = self.gc_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_gc.write().unwrap() = Some(Utc::now());

        let reclaimed = heap_before.saturating_sub(self.memory.used_bytes());
        self.events.emit(Event::GcComplete {
            reclaimed_bytes: reclaimed,
            expired_entries,
            cycle,
        });

        // Sustained pressure is also the signal to shed load between shards.
        if let (Some(router), Some(coordinator)) = (&self.router, &self.coordinator) {
            let kinds = router.manager().read().unwrap().kinds();
            for kind in kinds {
                let tasks = router
                    .trigger_rebalance(&kind, coordinator)
                    .map_err(|e| format!("rebalance planning for {kind}: {e}"))?;
                for task in tasks {
                    if let Err(err) = coordinator.run(task) {
                        // A failed migration is an operational alert, not a
                        // governor failure; report it and keep going.
                        self.events.emit(Event::Error {
                            context: format!("migration {task}"),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs one step under its overlap guard, reporting failures as events.
    fn run_guarded(
        &self,
        context: &str,
        flag: &AtomicBool,
        step: impl FnOnce() -> Result<(), String>,
    ) {
        if flag.swap(true, Ordering::Acquire) {
            tracing::debug!(context, "previous pass still running, skipping");
            return;
        }
        if let Err(reason) = step() {
            self.events.emit(Event::Error {
                context: context.to_string(),
                reason,
            });
        }
        flag.store(false, Ordering::Release);
    }

    /// Starts the background tick loop.
    ///
    /// The tick body runs on the blocking pool so codec work never stalls
    /// the timer. Returns the task handle; call
    /// [`ResourceGovernor::stop`] to end the loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let governor = self.clone();
        tokio::spawn(async move {
            while governor.running.load(Ordering::SeqCst) {
                let worker = governor.clone();
                let _ = tokio::task::spawn_blocking(move || worker.tick()).await;
                tokio::time::sleep(governor.config.tick_interval).await;
            }
        })
    }

    /// Signals the background loop to exit after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Total completed reclamation passes.
    pub fn gc_cycles(&self) -> u64 {
        self.gc_cycles.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("config", &self.config)
            .field("gc_cycles", &self.gc_cycles())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
