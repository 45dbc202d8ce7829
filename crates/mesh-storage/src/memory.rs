//! Process-level byte accounting for the storage subsystem.
//!
//! The governor does not rely on a managed runtime's garbage collector;
//! eviction and compression driven by this tracker are the only reclamation
//! mechanisms. Every component that holds vector payloads reports its
//! allocations here so the governor sees one consistent heap view.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// Byte accounting errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory budget exceeded: requested {requested} bytes, {available} available of {limit}")]
    BudgetExceeded {
        requested: usize,
        available: usize,
        limit: usize,
    },
}

/// Tracks subsystem memory usage against a configurable budget.
///
/// Thread-safe via atomics; cheap enough to call on every cache write.
#[derive(Debug)]
pub struct MemoryTracker {
    /// Bytes currently attributed to the subsystem.
    used: AtomicUsize,
    /// Budget in bytes (0 = unbounded).
    limit: usize,
    /// Warning threshold as a fraction of the budget (0.0 - 1.0).
    warn_fraction: f64,
    /// Set once the warning fired, cleared when usage drops back under.
    warned: AtomicBool,
}

impl MemoryTracker {
    /// Creates a tracker with a budget in megabytes and a warning fraction.
    pub fn new(limit_mb: usize, warn_fraction: f64) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit: limit_mb * 1024 * 1024,
            warn_fraction: warn_fraction.clamp(0.0, 1.0),
            warned: AtomicBool::new(false),
        }
    }

    /// Creates a tracker that only accounts, never limits.
    pub fn unbounded() -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit: 0,
            warn_fraction: 1.0,
            warned: AtomicBool::new(false),
        }
    }

    /// Records an allocation unconditionally.
    ///
    /// The cache uses this path: capacity pressure is resolved by eviction,
    /// not by failing the write.
    pub fn record(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
        self.check_warning();
    }

    /// Records an allocation, failing if it would exceed the budget.
    ///
    /// Used by callers that can reject work outright (e.g. bulk imports).
    pub fn try_record(&self, bytes: usize) -> Result<(), MemoryError> {
        if self.limit == 0 {
            self.used.fetch_add(bytes, Ordering::Relaxed);
            return Ok(());
        }

        let current = self.used.load(Ordering::Relaxed);
        let requested_total = current.saturating_add(bytes);
        if requested_total > self.limit {
            return Err(MemoryError::BudgetExceeded {
                requested: bytes,
                available: self.limit.saturating_sub(current),
                limit: self.limit,
            });
        }

        self.used.fetch_add(bytes, Ordering::Relaxed);
        self.check_warning();
        Ok(())
    }

    /// Records a release, reducing tracked usage.
    pub fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);

        if self.limit > 0 {
            let now = prev.saturating_sub(bytes) as f64 / self.limit as f64;
            if now < self.warn_fraction {
                self.warned.store(false, Ordering::Relaxed);
            }
        }
    }

    fn check_warning(&self) {
        if self.limit == 0 {
            return;
        }
        let fraction = self.used.load(Ordering::Relaxed) as f64 / self.limit as f64;
        if fraction > self.warn_fraction && !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                used_mb = self.used.load(Ordering::Relaxed) / (1024 * 1024),
                limit_mb = self.limit / (1024 * 1024),
                "memory usage crossed warning threshold"
            );
        }
    }

    /// Returns bytes currently in use.
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Returns the budget in bytes (0 = unbounded).
    pub fn limit_bytes(&self) -> usize {
        self.limit
    }

    /// Returns usage as a fraction of the budget (0.0 when unbounded).
    pub fn usage_fraction(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used.load(Ordering::Relaxed) as f64 / self.limit as f64
    }

    /// Returns bytes remaining before the budget (usize::MAX when unbounded).
    pub fn available_bytes(&self) -> usize {
        if self.limit == 0 {
            return usize::MAX;
        }
        self.limit.saturating_sub(self.used.load(Ordering::Relaxed))
    }

    /// Resets accounting to zero.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.warned.store(false, Ordering::Relaxed);
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::unbounded()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_tracker() {
        let tracker = MemoryTracker::unbounded();
        assert_eq!(tracker.limit_bytes(), 0);
        assert_eq!(tracker.usage_fraction(), 0.0);

        tracker.record(1_000_000_000);
        assert_eq!(tracker.used_bytes(), 1_000_000_000);
        tracker.try_record(1).unwrap();

        tracker.release(1_000_000_001);
        assert_eq!(tracker.used_bytes(), 0);
    }

    #[test]
    fn test_bounded_try_record() {
        let tracker = MemoryTracker::new(1, 0.5); // 1 MB
        tracker.try_record(512 * 1024).unwrap();

        let result = tracker.try_record(1024 * 1024);
        match result {
            Err(MemoryError::BudgetExceeded {
                requested,
                available,
                limit,
            }) => {
                assert_eq!(requested, 1024 * 1024);
                assert_eq!(available, 512 * 1024);
                assert_eq!(limit, 1024 * 1024);
            }
            other => panic!("expected BudgetExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_record_never_fails() {
        let tracker = MemoryTracker::new(1, 0.8); // 1 MB
        tracker.record(10 * 1024 * 1024); // way over budget, still tracked
        assert_eq!(tracker.used_bytes(), 10 * 1024 * 1024);
        assert!(tracker.usage_fraction() > 1.0);
    }

    #[test]
    fn test_available_bytes() {
        let tracker = MemoryTracker::new(1, 0.8);
        assert_eq!(tracker.available_bytes(), 1024 * 1024);

        tracker.record(256 * 1024);
        assert_eq!(tracker.available_bytes(), 768 * 1024);
    }

    #[test]
    fn test_reset() {
        let tracker = MemoryTracker::new(1, 0.8);
        tracker.record(512 * 1024);
        tracker.reset();
        assert_eq!(tracker.used_bytes(), 0);
    }
}
