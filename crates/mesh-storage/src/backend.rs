//! External collaborator interfaces.
//!
//! The core does not store records or backup artifacts itself; migration
//! consumes these two services from the surrounding system:
//!
//! - [`BackupService`]: point-in-time shard backups, the rollback anchor for
//!   every migration.
//! - [`RecordStore`]: batched reads and writes against a node's storage,
//!   used for the data-copy and validation steps.
//!
//! In-memory implementations live here as well; they back the test suites
//! and double as reference semantics for real adapters.

use crate::sharding::{Shard, ShardId, ShardRange};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mesh_core::{EntityKind, NodeHandle, Record};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Backup collaborator failure.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup failed: {0}")]
    Failed(String),

    #[error("unknown backup handle: {0}")]
    UnknownHandle(String),
}

/// Persistence collaborator failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Opaque receipt for a completed shard backup.
///
/// A failed migration retains its handle for manual recovery; the core never
/// replays a backup on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupHandle {
    /// Collaborator-assigned identifier.
    pub id: String,
    /// Shard the backup covers.
    pub shard: ShardId,
    /// When the backup was acknowledged.
    pub created_at: DateTime<Utc>,
}

/// Point-in-time backup/restore of a shard's data.
pub trait BackupService: Send + Sync {
    /// Requests a backup of `shard`'s data for `kind`. Migration must not
    /// proceed without the returned acknowledgment.
    fn backup_shard(&self, kind: &EntityKind, shard: &Shard) -> Result<BackupHandle, BackupError>;

    /// Restores a previously acknowledged backup.
    fn restore_shard(&self, handle: &BackupHandle) -> Result<(), BackupError>;
}

/// Batched record access against a specific node's storage.
pub trait RecordStore: Send + Sync {
    /// Reads up to `limit` records of `kind` on `node` whose keys fall in
    /// `range`, in stable key order, starting at `offset`.
    fn find_range(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        range: &ShardRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;

    /// Writes a batch of records of `kind` to `node`, overwriting by key.
    /// Returns the number of records accepted.
    fn create_many(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        records: &[Record],
    ) -> Result<usize, StoreError>;

    /// Counts records of `kind` on `node` whose keys fall in `range`.
    fn count_range(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        range: &ShardRange,
    ) -> Result<u64, StoreError>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

/// In-memory [`RecordStore`] keyed by (entity kind, node).
///
/// Supports silent write-drop injection so migration validation failures can
/// be exercised: a dropped record is acknowledged but never stored, exactly
/// the failure mode count validation exists to catch.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: DashMap<(EntityKind, NodeHandle), BTreeMap<String, Record>>,
    /// Drop every Nth accepted record when non-zero.
    drop_every: AtomicUsize,
    writes_seen: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preloads records for a (kind, node) pair.
    pub fn seed(&self, kind: &EntityKind, node: &NodeHandle, records: Vec<Record>) {
        let mut map = self
            .data
            .entry((kind.clone(), node.clone()))
            .or_default();
        for record in records {
            map.insert(record.key.as_str().to_string(), record);
        }
    }

    /// Arms write-drop injection: every `n`th accepted record vanishes.
    pub fn drop_every_nth(&self, n: usize) {
        self.drop_every.store(n, Ordering::Relaxed);
        self.writes_seen.store(0, Ordering::Relaxed);
    }

    /// Total records held for a (kind, node) pair.
    pub fn len(&self, kind: &EntityKind, node: &NodeHandle) -> usize {
        self.data
            .get(&(kind.clone(), node.clone()))
            .map(|map| map.len())
            .unwrap_or(0)
    }

    /// Fetches one record by key for assertions.
    pub fn get(&self, kind: &EntityKind, node: &NodeHandle, key: &str) -> Option<Record> {
        self.data
            .get(&(kind.clone(), node.clone()))
            .and_then(|map| map.get(key).cloned())
    }
}

impl RecordStore for InMemoryStore {
    fn find_range(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        range: &ShardRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        let map = match self.data.get(&(kind.clone(), node.clone())) {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };
        Ok(map
            .values()
            .filter(|record| range.contains(&record.key))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn create_many(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        records: &[Record],
    ) -> Result<usize, StoreError> {
        let drop_every = self.drop_every.load(Ordering::Relaxed);
        let mut map = self
            .data
            .entry((kind.clone(), node.clone()))
            .or_default();
        for record in records {
            let seen = self.writes_seen.fetch_add(1, Ordering::Relaxed) + 1;
            if drop_every > 0 && seen % drop_every == 0 {
                continue; // acknowledged but never stored
            }
            map.insert(record.key.as_str().to_string(), record.clone());
        }
        Ok(records.len())
    }

    fn count_range(
        &self,
        kind: &EntityKind,
        node: &NodeHandle,
        range: &ShardRange,
    ) -> Result<u64, StoreError> {
        let map = match self.data.get(&(kind.clone(), node.clone())) {
            Some(map) => map,
            None => return Ok(0),
        };
        Ok(map
            .values()
            .filter(|record| range.contains(&record.key))
            .count() as u64)
    }
}

/// In-memory [`BackupService`] that acknowledges and remembers backups.
#[derive(Debug, Default)]
pub struct InMemoryBackups {
    handles: DashMap<String, BackupHandle>,
    next_id: AtomicU64,
    fail_next: AtomicUsize,
}

impl InMemoryBackups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` backup requests fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::Relaxed);
    }

    /// Number of acknowledged backups still retained.
    pub fn retained(&self) -> usize {
        self.handles.len()
    }
}

impl BackupService for InMemoryBackups {
    fn backup_shard(&self, kind: &EntityKind, shard: &Shard) -> Result<BackupHandle, BackupError> {
        let remaining = self.fail_next.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::Relaxed);
            return Err(BackupError::Failed(format!(
                "injected failure backing up {kind}/{}",
                shard.id
            )));
        }

        let id = format!(
            "backup-{kind}-{}-{}",
            shard.id,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let handle = BackupHandle {
            id: id.clone(),
            shard: shard.id,
            created_at: Utc::now(),
        };
        self.handles.insert(id, handle.clone());
        Ok(handle)
    }

    fn restore_shard(&self, handle: &BackupHandle) -> Result<(), BackupError> {
        if self.handles.contains_key(&handle.id) {
            Ok(())
        } else {
            Err(BackupError::UnknownHandle(handle.id.clone()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ShardStatus;

    fn kind() -> EntityKind {
        EntityKind::new("chapter")
    }

    fn node() -> NodeHandle {
        NodeHandle::new("node-a")
    }

    fn all_range() -> ShardRange {
        ShardRange::Bucket { index: 0, count: 1 }
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(format!("key-{i:03}")).with_field("i", i as i64))
            .collect()
    }

    #[test]
    fn test_seed_find_roundtrip() {
        let store = InMemoryStore::new();
        store.seed(&kind(), &node(), records(10));

        let page = store
            .find_range(&kind(), &node(), &all_range(), 0, 5)
            .unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].key.as_str(), "key-000");

        let rest = store
            .find_range(&kind(), &node(), &all_range(), 5, 100)
            .unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[0].key.as_str(), "key-005");
    }

    #[test]
    fn test_count_range_filters() {
        let store = InMemoryStore::new();
        store.seed(&kind(), &node(), records(20));

        let bucket0 = ShardRange::Bucket { index: 0, count: 2 };
        let bucket1 = ShardRange::Bucket { index: 1, count: 2 };
        let c0 = store.count_range(&kind(), &node(), &bucket0).unwrap();
        let c1 = store.count_range(&kind(), &node(), &bucket1).unwrap();
        assert_eq!(c0 + c1, 20);
    }

    #[test]
    fn test_create_many_overwrites_by_key() {
        let store = InMemoryStore::new();
        store.seed(&kind(), &node(), records(3));

        let replacement = Record::new("key-001").with_field("i", 99i64);
        store
            .create_many(&kind(), &node(), &[replacement])
            .unwrap();

        assert_eq!(store.len(&kind(), &node()), 3);
        let got = store.get(&kind(), &node(), "key-001").unwrap();
        assert_eq!(got.fields["i"].as_int(), Some(99));
    }

    #[test]
    fn test_write_drop_injection() {
        let store = InMemoryStore::new();
        store.drop_every_nth(3);

        let accepted = store.create_many(&kind(), &node(), &records(9)).unwrap();
        assert_eq!(accepted, 9); // all acknowledged...
        assert_eq!(store.len(&kind(), &node()), 6); // ...but every 3rd vanished
    }

    #[test]
    fn test_backup_roundtrip_and_injection() {
        let backups = InMemoryBackups::new();
        let shard = Shard::new(0, all_range(), node(), ShardStatus::Active);

        let handle = backups.backup_shard(&kind(), &shard).unwrap();
        assert_eq!(handle.shard, 0);
        assert_eq!(backups.retained(), 1);
        backups.restore_shard(&handle).unwrap();

        backups.fail_next(1);
        assert!(backups.backup_shard(&kind(), &shard).is_err());
        backups.backup_shard(&kind(), &shard).unwrap();
    }
}
