//! Shard table: per-entity shard metadata, status, and ownership.
//!
//! The manager tracks which shard owns which slice of key space, each
//! shard's health and load counters, and the ownership overrides produced by
//! completed migrations. Status transitions happen exclusively through the
//! migration coordinator.

use super::strategy::{PartitionStrategy, ShardId, ShardRange, Strategy};
use chrono::{DateTime, Utc};
use mesh_core::{EntityKind, NodeHandle, RecordKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::ShardError;

/// Per-entity sharding configuration. Immutable after initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityShardConfig {
    /// Record field used as the partition key.
    pub key_field: String,
    /// Total number of shards.
    pub shard_count: u32,
    /// Partitioning strategy.
    pub strategy: Strategy,
    /// Number of replicas per shard (informational for the router).
    pub replication_factor: u32,
}

impl EntityShardConfig {
    /// Hash-partitioned config keyed on `key_field`.
    pub fn hash(key_field: impl Into<String>, shard_count: u32) -> Self {
        Self {
            key_field: key_field.into(),
            shard_count,
            strategy: Strategy::Hash,
            replication_factor: 1,
        }
    }

    /// Range-partitioned config keyed on `key_field`.
    pub fn range(key_field: impl Into<String>, shard_count: u32) -> Self {
        Self {
            key_field: key_field.into(),
            shard_count,
            strategy: Strategy::Range,
            replication_factor: 1,
        }
    }

    /// Sets the replication factor.
    pub fn with_replication(mut self, factor: u32) -> Self {
        self.replication_factor = factor;
        self
    }
}

/// Shard lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Serving reads and writes.
    Active,
    /// Locked by an in-flight migration.
    Rebalancing,
    /// Not serving; requires operator action.
    Inactive,
}

/// Load counters for one shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardStats {
    /// Records attributed to this shard.
    pub records: u64,
    /// Operations observed since initialization.
    pub ops: u64,
    /// Last time a caller reported traffic.
    pub last_access: Option<DateTime<Utc>>,
}

impl ShardStats {
    /// Load metric used for rebalance decisions: operations per record.
    ///
    /// An empty shard with traffic reads as maximally busy per record, which
    /// is what pairing wants; records are floored at 1 to keep it finite.
    pub fn load(&self) -> f64 {
        self.ops as f64 / self.records.max(1) as f64
    }
}

/// One shard of one entity's key space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    /// Shard identifier, equal to its initial partition index.
    pub id: ShardId,
    /// Slice of key space this shard was created with.
    pub range: ShardRange,
    /// Node currently hosting the shard.
    pub node: NodeHandle,
    /// Lifecycle status.
    pub status: ShardStatus,
    /// Load counters.
    pub stats: ShardStats,
}

impl Shard {
    /// Creates a shard.
    pub fn new(id: ShardId, range: ShardRange, node: NodeHandle, status: ShardStatus) -> Self {
        Self {
            id,
            range,
            node,
            status,
            stats: ShardStats::default(),
        }
    }
}

/// Shard table for one entity kind.
pub struct ShardTable {
    config: EntityShardConfig,
    strategy: Arc<dyn PartitionStrategy>,
    shards: Vec<Shard>,
    /// Ownership overrides from completed migrations:
    /// partition index -> owning shard.
    overrides: HashMap<ShardId, ShardId>,
}

impl ShardTable {
    fn owner_of_index(&self, index: ShardId) -> ShardId {
        *self.overrides.get(&index).unwrap_or(&index)
    }
}

impl std::fmt::Debug for ShardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTable")
            .field("config", &self.config)
            .field("strategy", &self.strategy.describe())
            .field("shards", &self.shards.len())
            .field("overrides", &self.overrides)
            .finish()
    }
}

/// Manages shard tables for all entity kinds.
#[derive(Debug, Default)]
pub struct ShardManager {
    tables: HashMap<EntityKind, ShardTable>,
}

impl ShardManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the shard table for an entity kind, assigning shards to
    /// `nodes` round-robin. Fails if the kind is already initialized: shard
    /// configuration is immutable once live.
    pub fn init_entity(
        &mut self,
        kind: EntityKind,
        config: EntityShardConfig,
        nodes: &[NodeHandle],
    ) -> Result<(), ShardError> {
        if self.tables.contains_key(&kind) {
            return Err(ShardError::AlreadyInitialized(kind));
        }
        if nodes.is_empty() {
            return Err(ShardError::InvalidConfig("no nodes supplied".into()));
        }
        if config.shard_count == 0 {
            return Err(ShardError::InvalidConfig("shard_count must be > 0".into()));
        }

        let strategy = config.strategy.build(config.shard_count);
        let shards = (0..config.shard_count)
            .map(|id| {
                Shard::new(
                    id,
                    strategy.range_of(id),
                    nodes[id as usize % nodes.len()].clone(),
                    ShardStatus::Active,
                )
            })
            .collect();

        self.tables.insert(
            kind,
            ShardTable {
                config,
                strategy,
                shards,
                overrides: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Entity kinds with live shard tables.
    pub fn kinds(&self) -> Vec<EntityKind> {
        self.tables.keys().cloned().collect()
    }

    /// Per-entity configuration.
    pub fn config(&self, kind: &EntityKind) -> Option<&EntityShardConfig> {
        self.tables.get(kind).map(|t| &t.config)
    }

    fn table(&self, kind: &EntityKind) -> Result<&ShardTable, ShardError> {
        self.tables
            .get(kind)
            .ok_or_else(|| ShardError::UnknownEntity(kind.clone()))
    }

    fn table_mut(&mut self, kind: &EntityKind) -> Result<&mut ShardTable, ShardError> {
        self.tables
            .get_mut(kind)
            .ok_or_else(|| ShardError::UnknownEntity(kind.clone()))
    }

    /// The shard currently owning `key`, after migration overrides.
    pub fn shard_id_for_key(
        &self,
        kind: &EntityKind,
        key: &RecordKey,
    ) -> Result<ShardId, ShardError> {
        let table = self.table(kind)?;
        let index = table.strategy.shard_for_key(key);
        Ok(table.owner_of_index(index))
    }

    /// Shard lookup by id.
    pub fn shard(&self, kind: &EntityKind, id: ShardId) -> Result<&Shard, ShardError> {
        self.table(kind)?
            .shards
            .get(id as usize)
            .ok_or(ShardError::UnknownShard(id))
    }

    fn shard_mut(&mut self, kind: &EntityKind, id: ShardId) -> Result<&mut Shard, ShardError> {
        self.table_mut(kind)?
            .shards
            .get_mut(id as usize)
            .ok_or(ShardError::UnknownShard(id))
    }

    /// All shards of an entity kind.
    pub fn shards(&self, kind: &EntityKind) -> Result<&[Shard], ShardError> {
        Ok(&self.table(kind)?.shards)
    }

    /// Records observed traffic against a shard.
    pub fn record_ops(
        &mut self,
        kind: &EntityKind,
        id: ShardId,
        ops_delta: u64,
        records_delta: i64,
    ) -> Result<(), ShardError> {
        let shard = self.shard_mut(kind, id)?;
        shard.stats.ops += ops_delta;
        shard.stats.records = if records_delta >= 0 {
            shard.stats.records.saturating_add(records_delta as u64)
        } else {
            shard.stats.records.saturating_sub((-records_delta) as u64)
        };
        shard.stats.last_access = Some(Utc::now());
        Ok(())
    }

    /// Sets a shard's lifecycle status.
    ///
    /// Only the migration coordinator and restart recovery should call this.
    pub fn set_status(
        &mut self,
        kind: &EntityKind,
        id: ShardId,
        status: ShardStatus,
    ) -> Result<(), ShardError> {
        self.shard_mut(kind, id)?.status = status;
        Ok(())
    }

    /// `(shard, load)` pairs for all active shards, in shard-id order.
    pub fn active_loads(&self, kind: &EntityKind) -> Result<Vec<(ShardId, f64)>, ShardError> {
        Ok(self
            .table(kind)?
            .shards
            .iter()
            .filter(|s| s.status == ShardStatus::Active)
            .map(|s| (s.id, s.stats.load()))
            .collect())
    }

    /// Atomically flips ownership of every partition index currently owned
    /// by `source` over to `target`, and moves `records` between the two
    /// shards' counters. Called under the manager's write lock as the final
    /// step of a completed migration.
    pub fn reassign_ownership(
        &mut self,
        kind: &EntityKind,
        source: ShardId,
        target: ShardId,
        records: u64,
    ) -> Result<(), ShardError> {
        let table = self.table_mut(kind)?;
        let count = table.strategy.shard_count();
        for index in 0..count {
            if table.owner_of_index(index) == source {
                table.overrides.insert(index, target);
            }
        }

        let source_shard = table
            .shards
            .get_mut(source as usize)
            .ok_or(ShardError::UnknownShard(source))?;
        source_shard.stats.records = source_shard.stats.records.saturating_sub(records);

        let target_shard = table
            .shards
            .get_mut(target as usize)
            .ok_or(ShardError::UnknownShard(target))?;
        target_shard.stats.records = target_shard.stats.records.saturating_add(records);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn kind() -> EntityKind {
        EntityKind::new("chapter")
    }

    fn nodes() -> Vec<NodeHandle> {
        vec![NodeHandle::new("node-a"), NodeHandle::new("node-b")]
    }

    fn manager(shard_count: u32) -> ShardManager {
        let mut manager = ShardManager::new();
        manager
            .init_entity(kind(), EntityShardConfig::hash("id", shard_count), &nodes())
            .unwrap();
        manager
    }

    #[test]
    fn test_init_round_robin_nodes() {
        let manager = manager(4);
        let shards = manager.shards(&kind()).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].node.as_str(), "node-a");
        assert_eq!(shards[1].node.as_str(), "node-b");
        assert_eq!(shards[2].node.as_str(), "node-a");
        assert!(shards.iter().all(|s| s.status == ShardStatus::Active));
    }

    #[test]
    fn test_init_twice_fails() {
        let mut manager = manager(2);
        let result = manager.init_entity(kind(), EntityShardConfig::hash("id", 8), &nodes());
        assert!(matches!(result, Err(ShardError::AlreadyInitialized(_))));
        // Original table untouched.
        assert_eq!(manager.shards(&kind()).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_entity() {
        let manager = manager(2);
        let other = EntityKind::new("novel");
        assert!(matches!(
            manager.shard_id_for_key(&other, &RecordKey::new("x")),
            Err(ShardError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_routing_deterministic() {
        let manager = manager(4);
        let key = RecordKey::new("chapter:7");
        let a = manager.shard_id_for_key(&kind(), &key).unwrap();
        let b = manager.shard_id_for_key(&kind(), &key).unwrap();
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn test_record_ops_updates_stats() {
        let mut manager = manager(2);
        manager.record_ops(&kind(), 0, 10, 5).unwrap();
        manager.record_ops(&kind(), 0, 0, -2).unwrap();

        let shard = manager.shard(&kind(), 0).unwrap();
        assert_eq!(shard.stats.ops, 10);
        assert_eq!(shard.stats.records, 3);
        assert!(shard.stats.last_access.is_some());
    }

    #[test]
    fn test_load_metric() {
        let stats = ShardStats {
            records: 100,
            ops: 250,
            last_access: None,
        };
        assert!((stats.load() - 2.5).abs() < 1e-9);

        // Empty shard stays finite.
        let empty = ShardStats {
            records: 0,
            ops: 50,
            last_access: None,
        };
        assert_eq!(empty.load(), 50.0);
    }

    #[test]
    fn test_reassign_ownership_reroutes_keys() {
        let mut manager = manager(4);

        // Find a key owned by shard 1, then flip shard 1's range to shard 2.
        let key = (0..1000)
            .map(|i| RecordKey::new(format!("key-{i}")))
            .find(|k| manager.shard_id_for_key(&kind(), k).unwrap() == 1)
            .expect("some key maps to shard 1");

        manager.record_ops(&kind(), 1, 0, 40).unwrap();
        manager.reassign_ownership(&kind(), 1, 2, 40).unwrap();

        assert_eq!(manager.shard_id_for_key(&kind(), &key).unwrap(), 2);
        assert_eq!(manager.shard(&kind(), 1).unwrap().stats.records, 0);
        assert_eq!(manager.shard(&kind(), 2).unwrap().stats.records, 40);
    }

    #[test]
    fn test_active_loads_skips_non_active() {
        let mut manager = manager(3);
        manager.record_ops(&kind(), 0, 10, 10).unwrap();
        manager
            .set_status(&kind(), 1, ShardStatus::Rebalancing)
            .unwrap();

        let loads = manager.active_loads(&kind()).unwrap();
        assert_eq!(loads.len(), 2);
        assert!(loads.iter().all(|(id, _)| *id != 1));
    }
}
