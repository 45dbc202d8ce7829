//! Key-to-node routing and rebalance planning.
//!
//! The router answers "which node owns this key" before every read or write
//! the persistence layer performs, and computes rebalance plans from observed
//! load. It never decides *when* to rebalance - the resource governor (or an
//! operator) calls [`ShardRouter::trigger_rebalance`].

use super::manager::ShardManager;
use super::migration::{MigrationCoordinator, TaskId};
use super::strategy::ShardId;
use super::{ShardError, ShardStatus};
use mesh_core::{EntityKind, NodeHandle, RecordKey};
use ordered_float::OrderedFloat;
use std::sync::{Arc, RwLock};

/// Load factor above the mean that marks a shard overloaded.
const OVERLOAD_FACTOR: f64 = 1.2;
/// Load factor below the mean that marks a shard underloaded.
const UNDERLOAD_FACTOR: f64 = 0.8;

/// A planned migration pairing: overloaded source, underloaded target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalancePair {
    pub source: ShardId,
    pub target: ShardId,
}

/// Routes keys to nodes and plans rebalances.
pub struct ShardRouter {
    manager: Arc<RwLock<ShardManager>>,
}

impl ShardRouter {
    /// Creates a router over a shared shard table.
    pub fn new(manager: Arc<RwLock<ShardManager>>) -> Self {
        Self { manager }
    }

    /// Shared access to the underlying shard table.
    pub fn manager(&self) -> &Arc<RwLock<ShardManager>> {
        &self.manager
    }

    /// Resolves the node owning `key`.
    ///
    /// Fails with `ShardUnavailable` when the owning shard is not active;
    /// the caller must treat this as transient and retry after rebalancing
    /// settles.
    pub fn resolve(&self, kind: &EntityKind, key: &RecordKey) -> Result<NodeHandle, ShardError> {
        let manager = self.manager.read().unwrap();
        let shard_id = manager.shard_id_for_key(kind, key)?;
        let shard = manager.shard(kind, shard_id)?;
        if shard.status != ShardStatus::Active {
            return Err(ShardError::ShardUnavailable {
                kind: kind.clone(),
                shard: shard_id,
            });
        }
        Ok(shard.node.clone())
    }

    /// Reports observed traffic so rebalance decisions see real load.
    pub fn record_ops(
        &self,
        kind: &EntityKind,
        shard: ShardId,
        ops_delta: u64,
        records_delta: i64,
    ) -> Result<(), ShardError> {
        self.manager
            .write()
            .unwrap()
            .record_ops(kind, shard, ops_delta, records_delta)
    }

    /// Computes overloaded/underloaded pairings from current load.
    ///
    /// `load(shard) = ops / records` over active shards; a shard is
    /// overloaded above `1.2 * mean` and underloaded below `0.8 * mean`.
    /// Pairing is greedy in discovery (shard-id) order; overloaded shards
    /// with no remaining underloaded partner are left alone.
    pub fn rebalance_plan(&self, kind: &EntityKind) -> Result<Vec<RebalancePair>, ShardError> {
        let manager = self.manager.read().unwrap();
        let loads = manager.active_loads(kind)?;
        drop(manager);

        if loads.len() < 2 {
            return Ok(Vec::new());
        }

        let mean: f64 = loads.iter().map(|(_, load)| load).sum::<f64>() / loads.len() as f64;
        if mean == 0.0 {
            return Ok(Vec::new());
        }

        // Quick exit: a balanced table plans nothing.
        let max_load = loads
            .iter()
            .map(|(_, load)| OrderedFloat(*load))
            .max()
            .map(|m| m.0)
            .unwrap_or(0.0);
        if max_load <= OVERLOAD_FACTOR * mean {
            return Ok(Vec::new());
        }

        let overloaded = loads
            .iter()
            .filter(|(_, load)| *load > OVERLOAD_FACTOR * mean)
            .map(|(id, _)| *id);
        let mut underloaded = loads
            .iter()
            .filter(|(_, load)| *load < UNDERLOAD_FACTOR * mean)
            .map(|(id, _)| *id);

        let mut pairs = Vec::new();
        for source in overloaded {
            match underloaded.next() {
                Some(target) => pairs.push(RebalancePair { source, target }),
                None => break, // no partner left: leave the shard as-is
            }
        }
        Ok(pairs)
    }

    /// Plans a rebalance and submits one migration task per pairing.
    ///
    /// Returns the submitted task ids; running them is the caller's job
    /// (migrations are long-running and must not block the router).
    pub fn trigger_rebalance(
        &self,
        kind: &EntityKind,
        coordinator: &MigrationCoordinator,
    ) -> Result<Vec<TaskId>, ShardError> {
        let pairs = self.rebalance_plan(kind)?;
        let mut tasks = Vec::with_capacity(pairs.len());
        for pair in pairs {
            tasks.push(coordinator.create_task(kind.clone(), pair.source, pair.target)?);
        }
        if !tasks.is_empty() {
            tracing::info!(
                kind = %kind,
                tasks = tasks.len(),
                "rebalance triggered"
            );
        }
        Ok(tasks)
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
