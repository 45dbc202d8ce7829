//! Shard migration: moving a key range between shards with validation.
//!
//! One [`MigrationTask`] owns the full lifecycle of a single rebalance
//! operation and is never reused. The run protocol, each step a hard
//! prerequisite for the next:
//!
//! 1. mark both shards `Rebalancing` (mutual exclusion),
//! 2. take a point-in-time backup of the source shard - the rollback anchor,
//! 3. copy the source range in fixed-size batches, structured fields first,
//!    vector payloads last,
//! 4. validate record counts between source and target,
//! 5. flip range ownership, settle counters, return both shards to `Active`.
//!
//! A validation mismatch fails the task, reverts both shards to `Active` and
//! retains the backup for manual recovery; no automatic rollback-replay is
//! attempted. Tasks found `InProgress` after a crash must be abandoned via
//! [`MigrationCoordinator::abandon_in_progress`] and re-triggered manually.

use super::manager::{ShardManager, ShardStatus};
use super::strategy::{ShardId, ShardRange};
use super::ShardError;
use crate::backend::{BackupHandle, BackupService, RecordStore};
use crate::events::{Event, EventSink};
use chrono::{DateTime, Utc};
use mesh_core::{EntityKind, NodeHandle, Record};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Identifier of a migration task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Migration task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A single rebalance operation.
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub id: TaskId,
    pub kind: EntityKind,
    pub source: ShardId,
    pub target: ShardId,
    pub status: TaskStatus,
    /// Progress percentage, 0-100.
    pub progress: u8,
    /// Failure description when `status == Failed`.
    pub error: Option<String>,
    /// Backup taken before the copy began; retained on failure.
    pub backup: Option<BackupHandle>,
    pub records_moved: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Executes migrations against the shard table and external collaborators.
pub struct MigrationCoordinator {
    manager: Arc<RwLock<ShardManager>>,
    store: Arc<dyn RecordStore>,
    backup: Arc<dyn BackupService>,
    events: Arc<dyn EventSink>,
    tasks: RwLock<HashMap<TaskId, MigrationTask>>,
    next_id: AtomicU64,
    /// Records copied per store round trip.
    batch_size: usize,
}

impl MigrationCoordinator {
    /// Creates a coordinator over a shared shard table.
    pub fn new(
        manager: Arc<RwLock<ShardManager>>,
        store: Arc<dyn RecordStore>,
        backup: Arc<dyn BackupService>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            manager,
            store,
            backup,
            events,
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            batch_size: 500,
        }
    }

    /// Overrides the copy batch size (clamped to 100..=1000).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(100, 1000);
        self
    }

    /// Creates a task for moving `source`'s range to `target`.
    ///
    /// Both shards must exist and be `Active`; a shard already locked by an
    /// in-flight migration surfaces as `ShardUnavailable`.
    pub fn create_task(
        &self,
        kind: EntityKind,
        source: ShardId,
        target: ShardId,
    ) -> Result<TaskId, ShardError> {
        if source == target {
            return Err(ShardError::InvalidTask(
                "source and target shards are identical".into(),
            ));
        }

        {
            let manager = self.manager.read().unwrap();
            for id in [source, target] {
                let shard = manager.shard(&kind, id)?;
                if shard.status != ShardStatus::Active {
                    return Err(ShardError::ShardUnavailable {
                        kind: kind.clone(),
                        shard: id,
                    });
                }
            }
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = MigrationTask {
            id,
            kind,
            source,
            target,
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            backup: None,
            records_moved: 0,
            started_at: None,
            finished_at: None,
        };
        self.tasks.write().unwrap().insert(id, task);
        Ok(id)
    }

    /// Returns a snapshot of a task.
    pub fn task(&self, id: TaskId) -> Option<MigrationTask> {
        self.tasks.read().unwrap().get(&id).cloned()
    }

    /// Returns snapshots of all tasks, oldest first.
    pub fn tasks(&self) -> Vec<MigrationTask> {
        let mut tasks: Vec<_> = self.tasks.read().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Runs a task to completion or failure.
    ///
    /// Synchronous and long-running; callers are expected to invoke it from
    /// a worker, not a latency-sensitive path.
    pub fn run(&self, id: TaskId) -> Result<(), ShardError> {
        let (kind, source, target) = {
            let tasks = self.tasks.read().unwrap();
            let task = tasks.get(&id).ok_or(ShardError::UnknownTask(id))?;
            if task.status != TaskStatus::Pending {
                return Err(ShardError::InvalidTask(format!(
                    "{id} is {:?}, only pending tasks can run",
                    task.status
                )));
            }
            (task.kind.clone(), task.source, task.target)
        };

        // Step 1: lock both shards. The `Rebalancing` status is the mutex -
        // any concurrent task touching either shard fails right here.
        {
            let mut manager = self.manager.write().unwrap();
            for shard_id in [source, target] {
                let shard = manager.shard(&kind, shard_id)?;
                if shard.status != ShardStatus::Active {
                    let err = ShardError::ShardUnavailable {
                        kind: kind.clone(),
                        shard: shard_id,
                    };
                    self.mark_failed(id, None, err.to_string());
                    return Err(err);
                }
            }
            manager.set_status(&kind, source, ShardStatus::Rebalancing)?;
            manager.set_status(&kind, target, ShardStatus::Rebalancing)?;
        }

        self.update_task(id, |task| {
            task.status = TaskStatus::InProgress;
            task.started_at = Some(Utc::now());
            task.progress = 5;
        });
        self.events.emit(Event::MigrationStarted {
            task: id.0,
            source,
            target,
        });

        match self.execute(id, &kind, source, target) {
            Ok(moved) => {
                self.update_task(id, |task| {
                    task.status = TaskStatus::Completed;
                    task.progress = 100;
                    task.records_moved = moved;
                    task.finished_at = Some(Utc::now());
                });
                self.events.emit(Event::MigrationCompleted {
                    task: id.0,
                    source,
                    target,
                    records_moved: moved,
                });
                Ok(())
            }
            Err(err) => {
                self.revert_shards(&kind, source, target);
                self.mark_failed(id, Some((source, target)), err.to_string());
                Err(err)
            }
        }
    }

    /// Steps 2-5 of the protocol. Shard statuses are already `Rebalancing`;
    /// the caller settles task state and reverts on error.
    fn execute(
        &self,
        id: TaskId,
        kind: &EntityKind,
        source: ShardId,
        target: ShardId,
    ) -> Result<u64, ShardError> {
        let (range, source_node, target_node) = {
            let manager = self.manager.read().unwrap();
            let source_shard = manager.shard(kind, source)?;
            let target_shard = manager.shard(kind, target)?;
            (
                source_shard.range.clone(),
                source_shard.node.clone(),
                target_shard.node.clone(),
            )
        };

        // Step 2: backup first. Without the acknowledgment there is no
        // rollback anchor and the migration must not touch any data.
        let handle = {
            let manager = self.manager.read().unwrap();
            let source_shard = manager.shard(kind, source)?.clone();
            drop(manager);
            self.backup.backup_shard(kind, &source_shard)?
        };
        self.update_task(id, |task| {
            task.backup = Some(handle.clone());
            task.progress = 10;
        });

        // Step 3a: copy structured fields in batches.
        let moved = self.copy_range(id, kind, &range, &source_node, &target_node)?;

        // Step 4: counts must match exactly between source and target.
        let source_count = self.store.count_range(kind, &source_node, &range)?;
        let target_count = self.store.count_range(kind, &target_node, &range)?;
        if source_count != target_count {
            return Err(ShardError::Validation {
                source_count,
                target: target_count,
            });
        }
        self.update_task(id, |task| task.progress = 95);

        // Step 5: flip ownership atomically and reopen both shards.
        {
            let mut manager = self.manager.write().unwrap();
            manager.reassign_ownership(kind, source, target, moved)?;
            manager.set_status(kind, source, ShardStatus::Active)?;
            manager.set_status(kind, target, ShardStatus::Active)?;
        }
        Ok(moved)
    }

    /// Copies the range in two passes: records without their vector payloads
    /// first, then full records for every vector-carrying key.
    fn copy_range(
        &self,
        id: TaskId,
        kind: &EntityKind,
        range: &ShardRange,
        source_node: &NodeHandle,
        target_node: &NodeHandle,
    ) -> Result<u64, ShardError> {
        let total = self.store.count_range(kind, source_node, range)?;
        let mut offset = 0usize;
        let mut moved = 0u64;
        let mut vector_records: Vec<Record> = Vec::new();

        loop {
            let batch = self
                .store
                .find_range(kind, source_node, range, offset, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            moved += batch.len() as u64;

            let stripped: Vec<Record> = batch.iter().map(Record::without_vector).collect();
            self.store.create_many(kind, target_node, &stripped)?;
            vector_records.extend(batch.into_iter().filter(|r| r.vector.is_some()));

            // Structured copy spans 10..=80 percent.
            let progress = if total == 0 {
                80
            } else {
                10 + ((moved.min(total) * 70) / total) as u8
            };
            self.update_task(id, |task| task.progress = progress);
        }

        // Step 3b: vector payloads last, overwriting the stripped copies.
        for chunk in vector_records.chunks(self.batch_size) {
            self.store.create_many(kind, target_node, chunk)?;
        }
        self.update_task(id, |task| task.progress = 90);
        Ok(moved)
    }

    /// Marks tasks left `InProgress` by a crash as failed and reopens their
    /// shards. The surrounding system calls this once on restart; abandoned
    /// migrations require manual re-trigger.
    pub fn abandon_in_progress(&self) -> Vec<TaskId> {
        let abandoned: Vec<(TaskId, EntityKind, ShardId, ShardId)> = {
            let tasks = self.tasks.read().unwrap();
            tasks
                .values()
                .filter(|task| task.status == TaskStatus::InProgress)
                .map(|task| (task.id, task.kind.clone(), task.source, task.target))
                .collect()
        };

        for (id, kind, source, target) in &abandoned {
            self.revert_shards(kind, *source, *target);
            self.mark_failed(
                *id,
                Some((*source, *target)),
                "abandoned: found in progress after restart".to_string(),
            );
        }
        abandoned.into_iter().map(|(id, ..)| id).collect()
    }

    fn revert_shards(&self, kind: &EntityKind, source: ShardId, target: ShardId) {
        let mut manager = self.manager.write().unwrap();
        let _ = manager.set_status(kind, source, ShardStatus::Active);
        let _ = manager.set_status(kind, target, ShardStatus::Active);
    }

    fn mark_failed(
        &self,
        id: TaskId,
        pair: Option<(ShardId, ShardId)>,
        reason: String,
    ) {
        self.update_task(id, |task| {
            task.status = TaskStatus::Failed;
            task.error = Some(reason.clone());
            task.finished_at = Some(Utc::now());
        });
        if let Some((source, target)) = pair {
            self.events.emit(Event::MigrationFailed {
                task: id.0,
                source,
                target,
                reason,
            });
        }
    }

    fn update_task(&self, id: TaskId, f: impl FnOnce(&mut MigrationTask)) {
        if let Some(task) = self.tasks.write().unwrap().get_mut(&id) {
            f(task);
        }
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("tasks", &self.tasks.read().unwrap().len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
