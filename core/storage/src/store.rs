//! Durable, priority-partitioned operation store.
//!
//! Each priority tier is an ordered partition persisted as its own JSON file.
//! A partition has a single async mutex: the task holding it is the only
//! writer, and readers synchronize on the same lock. Lock order is always
//! partition → dead-letter → audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use driftsync_common::{
    Error, Operation, OperationId, OperationStatus, Priority, Result, RetryDecision,
};

use crate::audit::{AuditLog, AuditOutcome, AuditRecord};
use crate::fsutil::{read_json_or_quarantine, write_json_atomic};

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long committed ids stay in the audit trail.
    pub audit_retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            audit_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Confirmation that an operation was durably appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub operation_id: OperationId,
    pub priority: Priority,
    /// Zero-based position within the partition at append time.
    pub position: usize,
}

/// An operation parked for operator attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: Operation,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Full store contents, used for backups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub partitions: BTreeMap<Priority, Vec<Operation>>,
    pub dead_letters: Vec<DeadLetter>,
    pub audit: Vec<AuditRecord>,
}

/// Counts per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub queued: BTreeMap<Priority, usize>,
    pub in_batch: usize,
    pub dead_letters: usize,
    pub audit_records: usize,
}

impl StoreStats {
    /// Total live operations across partitions.
    pub fn total_queued(&self) -> usize {
        self.queued.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Live(Priority),
    DeadLetter,
}

struct Partition {
    path: PathBuf,
    ops: VecDeque<Operation>,
}

impl Partition {
    fn position(&self, id: &OperationId) -> Option<usize> {
        self.ops.iter().position(|op| &op.id == id)
    }

    async fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.ops).await
    }
}

struct DeadLetterPartition {
    path: PathBuf,
    entries: Vec<DeadLetter>,
}

impl DeadLetterPartition {
    fn position(&self, id: &OperationId) -> Option<(usize, Priority)> {
        self.entries
            .iter()
            .position(|e| &e.operation.id == id)
            .map(|pos| (pos, self.entries[pos].operation.priority))
    }

    async fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries).await
    }
}

/// The operation store.
pub struct OperationStore {
    dir: PathBuf,
    partitions: BTreeMap<Priority, Mutex<Partition>>,
    dead_letter: Mutex<DeadLetterPartition>,
    audit: Mutex<AuditLog>,
    index: RwLock<HashMap<OperationId, Location>>,
    closed: AtomicBool,
}

impl OperationStore {
    /// Open the store rooted at `dir`, loading any persisted partitions.
    ///
    /// Operations that were in a batch when the process stopped are returned
    /// to the queue.
    pub async fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let partition_dir = dir.join("partitions");
        fs::create_dir_all(&partition_dir).await?;

        let mut index = HashMap::new();
        let mut partitions = BTreeMap::new();

        let dead_letter_path = dir.join("dead_letter.json");
        let entries: Vec<DeadLetter> = read_json_or_quarantine(&dead_letter_path)
            .await?
            .unwrap_or_default();
        for entry in &entries {
            index.insert(entry.operation.id.clone(), Location::DeadLetter);
        }

        let retention = chrono::Duration::from_std(config.audit_retention)
            .map_err(|e| Error::InvalidInput(format!("Invalid audit retention: {}", e)))?;
        let mut audit = AuditLog::open(dir.join("audit.log"), retention).await?;
        audit.compact(Utc::now()).await?;

        for priority in Priority::DRAIN_ORDER {
            let path = partition_dir.join(format!("{}.json", priority.as_str()));
            let mut ops: VecDeque<Operation> =
                read_json_or_quarantine(&path).await?.unwrap_or_default();

            // An operation whose commit or dead letter was recorded before the
            // partition was rewritten is settled already.
            let before = ops.len();
            ops.retain(|op| {
                index.get(&op.id) != Some(&Location::DeadLetter) && !audit.is_committed(&op.id)
            });
            let settled = before - ops.len();

            let mut recovered = 0;
            for op in ops.iter_mut() {
                if op.status == OperationStatus::InBatch {
                    op.status = OperationStatus::Queued;
                    recovered += 1;
                }
                index.insert(op.id.clone(), Location::Live(priority));
            }
            if recovered > 0 {
                warn!(
                    "Returned {} interrupted operations to the {} partition",
                    recovered, priority
                );
            }

            let partition = Partition { path, ops };
            if settled > 0 {
                warn!(
                    "Dropped {} already settled operations from the {} partition",
                    settled, priority
                );
                partition.persist().await?;
            }
            partitions.insert(priority, Mutex::new(partition));
        }

        info!(
            "Operation store opened at {} ({} live, {} dead-lettered)",
            dir.display(),
            index.values().filter(|l| matches!(l, Location::Live(_))).count(),
            entries.len()
        );

        Ok(Self {
            dir,
            partitions,
            dead_letter: Mutex::new(DeadLetterPartition {
                path: dead_letter_path,
                entries,
            }),
            audit: Mutex::new(audit),
            index: RwLock::new(index),
            closed: AtomicBool::new(false),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably append an operation to its priority partition.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is live, dead-lettered or committed
    /// - `Storage` if the store has been shut down
    /// - I/O errors from the durable write
    pub async fn append(&self, mut op: Operation) -> Result<StoreReceipt> {
        self.ensure_open()?;
        let priority = op.priority;
        let mut partition = self.partition(priority).lock().await;

        if self.audit.lock().await.is_committed(&op.id) {
            return Err(Error::AlreadyExists(format!(
                "Operation {} was already committed",
                op.id
            )));
        }
        self.reserve(&op.id, Location::Live(priority))?;

        op.status = OperationStatus::Queued;
        partition.ops.push_back(op);
        if let Err(e) = partition.persist().await {
            if let Some(op) = partition.ops.pop_back() {
                self.unindex(&op.id);
            }
            return Err(e);
        }

        let position = partition.ops.len() - 1;
        let operation_id = partition.ops[position].id.clone();
        debug!("Appended {} to {} at position {}", operation_id, priority, position);

        Ok(StoreReceipt {
            operation_id,
            priority,
            position,
        })
    }

    /// Up to `n` ready operations from a partition in FIFO order.
    ///
    /// An operation is ready when it is not already in a batch and every
    /// dependency has been committed.
    pub async fn peek(&self, priority: Priority, n: usize) -> Result<Vec<Operation>> {
        self.peek_where(priority, n, |_| true).await
    }

    /// Like [`peek`](Self::peek), additionally skipping operations rejected
    /// by `filter`.
    pub async fn peek_where<F>(&self, priority: Priority, n: usize, filter: F) -> Result<Vec<Operation>>
    where
        F: Fn(&Operation) -> bool,
    {
        let partition = self.partition(priority).lock().await;
        let audit = self.audit.lock().await;
        let index = self.read_index();
        let selected = ready_ops(&partition, n, &filter, |dep| {
            dependency_settled(&audit, &index, dep)
        });
        Ok(selected
            .into_iter()
            .map(|i| partition.ops[i].clone())
            .collect())
    }

    /// Select ready operations and mark them as in-batch in one step, so a
    /// concurrent drain of the same tier cannot pick them again.
    pub async fn checkout<F>(&self, priority: Priority, n: usize, filter: F) -> Result<Vec<Operation>>
    where
        F: Fn(&Operation) -> bool,
    {
        let mut partition = self.partition(priority).lock().await;
        let audit = self.audit.lock().await;
        let selected = {
            let index = self.read_index();
            ready_ops(&partition, n, &filter, |dep| dependency_settled(&audit, &index, dep))
        };
        drop(audit);

        Ok(selected
            .into_iter()
            .map(|i| {
                let op = &mut partition.ops[i];
                op.status = OperationStatus::InBatch;
                op.clone()
            })
            .collect())
    }

    /// Return an in-batch operation to the queue without consuming a retry.
    pub async fn release(&self, id: &OperationId) -> Result<()> {
        let priority = self.live_priority(id)?;
        let mut partition = self.partition(priority).lock().await;
        let pos = partition
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("Operation not found: {}", id)))?;
        let op = &mut partition.ops[pos];
        if op.status == OperationStatus::InBatch {
            op.status = if op.retry_count > 0 {
                OperationStatus::RetryPending
            } else {
                OperationStatus::Queued
            };
        }
        Ok(())
    }

    /// Remove an operation from its partition without recording an outcome.
    pub async fn remove(&self, id: &OperationId) -> Result<Operation> {
        let priority = self.live_priority(id)?;
        let mut partition = self.partition(priority).lock().await;
        let op = take(&mut partition, id)?;
        partition.persist().await?;
        self.unindex(id);
        Ok(op)
    }

    /// Record a commit in the audit trail, then remove the operation.
    ///
    /// The audit record is written first: if it fails the operation stays
    /// queued, and a partition left stale after it succeeded is cleaned up by
    /// [`open`](Self::open).
    pub async fn commit(&self, id: &OperationId, local_only: bool) -> Result<Operation> {
        let priority = self.live_priority(id)?;
        let mut partition = self.partition(priority).lock().await;
        if partition.position(id).is_none() {
            return Err(Error::NotFound(format!("Operation not found: {}", id)));
        }

        let outcome = if local_only {
            AuditOutcome::CommittedLocally
        } else {
            AuditOutcome::Committed
        };
        self.audit
            .lock()
            .await
            .append(AuditRecord::new(id.clone(), outcome, None))
            .await?;

        let mut op = take(&mut partition, id)?;
        self.unindex(id);
        if let Err(e) = partition.persist().await {
            warn!("Commit of {} recorded but the {} partition was not rewritten: {}", id, priority, e);
        }

        op.status = OperationStatus::Committed;
        debug!("Committed {} from {}", id, priority);
        Ok(op)
    }

    /// Count a failed attempt; the failure that spends the retry budget moves
    /// the operation to the dead-letter partition.
    pub async fn record_failure(&self, id: &OperationId, error: &str) -> Result<RetryDecision> {
        let priority = self.live_priority(id)?;
        let mut partition = self.partition(priority).lock().await;
        let pos = partition
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("Operation not found: {}", id)))?;

        let decision = partition.ops[pos].register_failure(error);
        match decision {
            RetryDecision::Retry { attempts_left } => {
                partition.persist().await?;
                debug!("{} failed ({}), {} attempts left", id, error, attempts_left);
            }
            RetryDecision::Exhausted => {
                let reason = format!(
                    "Retries exhausted after {} attempts: {}",
                    partition.ops[pos].retry_count, error
                );
                self.park(&mut partition, id, reason).await?;
            }
        }
        Ok(decision)
    }

    /// Move a live operation to the dead-letter partition.
    pub async fn move_to_dead_letter(&self, id: &OperationId, reason: impl Into<String>) -> Result<()> {
        let priority = self.live_priority(id)?;
        let mut partition = self.partition(priority).lock().await;
        self.park(&mut partition, id, reason.into()).await
    }

    /// Dead-letter every live operation that transitively depends on `root`,
    /// which must itself be dead-lettered. Returns the ids moved, in the order
    /// they were moved.
    pub async fn dead_letter_dependents(&self, root: &OperationId) -> Result<Vec<OperationId>> {
        let mut moved = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(parent) = pending.pop() {
            for (priority, partition) in &self.partitions {
                let dependents: Vec<OperationId> = partition
                    .lock()
                    .await
                    .ops
                    .iter()
                    .filter(|op| op.dependencies.contains(&parent))
                    .map(|op| op.id.clone())
                    .collect();

                for id in dependents {
                    let mut guard = partition.lock().await;
                    if guard.position(&id).is_none() {
                        continue;
                    }
                    let reason = format!("Dependency {} was dead-lettered", parent);
                    self.park(&mut guard, &id, reason).await?;
                    debug!("Cascaded dead letter of {} to {} in {}", parent, id, priority);
                    pending.push(id.clone());
                    moved.push(id);
                }
            }
        }
        Ok(moved)
    }

    /// All dead-lettered operations, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letter.lock().await.entries.clone()
    }

    /// Return a dead-lettered operation to its partition with a fresh retry
    /// budget.
    ///
    /// The operation is written to its partition before it leaves the
    /// dead-letter file; a crash in between leaves it dead-lettered.
    pub async fn requeue_dead_letter(&self, id: &OperationId) -> Result<StoreReceipt> {
        self.ensure_open()?;
        let priority = self
            .dead_letter
            .lock()
            .await
            .position(id)
            .map(|(_, priority)| priority)
            .ok_or_else(|| Error::NotFound(format!("No dead letter for {}", id)))?;

        let mut partition = self.partition(priority).lock().await;
        let mut dead_letter = self.dead_letter.lock().await;
        let (pos, _) = dead_letter
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("No dead letter for {}", id)))?;

        let mut op = dead_letter.entries[pos].operation.clone();
        op.status = OperationStatus::Queued;
        op.retry_count = 0;
        op.last_error = None;
        partition.ops.push_back(op);
        if let Err(e) = partition.persist().await {
            partition.ops.pop_back();
            return Err(e);
        }

        let entry = dead_letter.entries.remove(pos);
        if let Err(e) = dead_letter.persist().await {
            dead_letter.entries.insert(pos, entry);
            partition.ops.pop_back();
            if let Err(rollback) = partition.persist().await {
                warn!("Could not roll back requeue of {}: {}", id, rollback);
            }
            return Err(e);
        }
        self.write_index().insert(id.clone(), Location::Live(priority));

        let receipt = StoreReceipt {
            operation_id: id.clone(),
            priority,
            position: partition.ops.len() - 1,
        };
        drop(dead_letter);
        drop(partition);
        self.audit
            .lock()
            .await
            .append(AuditRecord::new(id.clone(), AuditOutcome::Requeued, None))
            .await?;

        info!("Requeued dead letter {} into {}", id, receipt.priority);
        Ok(receipt)
    }

    /// Drop every dead letter, returning what was removed.
    pub async fn purge_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut dead_letter = self.dead_letter.lock().await;
        let purged = std::mem::take(&mut dead_letter.entries);
        dead_letter.persist().await?;
        for entry in &purged {
            self.unindex(&entry.operation.id);
        }
        warn!("Purged {} dead letters", purged.len());
        Ok(purged)
    }

    /// Look up a live operation.
    pub async fn get(&self, id: &OperationId) -> Option<Operation> {
        let priority = self.live_priority(id).ok()?;
        let partition = self.partition(priority).lock().await;
        partition.position(id).map(|pos| partition.ops[pos].clone())
    }

    /// Whether the id is live or dead-lettered.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.read_index().contains_key(id)
    }

    /// Whether the id is dead-lettered.
    pub fn is_dead_lettered(&self, id: &OperationId) -> bool {
        self.read_index().get(id) == Some(&Location::DeadLetter)
    }

    /// Whether the id has a commit in the audit trail.
    pub async fn is_committed(&self, id: &OperationId) -> bool {
        self.audit.lock().await.is_committed(id)
    }

    /// Copy of the audit trail.
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().await.records().to_vec()
    }

    /// Number of live operations in a partition.
    pub async fn len(&self, priority: Priority) -> usize {
        self.partition(priority).lock().await.ops.len()
    }

    /// Check if every partition is empty.
    pub async fn is_empty(&self) -> bool {
        for partition in self.partitions.values() {
            if !partition.lock().await.ops.is_empty() {
                return false;
            }
        }
        true
    }

    /// Counts per partition.
    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for (priority, partition) in &self.partitions {
            let partition = partition.lock().await;
            stats.queued.insert(*priority, partition.ops.len());
            stats.in_batch += partition
                .ops
                .iter()
                .filter(|op| op.status == OperationStatus::InBatch)
                .count();
        }
        stats.dead_letters = self.dead_letter.lock().await.entries.len();
        stats.audit_records = self.audit.lock().await.len();
        stats
    }

    /// Consistent copy of the whole store.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let mut guards = Vec::new();
        for (priority, partition) in &self.partitions {
            guards.push((*priority, partition.lock().await));
        }
        let dead_letter = self.dead_letter.lock().await;
        let audit = self.audit.lock().await;

        StoreSnapshot {
            partitions: guards
                .iter()
                .map(|(p, g)| (*p, g.ops.iter().cloned().collect()))
                .collect(),
            dead_letters: dead_letter.entries.clone(),
            audit: audit.records().to_vec(),
        }
    }

    /// Replace the whole store with a snapshot.
    ///
    /// This is destructive; callers take a backup of the current state first.
    pub async fn replace_with(&self, snapshot: StoreSnapshot) -> Result<()> {
        self.ensure_open()?;
        let mut guards = Vec::new();
        for (priority, partition) in &self.partitions {
            guards.push((*priority, partition.lock().await));
        }
        let mut dead_letter = self.dead_letter.lock().await;
        let mut audit = self.audit.lock().await;

        let mut index = HashMap::new();
        for (priority, guard) in guards.iter_mut() {
            let priority = *priority;
            let ops: VecDeque<Operation> = snapshot
                .partitions
                .get(&priority)
                .cloned()
                .unwrap_or_default()
                .into();
            for op in &ops {
                index.insert(op.id.clone(), Location::Live(priority));
            }
            guard.ops = ops;
            guard.persist().await?;
        }

        for entry in &snapshot.dead_letters {
            index.insert(entry.operation.id.clone(), Location::DeadLetter);
        }
        dead_letter.entries = snapshot.dead_letters;
        dead_letter.persist().await?;
        audit.replace(snapshot.audit).await?;

        *self.write_index() = index;
        info!("Operation store replaced from snapshot");
        Ok(())
    }

    /// Persist every partition and refuse further appends.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for partition in self.partitions.values() {
            partition.lock().await.persist().await?;
        }
        self.dead_letter.lock().await.persist().await?;
        info!("Operation store shut down");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage("Operation store is shut down".to_string()));
        }
        Ok(())
    }

    fn partition(&self, priority: Priority) -> &Mutex<Partition> {
        &self.partitions[&priority]
    }

    /// Move an operation of a locked partition to the dead-letter partition.
    ///
    /// The dead letter is persisted before the partition is rewritten, so a
    /// crash in between leaves the operation in both files; `open` keeps the
    /// dead letter.
    async fn park(&self, partition: &mut Partition, id: &OperationId, reason: String) -> Result<()> {
        let pos = partition
            .position(id)
            .ok_or_else(|| Error::NotFound(format!("Operation not found: {}", id)))?;
        let mut op = partition.ops[pos].clone();
        op.status = OperationStatus::DeadLettered;
        {
            let mut dead_letter = self.dead_letter.lock().await;
            dead_letter.entries.push(DeadLetter {
                operation: op,
                reason: reason.clone(),
                dead_lettered_at: Utc::now(),
            });
            if let Err(e) = dead_letter.persist().await {
                dead_letter.entries.pop();
                return Err(e);
            }
        }

        partition.ops.remove(pos);
        self.write_index().insert(id.clone(), Location::DeadLetter);
        if let Err(e) = partition.persist().await {
            warn!("{} dead-lettered but its partition was not rewritten: {}", id, e);
        }
        self.audit
            .lock()
            .await
            .append(AuditRecord::new(id.clone(), AuditOutcome::DeadLettered, Some(reason.clone())))
            .await?;
        warn!("Dead-lettered {}: {}", id, reason);
        Ok(())
    }

    fn live_priority(&self, id: &OperationId) -> Result<Priority> {
        match self.read_index().get(id) {
            Some(Location::Live(priority)) => Ok(*priority),
            Some(Location::DeadLetter) => Err(Error::InvalidInput(format!(
                "Operation {} is dead-lettered",
                id
            ))),
            None => Err(Error::NotFound(format!("Operation not found: {}", id))),
        }
    }

    fn reserve(&self, id: &OperationId, location: Location) -> Result<()> {
        let mut index = self.write_index();
        if index.contains_key(id) {
            return Err(Error::AlreadyExists(format!("Operation {} already queued", id)));
        }
        index.insert(id.clone(), location);
        Ok(())
    }

    fn unindex(&self, id: &OperationId) {
        self.write_index().remove(id);
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<OperationId, Location>> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<OperationId, Location>> {
        self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A dependency is settled once committed. An id the store no longer knows
/// at all is one whose commit aged out of the audit trail.
fn dependency_settled(
    audit: &AuditLog,
    index: &HashMap<OperationId, Location>,
    dep: &OperationId,
) -> bool {
    audit.is_committed(dep) || !index.contains_key(dep)
}

fn ready_ops<F, D>(partition: &Partition, n: usize, filter: &F, settled: D) -> Vec<usize>
where
    F: Fn(&Operation) -> bool,
    D: Fn(&OperationId) -> bool,
{
    partition
        .ops
        .iter()
        .enumerate()
        .filter(|(_, op)| {
            matches!(op.status, OperationStatus::Queued | OperationStatus::RetryPending)
        })
        .filter(|(_, op)| op.dependencies.iter().all(&settled))
        .filter(|(_, op)| filter(op))
        .map(|(i, _)| i)
        .take(n)
        .collect()
}

fn take(partition: &mut Partition, id: &OperationId) -> Result<Operation> {
    let pos = partition
        .position(id)
        .ok_or_else(|| Error::NotFound(format!("Operation not found: {}", id)))?;
    partition
        .ops
        .remove(pos)
        .ok_or_else(|| Error::NotFound(format!("Operation not found: {}", id)))
}
