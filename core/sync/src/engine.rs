//! Queue processing engine that ties the components together.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use driftsync_common::{
    EntityKey, Error, Operation, OperationId, OperationKind, OperationStatus, Priority, Result,
    RetryDecision, TimestampedValue,
};
use driftsync_storage::{
    read_json_or_quarantine, write_json_atomic, BackupInfo, BackupManager, DeadLetter,
    OperationStore, StoreReceipt, StoreSnapshot, StoreStats,
};

use crate::batch::{BatchProcessor, BatchResult, DispatchMode, RetryReason};
use crate::classifier::PriorityClassifier;
use crate::config::EngineConfig;
use crate::dependency::{self, DependencyState};
use crate::events::{EngineEvent, EventBus};
use crate::manager::{MergeReport, ReplicaManager};
use crate::network::{ConnectivityState, NetworkQuality, NetworkQualityMonitor};
use crate::remote::RemoteCollaborator;
use crate::replica::{ConflictingValue, ReplicaMap, ReplicaSnapshot};
use crate::scheduler::{SchedulerHandle, Tier, TierState, TickOutcome};
use crate::validator::{ConsistencyValidator, QuarantinedEntity};

/// Caller overrides for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Requested tier; can raise but never lower the classified priority.
    pub priority: Option<Priority>,
    /// Extra dependencies, appended to the operation's own.
    pub dependencies: Option<Vec<OperationId>>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<OperationId>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }
}

/// Answer to an enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueResult {
    pub success: bool,
    pub operation_id: OperationId,
    pub priority: Option<Priority>,
    pub queue_position: Option<usize>,
    pub error: Option<String>,
}

impl QueueResult {
    fn accepted(receipt: StoreReceipt) -> Self {
        Self {
            success: true,
            operation_id: receipt.operation_id,
            priority: Some(receipt.priority),
            queue_position: Some(receipt.position),
            error: None,
        }
    }

    fn rejected(operation_id: OperationId, error: &Error) -> Self {
        Self {
            success: false,
            operation_id,
            priority: None,
            queue_position: None,
            error: Some(error.to_string()),
        }
    }
}

/// Everything a backup captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub store: StoreSnapshot,
    pub replica: ReplicaSnapshot,
    pub quarantined: Vec<QuarantinedEntity>,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub store: StoreStats,
    pub connectivity: ConnectivityState,
    pub quality: Option<NetworkQuality>,
    pub tiers: BTreeMap<Priority, TierState>,
    pub open_conflicts: usize,
    pub quarantined: usize,
}

/// What a `drain_all` pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Committed ids in commit order.
    pub committed: Vec<OperationId>,
    pub retryable: usize,
    pub failed: usize,
    pub batches: usize,
}

impl DrainReport {
    fn absorb(&mut self, result: &BatchResult) {
        self.committed
            .extend(result.committed.iter().map(|c| c.operation_id.clone()));
        self.retryable += result.retryable.len();
        self.failed += result.failed.len();
        self.batches += 1;
    }
}

/// The offline-first sync engine.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<OperationStore>,
    monitor: Arc<NetworkQualityMonitor>,
    validator: Arc<ConsistencyValidator>,
    replica: Arc<ReplicaManager>,
    processor: BatchProcessor,
    classifier: PriorityClassifier,
    backups: BackupManager,
    events: EventBus,
    tiers: BTreeMap<Priority, Mutex<Tier>>,
    wakers: BTreeMap<Priority, Arc<Notify>>,
    scheduler: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

impl SyncEngine {
    /// Open the engine's persisted state under `config.data_dir`.
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteCollaborator>,
        monitor: Arc<NetworkQualityMonitor>,
        validator: Arc<ConsistencyValidator>,
    ) -> Result<Self> {
        let device_id = config.device()?;
        let events = EventBus::new(config.event_capacity);

        let store = Arc::new(OperationStore::open(config.queue_dir(), config.store.clone()).await?);
        let replica = Arc::new(
            ReplicaManager::open(
                config.replica_path(),
                device_id.clone(),
                validator.clone(),
                events.clone(),
            )
            .await?
            .with_last_writer_wins(config.last_writer_wins_non_safety),
        );
        if let Some(quarantined) =
            read_json_or_quarantine::<Vec<QuarantinedEntity>>(&config.quarantine_path()).await?
        {
            validator.restore_quarantine(quarantined);
        }
        let backups = BackupManager::new(config.backup_dir(), config.max_backups).await?;
        let processor = BatchProcessor::new(remote, replica.clone(), config.batch.clone());

        let tiers = Priority::DRAIN_ORDER
            .iter()
            .map(|p| (*p, Mutex::new(Tier::default())))
            .collect();
        let wakers = Priority::DRAIN_ORDER
            .iter()
            .map(|p| (*p, Arc::new(Notify::new())))
            .collect();

        info!(
            "Sync engine opened for {} at {}",
            device_id,
            config.data_dir.display()
        );

        Ok(Self {
            config,
            store,
            monitor,
            validator,
            replica,
            processor,
            classifier: PriorityClassifier::new(),
            backups,
            events,
            tiers,
            wakers,
            scheduler: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<OperationStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<NetworkQualityMonitor> {
        &self.monitor
    }

    pub fn validator(&self) -> &Arc<ConsistencyValidator> {
        &self.validator
    }

    pub fn replica(&self) -> &Arc<ReplicaManager> {
        &self.replica
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Accept a mutation.
    ///
    /// Validation failures (including duplicate ids and dependency errors)
    /// come back as an unsuccessful [`QueueResult`]; only a failed durable
    /// write is an `Err`.
    pub async fn enqueue(&self, op: Operation, options: EnqueueOptions) -> Result<QueueResult> {
        let id = op.id.clone();
        match self.try_enqueue(op, options).await {
            Ok(receipt) => Ok(QueueResult::accepted(receipt)),
            Err(e @ (Error::Validation(_) | Error::SafetyCritical(_) | Error::AlreadyExists(_))) => {
                warn!("Rejected {}: {}", id, e);
                Ok(QueueResult::rejected(id, &e))
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`enqueue`](Self::enqueue) but returning every failure as an
    /// error.
    pub async fn try_enqueue(&self, op: Operation, options: EnqueueOptions) -> Result<StoreReceipt> {
        let op = self.prepare(op, options);
        let states = self.dependency_states(std::slice::from_ref(&op)).await;
        dependency::validate_new(std::slice::from_ref(&op), |id| {
            states.get(id).copied().unwrap_or(DependencyState::Unknown)
        })?;
        self.check_admissible(&op).await?;
        self.admit(op).await
    }

    /// Accept a group of mutations whose dependencies may point at each
    /// other.
    ///
    /// The whole group is validated (including cycle detection) before
    /// anything is written; operations are then appended in dependency
    /// order. A durable-write failure part way leaves the earlier
    /// operations queued.
    pub async fn enqueue_all(&self, ops: Vec<(Operation, EnqueueOptions)>) -> Result<Vec<StoreReceipt>> {
        let ops: Vec<Operation> = ops
            .into_iter()
            .map(|(op, options)| self.prepare(op, options))
            .collect();

        let states = self.dependency_states(&ops).await;
        dependency::validate_new(&ops, |id| {
            states.get(id).copied().unwrap_or(DependencyState::Unknown)
        })?;
        for op in &ops {
            self.check_admissible(op).await?;
        }

        let order = dependency::topological_order(&ops).map_err(|cycle| {
            Error::Validation(format!("Dependency cycle among {} operations", cycle.len()))
        })?;
        let mut slots: Vec<Option<Operation>> = ops.into_iter().map(Some).collect();
        let mut receipts = Vec::with_capacity(slots.len());
        for i in order {
            if let Some(op) = slots[i].take() {
                receipts.push(self.admit(op).await?);
            }
        }
        Ok(receipts)
    }

    /// Run one scheduling step for a tier.
    pub async fn tick(&self, priority: Priority) -> Result<TickOutcome> {
        {
            let tier = self.tier(priority);
            if tier.state == TierState::Draining {
                return Ok(TickOutcome::Busy);
            }
            if tier.backoff.is_waiting(Instant::now()) {
                return Ok(TickOutcome::BackingOff);
            }
        }

        let connectivity = self.monitor.current_state();
        let strategy = self.monitor.recommended_strategy();
        if !strategy.allows(priority) {
            return Ok(TickOutcome::NotAllowed(connectivity));
        }
        let mode = if connectivity.is_online() {
            DispatchMode::Remote
        } else {
            DispatchMode::LocalOnly
        };

        if !self.begin_drain(priority) {
            return Ok(TickOutcome::Busy);
        }

        let validator = self.validator.clone();
        let batch = match self
            .store
            .checkout(priority, strategy.batch_size, |op| {
                !validator.is_quarantined(&op.entity)
            })
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                self.set_tier_state(priority, TierState::Idle);
                return Err(e);
            }
        };
        if batch.is_empty() {
            self.set_tier_state(priority, TierState::Idle);
            return Ok(TickOutcome::Empty);
        }

        debug!("Tier {} draining {} operations ({:?})", priority, batch.len(), mode);
        let result = self.processor.process(batch.clone(), mode).await;
        let applied = self.apply_outcomes(&batch, &result).await;

        if result.had_network_failure() {
            let delay = self
                .tier(priority)
                .backoff
                .record_failure(&self.config.backoff, strategy.retry_delay);
            warn!("Tier {} backing off for {:?}", priority, delay);
            self.set_tier_state(priority, TierState::Backoff);
        } else {
            self.tier(priority).backoff.reset();
            self.set_tier_state(priority, TierState::Idle);
        }

        self.persist_quarantine().await?;
        applied?;
        Ok(TickOutcome::Processed(result))
    }

    /// Tick every tier from CRITICAL down to LOW, draining each while it
    /// makes progress, within the configured batch budget.
    pub async fn drain_all(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let budget = self.config.scheduler.max_batches_per_drain;

        'tiers: for priority in Priority::DRAIN_ORDER {
            loop {
                if report.batches >= budget {
                    debug!("Drain budget of {} batches spent", budget);
                    break 'tiers;
                }
                let outcome = self.tick(priority).await?;
                if let TickOutcome::Processed(result) = &outcome {
                    report.absorb(result);
                }
                if !outcome.made_progress() {
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Spawn the scheduling loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return Err(Error::InvalidInput("Engine is already running".to_string()));
        }
        *scheduler = Some(SchedulerHandle::spawn(self.clone()));
        Ok(())
    }

    /// Stop the loops (letting in-flight batches finish) and flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
        }
        self.persist_quarantine().await?;
        self.store.shutdown().await?;
        info!("Sync engine shut down");
        Ok(())
    }

    /// Merge replica values pulled from elsewhere.
    pub async fn merge_remote(&self, remote: ReplicaMap) -> Result<MergeReport> {
        let report = self.replica.merge_remote(&remote, false).await?;
        self.persist_quarantine().await?;
        Ok(report)
    }

    /// Open conflicts.
    pub async fn conflicts(&self) -> Vec<ConflictingValue> {
        self.replica.conflicts().await
    }

    /// Settle a conflict with an operator-chosen value.
    pub async fn resolve_conflict(&self, key: &EntityKey, value: Value) -> Result<TimestampedValue<Value>> {
        self.replica.resolve(key, value).await
    }

    /// Seal the current state into an emergency backup.
    pub async fn backup(&self, reason: &str) -> Result<BackupInfo> {
        let snapshot = EngineSnapshot {
            store: self.store.snapshot().await,
            replica: self.replica.snapshot().await,
            quarantined: self.validator.quarantined(),
        };
        let info = self.backups.create(reason, &snapshot).await?;
        self.events.emit(EngineEvent::BackupCreated {
            backup_id: info.id.clone(),
            reason: info.reason.clone(),
        });
        Ok(info)
    }

    /// Available backups, oldest first.
    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.backups.list().await
    }

    /// Replace the current state with a backup.
    ///
    /// The backup is verified before anything changes, and the current state
    /// is itself backed up first. Returns the safety backup.
    pub async fn restore(&self, backup_id: &str) -> Result<BackupInfo> {
        if self.tiers.keys().any(|p| self.tier(*p).state == TierState::Draining) {
            return Err(Error::InvalidInput(
                "Cannot restore while a batch is in flight".to_string(),
            ));
        }

        let snapshot: EngineSnapshot = self.backups.load(backup_id).await?.open()?;
        let safety = self
            .backup(&format!("before restoring backup {}", backup_id))
            .await?;

        self.store.replace_with(snapshot.store).await?;
        self.replica.restore(snapshot.replica).await?;
        self.validator.restore_quarantine(snapshot.quarantined);
        self.persist_quarantine().await?;

        info!("Restored backup {}", backup_id);
        self.wake_all();
        Ok(safety)
    }

    /// Drop every dead letter after backing them up.
    pub async fn purge_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.backup("before purging dead letters").await?;
        self.store.purge_dead_letters().await
    }

    /// Give a dead-lettered operation a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &OperationId) -> Result<StoreReceipt> {
        let receipt = self.store.requeue_dead_letter(id).await?;
        self.wake(receipt.priority);
        Ok(receipt)
    }

    /// Return a quarantined entity to automatic processing.
    pub async fn release_quarantine(&self, entity: &EntityKey) -> Result<bool> {
        let released = self.validator.release(entity);
        if released {
            info!("Released {} from quarantine", entity);
            self.persist_quarantine().await?;
            self.wake_all();
        }
        Ok(released)
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            store: self.store.stats().await,
            connectivity: self.monitor.current_state(),
            quality: self.monitor.current_quality(),
            tiers: self
                .tiers
                .keys()
                .map(|p| (*p, self.tier(*p).state))
                .collect(),
            open_conflicts: self.replica.conflicts().await.len(),
            quarantined: self.validator.quarantined().len(),
        }
    }

    pub(crate) fn waker(&self, priority: Priority) -> Arc<Notify> {
        self.wakers[&priority].clone()
    }

    /// Ask a tier loop to look for work now.
    pub fn wake(&self, priority: Priority) {
        self.wakers[&priority].notify_one();
    }

    pub fn wake_all(&self) {
        for priority in Priority::DRAIN_ORDER {
            self.wake(priority);
        }
    }

    fn prepare(&self, mut op: Operation, options: EnqueueOptions) -> Operation {
        let classification = self.classifier.resolve(&op, options.priority);
        op.priority = classification.priority;
        op.safety_critical = classification.safety_critical
            || op.safety_critical
            || self.validator.is_safety_entity(&op.entity.entity_type);
        if let Some(extra) = options.dependencies {
            for dep in extra {
                if !op.dependencies.contains(&dep) {
                    op.dependencies.push(dep);
                }
            }
        }
        op.status = OperationStatus::Pending;
        op
    }

    async fn dependency_states(&self, ops: &[Operation]) -> HashMap<OperationId, DependencyState> {
        let mut states = HashMap::new();
        for dep in ops.iter().flat_map(|op| op.dependencies.iter()) {
            if states.contains_key(dep) {
                continue;
            }
            let state = if self.store.is_dead_lettered(dep) {
                DependencyState::DeadLettered
            } else if self.store.contains(dep) {
                DependencyState::Pending
            } else if self.store.is_committed(dep).await {
                DependencyState::Committed
            } else {
                DependencyState::Unknown
            };
            states.insert(dep.clone(), state);
        }
        states
    }

    async fn check_admissible(&self, op: &Operation) -> Result<()> {
        if self.store.contains(&op.id) || self.store.is_committed(&op.id).await {
            return Err(Error::AlreadyExists(format!(
                "Operation {} is already known",
                op.id
            )));
        }
        for issue in self.validator.check_operation(op)? {
            self.events.emit(EngineEvent::ConsistencyIssue(issue));
        }
        Ok(())
    }

    /// Write the mutation into the local replica and append it to its tier.
    async fn admit(&self, mut op: Operation) -> Result<StoreReceipt> {
        op.status = OperationStatus::Validated;

        let value = match op.kind {
            OperationKind::Delete => Value::Null,
            _ => op.payload.clone(),
        };
        let entity = op.entity.clone();
        let previous = self.replica.get(&entity).await;
        op.vector_clock = self.replica.write_local(entity.clone(), value).await?;

        let receipt = match self.store.append(op).await {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Err(rollback) = self.replica.revert_local(&entity, previous).await {
                    error!("Could not roll back local write to {}: {}", entity, rollback);
                }
                return Err(e);
            }
        };
        debug!(
            "Queued {} in {} at position {}",
            receipt.operation_id, receipt.priority, receipt.position
        );
        if receipt.priority == Priority::Critical {
            self.wake(Priority::Critical);
        }
        Ok(receipt)
    }

    async fn apply_outcomes(&self, batch: &[Operation], result: &BatchResult) -> Result<()> {
        let mut first_error = None;
        let mut settled = std::collections::HashSet::new();
        // Dependents are cascaded once every item of the batch is settled.
        let mut parked = Vec::new();

        for item in &result.committed {
            settled.insert(&item.operation_id);
            match self.store.commit(&item.operation_id, item.local_only).await {
                Ok(_) => self.events.emit(EngineEvent::OperationCommitted {
                    operation_id: item.operation_id.clone(),
                    local_only: item.local_only,
                }),
                Err(e) => {
                    error!("Failed to record commit of {}: {}", item.operation_id, e);
                    if let Err(release) = self.store.release(&item.operation_id).await {
                        warn!("Could not return {} to the queue: {}", item.operation_id, release);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        for item in &result.retryable {
            settled.insert(&item.operation_id);
            let outcome = if item.reason.consumes_retry() {
                let message = match &item.reason {
                    RetryReason::Network(message) => message.as_str(),
                    _ => "network failure",
                };
                match self.store.record_failure(&item.operation_id, message).await {
                    Ok(RetryDecision::Exhausted) => {
                        self.events.emit(EngineEvent::OperationDeadLettered {
                            operation_id: item.operation_id.clone(),
                            reason: format!("Retries exhausted: {}", message),
                        });
                        parked.push(&item.operation_id);
                        Ok(())
                    }
                    Ok(RetryDecision::Retry { .. }) => self.store.release(&item.operation_id).await,
                    Err(e) => Err(e),
                }
            } else {
                self.store.release(&item.operation_id).await
            };
            if let Err(e) = outcome {
                error!("Failed to requeue {}: {}", item.operation_id, e);
                first_error.get_or_insert(e);
            }
        }

        for item in &result.failed {
            settled.insert(&item.operation_id);
            let reason = format!("{}: {}", item.kind.as_str(), item.error);
            match self.store.move_to_dead_letter(&item.operation_id, reason.clone()).await {
                Ok(()) => {
                    self.events.emit(EngineEvent::OperationDeadLettered {
                        operation_id: item.operation_id.clone(),
                        reason,
                    });
                    parked.push(&item.operation_id);
                }
                Err(e) => {
                    error!("Failed to dead-letter {}: {}", item.operation_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for op in batch.iter().filter(|op| !settled.contains(&op.id)) {
            warn!("No outcome for {}, returning it to the queue", op.id);
            if let Err(e) = self.store.release(&op.id).await {
                first_error.get_or_insert(e);
            }
        }

        for root in parked {
            if let Err(e) = self.cascade_dead_letter(root).await {
                error!("Failed to dead-letter dependents of {}: {}", root, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dead-letter what can no longer run because `root` was dead-lettered.
    async fn cascade_dead_letter(&self, root: &OperationId) -> Result<()> {
        for id in self.store.dead_letter_dependents(root).await? {
            self.events.emit(EngineEvent::OperationDeadLettered {
                reason: format!("Dependency {} was dead-lettered", root),
                operation_id: id,
            });
        }
        Ok(())
    }

    fn begin_drain(&self, priority: Priority) -> bool {
        let from = {
            let mut tier = self.tier(priority);
            if tier.state == TierState::Draining {
                return false;
            }
            let from = tier.state;
            tier.state = TierState::Draining;
            from
        };
        self.events.emit(EngineEvent::TierStateChanged {
            priority,
            from,
            to: TierState::Draining,
        });
        true
    }

    fn set_tier_state(&self, priority: Priority, to: TierState) {
        let from = std::mem::replace(&mut self.tier(priority).state, to);
        if from != to {
            self.events.emit(EngineEvent::TierStateChanged { priority, from, to });
        }
    }

    fn tier(&self, priority: Priority) -> MutexGuard<'_, Tier> {
        self.tiers[&priority]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist_quarantine(&self) -> Result<()> {
        write_json_atomic(&self.config.quarantine_path(), &self.validator.quarantined()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::memory::{MemoryRemote, ScriptedFailure};
    use crate::network::{failed_measurement, online_measurement, NetworkConfig, StaticProbe};
    use crate::scheduler::SchedulerConfig;
    use driftsync_common::{DeviceId, OperationFlags};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        engine: Arc<SyncEngine>,
        remote: Arc<MemoryRemote>,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::new(dir.path())
            .with_device_id("device-a")
            .with_network(NetworkConfig {
                window_size: 1,
                ..Default::default()
            })
            .with_backoff(
                BackoffConfig::new(Duration::ZERO)
                    .with_jitter(false)
                    .with_strategy_floor(false),
            )
            .with_scheduler(SchedulerConfig {
                tick_interval: Duration::from_millis(20),
                sample_interval: None,
                ..Default::default()
            });
        let remote = Arc::new(MemoryRemote::new());
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::new(StaticProbe::offline()),
            config.network.clone(),
        ));
        let engine = SyncEngine::open(config, remote.clone(), monitor, Arc::new(ConsistencyValidator::new()))
            .await
            .unwrap();
        Harness {
            _dir: dir,
            engine: Arc::new(engine),
            remote,
        }
    }

    fn go_online(engine: &SyncEngine) {
        let config = engine.config().network.clone();
        engine
            .monitor()
            .record(online_measurement(Duration::from_millis(50), &config));
    }

    fn op(id: &str, flags: OperationFlags) -> Operation {
        Operation::new(
            OperationKind::Update,
            EntityKey::new("note", id),
            json!({"text": id}),
            DeviceId::new("device-a").unwrap(),
        )
        .with_id(OperationId::new(id).unwrap())
        .with_flags(flags)
    }

    #[tokio::test]
    async fn test_enqueue_classifies_and_stamps_clock() {
        let h = harness().await;
        let result = h
            .engine
            .enqueue(
                op("n1", OperationFlags {
                    time_sensitive: true,
                    ..Default::default()
                }),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.priority, Some(Priority::Medium));
        assert_eq!(result.queue_position, Some(0));

        let stored = h.engine.store().peek(Priority::Medium, 1).await.unwrap();
        assert_eq!(stored[0].vector_clock.get(&DeviceId::new("device-a").unwrap()), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_dangling_are_unsuccessful_results() {
        let h = harness().await;
        let first = h.engine.enqueue(op("dup", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        assert!(first.success);

        let again = h.engine.enqueue(op("dup", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        assert!(!again.success);
        assert!(again.error.is_some());

        let dangling = h
            .engine
            .enqueue(
                op("child", OperationFlags::default()),
                EnqueueOptions::default().with_dependencies(vec![OperationId::new("ghost").unwrap()]),
            )
            .await
            .unwrap();
        assert!(!dangling.success);
    }

    #[tokio::test]
    async fn test_requested_priority_cannot_downgrade() {
        let h = harness().await;
        let emergency = op("sos", OperationFlags {
            emergency: true,
            ..Default::default()
        });
        let result = h
            .engine
            .enqueue(emergency, EnqueueOptions::default().with_priority(Priority::Low))
            .await
            .unwrap();
        assert_eq!(result.priority, Some(Priority::Critical));
    }

    #[tokio::test]
    async fn test_enqueue_all_rejects_cycles_without_writing() {
        let h = harness().await;
        let a = op("a", OperationFlags::default()).with_dependencies(vec![OperationId::new("b").unwrap()]);
        let b = op("b", OperationFlags::default()).with_dependencies(vec![OperationId::new("a").unwrap()]);
        let err = h
            .engine
            .enqueue_all(vec![(a, EnqueueOptions::default()), (b, EnqueueOptions::default())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.engine.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_enqueue_all_orders_group() {
        let h = harness().await;
        let child = op("child", OperationFlags::default()).with_dependencies(vec![OperationId::new("parent").unwrap()]);
        let parent = op("parent", OperationFlags::default());
        let receipts = h
            .engine
            .enqueue_all(vec![(child, EnqueueOptions::default()), (parent, EnqueueOptions::default())])
            .await
            .unwrap();
        assert_eq!(receipts[0].operation_id.as_str(), "parent");

        go_online(&h.engine);
        let report = h.engine.drain_all().await.unwrap();
        let ids: Vec<&str> = report.committed.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["parent", "child"]);
    }

    #[tokio::test]
    async fn test_tick_respects_connectivity() {
        let h = harness().await;
        h.engine.enqueue(op("low", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();

        assert!(matches!(
            h.engine.tick(Priority::Low).await.unwrap(),
            TickOutcome::NotAllowed(ConnectivityState::Unknown)
        ));

        h.engine.monitor().record(failed_measurement());
        assert!(matches!(
            h.engine.tick(Priority::Low).await.unwrap(),
            TickOutcome::NotAllowed(ConnectivityState::Offline)
        ));

        go_online(&h.engine);
        match h.engine.tick(Priority::Low).await.unwrap() {
            TickOutcome::Processed(result) => assert_eq!(result.committed.len(), 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(h.engine.tick(Priority::Low).await.unwrap(), TickOutcome::Empty));
    }

    #[tokio::test]
    async fn test_critical_local_only_while_offline() {
        let h = harness().await;
        let terminal = op("alarm", OperationFlags {
            emergency: true,
            local_terminal: true,
            ..Default::default()
        });
        let pending = op("report", OperationFlags {
            emergency: true,
            ..Default::default()
        });
        h.engine.enqueue(terminal, EnqueueOptions::default()).await.unwrap();
        h.engine.enqueue(pending, EnqueueOptions::default()).await.unwrap();

        let report = h.engine.drain_all().await.unwrap();
        assert_eq!(report.committed, vec![OperationId::new("alarm").unwrap()]);
        assert!(h.remote.submitted().is_empty());

        let left = h.engine.store().peek(Priority::Critical, 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_network_failure_backs_off_tier() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::new(dir.path())
            .with_device_id("device-a")
            .with_network(NetworkConfig {
                window_size: 1,
                ..Default::default()
            })
            .with_backoff(BackoffConfig::new(Duration::from_secs(60)).with_jitter(false))
            .with_scheduler(SchedulerConfig {
                sample_interval: None,
                ..Default::default()
            });
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(1);
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::new(StaticProbe::offline()),
            config.network.clone(),
        ));
        let engine = SyncEngine::open(config, remote, monitor, Arc::new(ConsistencyValidator::new()))
            .await
            .unwrap();

        engine.enqueue(op("n", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        go_online(&engine);

        assert!(matches!(engine.tick(Priority::Low).await.unwrap(), TickOutcome::Processed(_)));
        assert!(matches!(engine.tick(Priority::Low).await.unwrap(), TickOutcome::BackingOff));
        assert_eq!(engine.stats().await.tiers[&Priority::Low], TierState::Backoff);

        let queued = engine.store().peek(Priority::Low, 1).await.unwrap();
        assert_eq!(queued[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_strategy_retry_delay_bounds_backoff() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::new(dir.path())
            .with_device_id("device-a")
            .with_network(NetworkConfig {
                window_size: 1,
                ..Default::default()
            })
            .with_backoff(BackoffConfig::new(Duration::ZERO).with_jitter(false))
            .with_scheduler(SchedulerConfig {
                sample_interval: None,
                ..Default::default()
            });
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(1);
        let monitor = Arc::new(NetworkQualityMonitor::new(
            Arc::new(StaticProbe::offline()),
            config.network.clone(),
        ));
        let engine = SyncEngine::open(config, remote, monitor, Arc::new(ConsistencyValidator::new()))
            .await
            .unwrap();

        engine.enqueue(op("n", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        go_online(&engine);
        assert_eq!(engine.monitor().recommended_strategy().retry_delay, Duration::from_secs(1));

        assert!(matches!(engine.tick(Priority::Low).await.unwrap(), TickOutcome::Processed(_)));
        assert!(matches!(engine.tick(Priority::Low).await.unwrap(), TickOutcome::BackingOff));
    }

    #[tokio::test]
    async fn test_rejection_dead_letters_dependents() {
        let h = harness().await;
        let mut events = h.engine.subscribe();
        h.engine.enqueue(op("parent", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        h.engine
            .enqueue(
                op("child", OperationFlags::default()),
                EnqueueOptions::default().with_dependencies(vec![OperationId::new("parent").unwrap()]),
            )
            .await
            .unwrap();

        h.remote.script(ScriptedFailure::Reject("forbidden".to_string()));
        go_online(&h.engine);
        h.engine.drain_all().await.unwrap();

        let store = h.engine.store();
        assert!(store.is_dead_lettered(&OperationId::new("parent").unwrap()));
        assert!(store.is_dead_lettered(&OperationId::new("child").unwrap()));
        assert_eq!(store.len(Priority::Low).await, 0);

        let mut dead = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::OperationDeadLettered { operation_id, .. } = event {
                dead.push(operation_id.to_string());
            }
        }
        assert_eq!(dead, vec!["parent", "child"]);
        assert_eq!(h.remote.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_append_rolls_back_replica() {
        let h = harness().await;
        h.engine.enqueue(op("n1", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        h.engine.store().shutdown().await.unwrap();

        let key = EntityKey::new("note", "n1");
        let edit = Operation::new(
            OperationKind::Update,
            key.clone(),
            json!({"text": "edited"}),
            DeviceId::new("device-a").unwrap(),
        )
        .with_id(OperationId::new("edit").unwrap());
        assert!(h.engine.enqueue(edit, EnqueueOptions::default()).await.is_err());

        assert_eq!(h.engine.replica().get(&key).await.unwrap().value, json!({"text": "n1"}));

        let fresh = EntityKey::new("note", "n2");
        assert!(h
            .engine
            .enqueue(op("n2", OperationFlags::default()), EnqueueOptions::default())
            .await
            .is_err());
        assert!(h.engine.replica().get(&fresh).await.is_none());
    }

    #[tokio::test]
    async fn test_purge_takes_backup_first() {
        let h = harness().await;
        h.engine.enqueue(op("x", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();
        h.engine
            .store()
            .move_to_dead_letter(&OperationId::new("x").unwrap(), "operator test")
            .await
            .unwrap();

        let purged = h.engine.purge_dead_letters().await.unwrap();
        assert_eq!(purged.len(), 1);
        let backups = h.engine.backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].reason, "before purging dead letters");
    }

    #[tokio::test]
    async fn test_scheduler_drains_after_reconnect() {
        let h = harness().await;
        h.engine.enqueue(op("bg", OperationFlags::default()), EnqueueOptions::default()).await.unwrap();

        h.engine.start().await.unwrap();
        assert!(h.engine.start().await.is_err());
        go_online(&h.engine);

        let mut committed = false;
        for _ in 0..100 {
            if h.engine.store().is_committed(&OperationId::new("bg").unwrap()).await {
                committed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.engine.shutdown().await.unwrap();
        assert!(committed);
    }
}
