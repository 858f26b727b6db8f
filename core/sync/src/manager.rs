//! Replica manager: the local replica plus merge-time policy.
//!
//! Wraps [`ReplicaState`] with persistence, conflict auto-resolution and the
//! post-merge consistency check.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use driftsync_common::{DeviceId, EntityKey, Result, TimestampedValue, VectorClock};
use driftsync_storage::{read_json_or_quarantine, write_json_atomic};

use crate::events::{EngineEvent, EventBus};
use crate::replica::{ConflictingValue, ReplicaMap, ReplicaSnapshot, ReplicaState};
use crate::validator::{ConsistencyIssue, ConsistencyValidator, Entity, PostMergeVerdict};

/// What a merge did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Keys whose local value changed.
    pub updated: Vec<EntityKey>,
    /// Conflicts left open for an operator.
    pub conflicts: Vec<ConflictingValue>,
    /// Conflicts settled by a resolver or last-writer-wins.
    pub auto_resolved: Vec<EntityKey>,
    /// Entities that failed the post-merge check and are quarantined.
    pub quarantined: Vec<EntityKey>,
    /// Issues found on merged state, reconciled or accepted.
    pub issues: Vec<ConsistencyIssue>,
}

impl MergeReport {
    pub fn is_quarantined(&self, key: &EntityKey) -> bool {
        self.quarantined.contains(key)
    }
}

/// Owner of the local replica.
pub struct ReplicaManager {
    state: Mutex<ReplicaState>,
    path: Option<PathBuf>,
    validator: Arc<ConsistencyValidator>,
    events: EventBus,
    last_writer_wins_non_safety: bool,
}

impl ReplicaManager {
    /// Load the replica persisted at `path`, or start empty.
    pub async fn open(
        path: impl AsRef<Path>,
        device_id: DeviceId,
        validator: Arc<ConsistencyValidator>,
        events: EventBus,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match read_json_or_quarantine::<ReplicaSnapshot>(&path).await? {
            Some(snapshot) if snapshot.device_id == device_id => {
                debug!("Loaded replica with {} values", snapshot.values.len());
                ReplicaState::from_snapshot(snapshot)
            }
            Some(snapshot) => {
                info!(
                    "Replica belongs to {}, starting fresh for {}",
                    snapshot.device_id, device_id
                );
                ReplicaState::new(device_id)
            }
            None => ReplicaState::new(device_id),
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
            validator,
            events,
            last_writer_wins_non_safety: false,
        })
    }

    /// Replica that is never persisted.
    pub fn in_memory(device_id: DeviceId, validator: Arc<ConsistencyValidator>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(ReplicaState::new(device_id)),
            path: None,
            validator,
            events,
            last_writer_wins_non_safety: false,
        }
    }

    /// Settle conflicts on non-safety entity types by last-writer-wins.
    pub fn with_last_writer_wins(mut self, enabled: bool) -> Self {
        self.last_writer_wins_non_safety = enabled;
        self
    }

    pub async fn device_id(&self) -> DeviceId {
        self.state.lock().await.device_id().clone()
    }

    pub async fn get(&self, key: &EntityKey) -> Option<TimestampedValue<Value>> {
        self.state.lock().await.get(key).cloned()
    }

    pub async fn values(&self) -> ReplicaMap {
        self.state.lock().await.values().clone()
    }

    /// Record a local write and return the clock it was stamped with.
    pub async fn write_local(&self, key: EntityKey, value: Value) -> Result<VectorClock> {
        let mut state = self.state.lock().await;
        let stamped = state.write(key, value);
        self.persist(&state).await?;
        Ok(stamped.vector_clock)
    }

    /// Merge remote values, settle what policy allows and validate the
    /// result. `safety_critical` forces safety handling for every key.
    pub async fn merge_remote(&self, remote: &ReplicaMap, safety_critical: bool) -> Result<MergeReport> {
        let mut state = self.state.lock().await;
        let before = state.values().clone();
        let mut report = MergeReport::default();

        for conflict in state.apply_remote(remote) {
            self.events.emit(EngineEvent::ConflictDetected {
                entity: conflict.key.clone(),
            });
            if self.try_auto_resolve(&mut state, &conflict)? {
                report.auto_resolved.push(conflict.key.clone());
                self.events.emit(EngineEvent::ConflictResolved {
                    entity: conflict.key.clone(),
                });
            } else {
                report.conflicts.push(conflict);
            }
        }

        for key in remote.keys() {
            let Some(current) = state.get(key) else {
                continue;
            };
            if before.get(key) != Some(current) {
                report.updated.push(key.clone());
            }
            if current.value.is_null() {
                continue;
            }

            let value = current.value.clone();
            self.post_check(&mut state, key, value, safety_critical, &mut report);
        }

        self.persist(&state).await?;
        Ok(report)
    }

    /// Validate the local value of `key` as the settled state of an
    /// operation the remote accepted without returning its own copy.
    pub async fn verify_local(&self, key: &EntityKey, safety_critical: bool) -> Result<MergeReport> {
        let mut state = self.state.lock().await;
        let mut report = MergeReport::default();
        let Some(current) = state.get(key) else {
            return Ok(report);
        };
        if current.value.is_null() {
            return Ok(report);
        }

        let value = current.value.clone();
        let before = current.clone();
        self.post_check(&mut state, key, value, safety_critical, &mut report);
        if state.get(key) != Some(&before) {
            report.updated.push(key.clone());
            self.persist(&state).await?;
        }
        Ok(report)
    }

    /// Put back what `key` held before a local write that was never queued.
    /// The replica clock keeps its increment.
    pub async fn revert_local(&self, key: &EntityKey, previous: Option<TimestampedValue<Value>>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.restore_value(key.clone(), previous);
        self.persist(&state).await
    }

    /// Open conflicts.
    pub async fn conflicts(&self) -> Vec<ConflictingValue> {
        self.state.lock().await.conflicts()
    }

    /// Settle a conflict with an operator-chosen value.
    pub async fn resolve(&self, key: &EntityKey, value: Value) -> Result<TimestampedValue<Value>> {
        let mut state = self.state.lock().await;
        let resolved = state.resolve(key, value)?;
        self.persist(&state).await?;
        self.events.emit(EngineEvent::ConflictResolved { entity: key.clone() });
        Ok(resolved)
    }

    pub async fn snapshot(&self) -> ReplicaSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Replace the replica wholesale (backup restore).
    pub async fn restore(&self, snapshot: ReplicaSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = ReplicaState::from_snapshot(snapshot);
        self.persist(&state).await
    }

    fn try_auto_resolve(&self, state: &mut ReplicaState, conflict: &ConflictingValue) -> Result<bool> {
        let local = Entity::new(conflict.key.clone(), conflict.local.value.clone());
        let remote = Entity::new(conflict.key.clone(), conflict.remote.value.clone());

        if let Some(value) = self.validator.resolve_conflict(&local, &remote) {
            state.resolve(&conflict.key, value)?;
            return Ok(true);
        }

        if self.last_writer_wins_non_safety
            && !self.validator.is_safety_entity(&conflict.key.entity_type)
        {
            state.resolve_last_writer(&conflict.key)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn post_check(
        &self,
        state: &mut ReplicaState,
        key: &EntityKey,
        value: Value,
        safety_critical: bool,
        report: &mut MergeReport,
    ) {
        let entity = Entity::new(key.clone(), value);
        match self.validator.check_merged(entity, safety_critical) {
            PostMergeVerdict::Clean(_) => {}
            PostMergeVerdict::Reconciled { entity, issues } => {
                state.overwrite(key.clone(), entity.state);
                self.publish_issues(&issues, report);
            }
            PostMergeVerdict::Accepted { warnings, .. } => {
                self.publish_issues(&warnings, report);
            }
            PostMergeVerdict::Quarantined { issues } => {
                let reason = issues
                    .iter()
                    .map(|i| i.description.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                self.publish_issues(&issues, report);
                self.events.emit(EngineEvent::EntityQuarantined {
                    entity: key.clone(),
                    reason,
                });
                report.quarantined.push(key.clone());
            }
        }
    }

    fn publish_issues(&self, issues: &[ConsistencyIssue], report: &mut MergeReport) {
        for issue in issues {
            self.events.emit(EngineEvent::ConsistencyIssue(issue.clone()));
            report.issues.push(issue.clone());
        }
    }

    async fn persist(&self, state: &ReplicaState) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, &state.snapshot()).await,
            None => Ok(()),
        }
    }
}
