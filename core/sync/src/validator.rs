//! Pluggable consistency validation and entity quarantine.
//!
//! The engine ships no invariants of its own. Domain code registers
//! predicates per entity type; the validator runs them before an operation is
//! queued and again on every merged state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use driftsync_common::{EntityKey, Error, Operation, OperationKind, Result};

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A violated invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    pub entity: EntityKey,
    pub description: String,
    pub severity: Severity,
    /// A registered reconciler may fix this without operator input.
    pub auto_reconcilable: bool,
}

impl ConsistencyIssue {
    pub fn new(entity: EntityKey, description: impl Into<String>, severity: Severity) -> Self {
        Self {
            entity,
            description: description.into(),
            severity,
            auto_reconcilable: false,
        }
    }

    /// Mark the issue as fixable by a reconciler.
    pub fn reconcilable(mut self) -> Self {
        self.auto_reconcilable = true;
        self
    }
}

/// The state an invariant is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub key: EntityKey,
    pub state: serde_json::Value,
}

impl Entity {
    pub fn new(key: EntityKey, state: serde_json::Value) -> Self {
        Self { key, state }
    }
}

pub type Predicate = Arc<dyn Fn(&Entity) -> Vec<ConsistencyIssue> + Send + Sync>;
pub type Reconciler = Arc<dyn Fn(&Entity) -> Entity + Send + Sync>;
/// Picks a value for two concurrent versions `(local, remote)`.
pub type ConflictResolverFn = Arc<dyn Fn(&Entity, &Entity) -> serde_json::Value + Send + Sync>;

/// Everything registered for one entity type.
#[derive(Clone)]
pub struct ValidationHook {
    predicate: Predicate,
    reconciler: Option<Reconciler>,
    conflict_resolver: Option<ConflictResolverFn>,
    safety_critical: bool,
}

impl ValidationHook {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Entity) -> Vec<ConsistencyIssue> + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            reconciler: None,
            conflict_resolver: None,
            safety_critical: false,
        }
    }

    pub fn with_reconciler<F>(mut self, reconciler: F) -> Self
    where
        F: Fn(&Entity) -> Entity + Send + Sync + 'static,
    {
        self.reconciler = Some(Arc::new(reconciler));
        self
    }

    pub fn with_conflict_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Entity, &Entity) -> serde_json::Value + Send + Sync + 'static,
    {
        self.conflict_resolver = Some(Arc::new(resolver));
        self
    }

    /// Operations on this entity type are safety-critical regardless of how
    /// the caller flagged them.
    pub fn safety_critical(mut self) -> Self {
        self.safety_critical = true;
        self
    }
}

/// Outcome of validating a merged entity.
#[derive(Debug, Clone, PartialEq)]
pub enum PostMergeVerdict {
    /// No issues.
    Clean(Entity),
    /// Issues were fixed by the registered reconciler.
    Reconciled {
        entity: Entity,
        issues: Vec<ConsistencyIssue>,
    },
    /// Non-safety entity proceeds despite issues.
    Accepted {
        entity: Entity,
        warnings: Vec<ConsistencyIssue>,
    },
    /// Safety-critical entity excluded from automatic processing.
    Quarantined { issues: Vec<ConsistencyIssue> },
}

/// An entity held back for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedEntity {
    pub entity: EntityKey,
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Registry of invariants plus the quarantine list.
#[derive(Default)]
pub struct ConsistencyValidator {
    hooks: RwLock<HashMap<String, Vec<ValidationHook>>>,
    quarantine: RwLock<BTreeMap<EntityKey, QuarantinedEntity>>,
}

impl ConsistencyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate and optional reconciler for an entity type.
    pub fn register<F>(&self, entity_type: impl Into<String>, predicate: F, reconciler: Option<Reconciler>)
    where
        F: Fn(&Entity) -> Vec<ConsistencyIssue> + Send + Sync + 'static,
    {
        let mut hook = ValidationHook::new(predicate);
        hook.reconciler = reconciler;
        self.register_hook(entity_type, hook);
    }

    /// Register a fully configured hook. Several hooks may share a type.
    pub fn register_hook(&self, entity_type: impl Into<String>, hook: ValidationHook) {
        let entity_type = entity_type.into();
        debug!("Registered validation hook for {}", entity_type);
        write(&self.hooks).entry(entity_type).or_default().push(hook);
    }

    /// Whether any hook marks the entity type as safety-critical.
    pub fn is_safety_entity(&self, entity_type: &str) -> bool {
        read(&self.hooks)
            .get(entity_type)
            .is_some_and(|hooks| hooks.iter().any(|h| h.safety_critical))
    }

    /// Run every registered predicate.
    pub fn validate(&self, entity: &Entity) -> Vec<ConsistencyIssue> {
        read(&self.hooks)
            .get(&entity.key.entity_type)
            .map(|hooks| hooks.iter().flat_map(|h| (h.predicate)(entity)).collect())
            .unwrap_or_default()
    }

    /// Pre-enqueue gate.
    ///
    /// Returns the issues found (to be logged as warnings) or a
    /// `Validation` error when a safety-critical operation has issues a
    /// reconciler cannot fix. Deletes carry a tombstone and are not checked.
    pub fn check_operation(&self, op: &Operation) -> Result<Vec<ConsistencyIssue>> {
        if op.kind == OperationKind::Delete {
            return Ok(Vec::new());
        }

        let entity = Entity::new(op.entity.clone(), op.payload.clone());
        let issues = self.validate(&entity);

        let blocking: Vec<&ConsistencyIssue> =
            issues.iter().filter(|i| !i.auto_reconcilable).collect();
        if op.safety_critical && !blocking.is_empty() {
            let descriptions: Vec<&str> = blocking.iter().map(|i| i.description.as_str()).collect();
            return Err(Error::Validation(format!(
                "Operation {} on {} violates: {}",
                op.id,
                op.entity,
                descriptions.join("; ")
            )));
        }

        for issue in &issues {
            warn!("Accepting {} with issue on {}: {}", op.id, issue.entity, issue.description);
        }
        Ok(issues)
    }

    /// Post-merge check.
    ///
    /// Auto-reconcilable issues are fixed with the registered reconcilers and
    /// the result is validated once more. Whatever remains quarantines a
    /// safety-critical entity; other entities proceed with warnings.
    pub fn check_merged(&self, entity: Entity, safety_critical: bool) -> PostMergeVerdict {
        let issues = self.validate(&entity);
        if issues.is_empty() {
            return PostMergeVerdict::Clean(entity);
        }

        let reconcilers = self.reconcilers(&entity.key.entity_type);
        let remaining = if issues.iter().all(|i| i.auto_reconcilable) && !reconcilers.is_empty() {
            let reconciled = reconcilers.iter().fold(entity.clone(), |e, r| r(&e));
            let after = self.validate(&reconciled);
            if after.is_empty() {
                return PostMergeVerdict::Reconciled {
                    entity: reconciled,
                    issues,
                };
            }
            after
        } else {
            issues
        };

        if safety_critical || self.is_safety_entity(&entity.key.entity_type) {
            let reason = remaining
                .iter()
                .map(|i| i.description.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            self.quarantine(entity.key.clone(), reason);
            PostMergeVerdict::Quarantined { issues: remaining }
        } else {
            PostMergeVerdict::Accepted {
                entity,
                warnings: remaining,
            }
        }
    }

    /// Ask the registered conflict resolver (if any) to pick a value.
    pub fn resolve_conflict(&self, local: &Entity, remote: &Entity) -> Option<serde_json::Value> {
        let hooks = read(&self.hooks);
        hooks
            .get(&local.key.entity_type)?
            .iter()
            .find_map(|h| h.conflict_resolver.as_ref())
            .map(|resolver| resolver(local, remote))
    }

    /// Exclude an entity from automatic processing.
    pub fn quarantine(&self, entity: EntityKey, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Quarantining {}: {}", entity, reason);
        write(&self.quarantine).insert(
            entity.clone(),
            QuarantinedEntity {
                entity,
                reason,
                since: Utc::now(),
            },
        );
    }

    pub fn is_quarantined(&self, entity: &EntityKey) -> bool {
        read(&self.quarantine).contains_key(entity)
    }

    /// Currently quarantined entities.
    pub fn quarantined(&self) -> Vec<QuarantinedEntity> {
        read(&self.quarantine).values().cloned().collect()
    }

    /// Return an entity to automatic processing. Returns whether it was
    /// quarantined.
    pub fn release(&self, entity: &EntityKey) -> bool {
        write(&self.quarantine).remove(entity).is_some()
    }

    /// Replace the quarantine list (used when restoring a backup).
    pub fn restore_quarantine(&self, entries: Vec<QuarantinedEntity>) {
        let mut quarantine = write(&self.quarantine);
        quarantine.clear();
        for entry in entries {
            quarantine.insert(entry.entity.clone(), entry);
        }
    }

    fn reconcilers(&self, entity_type: &str) -> Vec<Reconciler> {
        read(&self.hooks)
            .get(entity_type)
            .map(|hooks| hooks.iter().filter_map(|h| h.reconciler.clone()).collect())
            .unwrap_or_default()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
