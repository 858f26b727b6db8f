//! Batch execution against the remote.
//!
//! A batch is ordered by dependencies, executed operation by operation and
//! reported per item. The processor never touches the store; the engine
//! applies the outcomes.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use driftsync_common::{EntityKey, Error, Operation, OperationId, OperationKind};

use crate::dependency::topological_order;
use crate::manager::ReplicaManager;
use crate::remote::{RemoteCollaborator, RemoteRequest};
use crate::replica::ReplicaMap;

/// Batch processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Upper bound for a single remote call.
    pub call_timeout: Duration,
    /// Dispatch kind groups concurrently.
    pub parallel_kinds: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            parallel_kinds: false,
        }
    }
}

impl BatchConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_parallel_kinds(mut self, enabled: bool) -> Self {
        self.parallel_kinds = enabled;
        self
    }
}

/// How a batch reaches its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Send every operation to the remote.
    Remote,
    /// No remote: commit locally-terminal operations, defer the rest.
    LocalOnly,
}

/// Why an operation should be tried again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// Transport failure or timeout; counts against the retry budget.
    Network(String),
    /// Not attempted because the remote is unavailable.
    Offline,
    /// Not attempted because a dependency in the same batch did not commit.
    DependencyFailed(OperationId),
}

impl RetryReason {
    /// Whether this attempt counts against `max_retries`.
    pub fn consumes_retry(&self) -> bool {
        matches!(self, RetryReason::Network(_))
    }
}

/// Non-retryable failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Rejected,
    Validation,
    SafetyCritical,
    Conflict,
    Consistency,
    Migration,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Rejected => "rejected",
            FailureKind::Validation => "validation",
            FailureKind::SafetyCritical => "safety-critical",
            FailureKind::Conflict => "conflict",
            FailureKind::Consistency => "consistency",
            FailureKind::Migration => "migration",
        }
    }

    /// The error this failure surfaces as.
    pub fn to_error(self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self {
            FailureKind::Rejected => Error::Validation(format!("Rejected by remote: {}", message)),
            FailureKind::Validation => Error::Validation(message),
            FailureKind::SafetyCritical => Error::SafetyCritical(message),
            FailureKind::Conflict => Error::Conflict(message),
            FailureKind::Consistency => Error::Consistency(message),
            FailureKind::Migration => Error::Migration(message),
        }
    }
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Committed { local_only: bool },
    Retry(RetryReason),
    Failed { kind: FailureKind, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedItem {
    pub operation_id: OperationId,
    pub local_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryItem {
    pub operation_id: OperationId,
    pub reason: RetryReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub operation_id: OperationId,
    pub kind: FailureKind,
    pub error: String,
}

/// Per-item results of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub committed: Vec<CommittedItem>,
    pub retryable: Vec<RetryItem>,
    pub failed: Vec<FailedItem>,
}

impl BatchResult {
    fn record(&mut self, operation_id: OperationId, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Committed { local_only } => self.committed.push(CommittedItem {
                operation_id,
                local_only,
            }),
            ItemOutcome::Retry(reason) => self.retryable.push(RetryItem {
                operation_id,
                reason,
            }),
            ItemOutcome::Failed { kind, error } => self.failed.push(FailedItem {
                operation_id,
                kind,
                error,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.committed.len() + self.retryable.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any operation hit a network failure.
    pub fn had_network_failure(&self) -> bool {
        self.retryable
            .iter()
            .any(|item| matches!(item.reason, RetryReason::Network(_)))
    }
}

/// Executes batches of operations.
pub struct BatchProcessor {
    remote: Arc<dyn RemoteCollaborator>,
    replica: Arc<ReplicaManager>,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(remote: Arc<dyn RemoteCollaborator>, replica: Arc<ReplicaManager>, config: BatchConfig) -> Self {
        Self {
            remote,
            replica,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Execute `ops` and report the outcome of each.
    ///
    /// Operations run after their in-batch dependencies. A failed or
    /// deferred operation does not stop its independent siblings, but its
    /// dependents are deferred without being attempted.
    pub async fn process(&self, ops: Vec<Operation>, mode: DispatchMode) -> BatchResult {
        let mut result = BatchResult::default();
        if ops.is_empty() {
            return result;
        }

        let (ops, order) = match topological_order(&ops) {
            Ok(order) => (ops, order),
            Err(unordered) => {
                let unordered: HashSet<OperationId> = unordered.into_iter().collect();
                warn!("Batch contains a dependency cycle among {} operations", unordered.len());
                for id in &unordered {
                    result.record(
                        id.clone(),
                        ItemOutcome::Failed {
                            kind: FailureKind::Validation,
                            error: "Dependency cycle in batch".to_string(),
                        },
                    );
                }
                let rest: Vec<Operation> = ops
                    .into_iter()
                    .filter(|op| !unordered.contains(&op.id))
                    .collect();
                match topological_order(&rest) {
                    Ok(order) => (rest, order),
                    Err(_) => return result,
                }
            }
        };

        let in_batch: HashSet<&OperationId> = ops.iter().map(|op| &op.id).collect();
        let mut settled: HashMap<OperationId, bool> = HashMap::new();

        if mode == DispatchMode::Remote && self.config.parallel_kinds {
            self.dispatch_waves(&ops, order, &in_batch, &mut settled, &mut result)
                .await;
        } else {
            for i in order {
                let op = &ops[i];
                let outcome = match blocked_by(op, &in_batch, &settled) {
                    Some(dep) => ItemOutcome::Retry(RetryReason::DependencyFailed(dep)),
                    None => self.dispatch(op, mode).await,
                };
                settled.insert(op.id.clone(), matches!(outcome, ItemOutcome::Committed { .. }));
                result.record(op.id.clone(), outcome);
            }
        }

        debug!(
            "Batch done: {} committed, {} retryable, {} failed",
            result.committed.len(),
            result.retryable.len(),
            result.failed.len()
        );
        result
    }

    /// Run the batch in waves of operations whose dependencies are settled;
    /// within a wave each kind group runs concurrently.
    async fn dispatch_waves(
        &self,
        ops: &[Operation],
        order: Vec<usize>,
        in_batch: &HashSet<&OperationId>,
        settled: &mut HashMap<OperationId, bool>,
        result: &mut BatchResult,
    ) {
        let mut remaining = order;
        while !remaining.is_empty() {
            let (ready, waiting): (Vec<usize>, Vec<usize>) = remaining.into_iter().partition(|&i| {
                ops[i]
                    .dependencies
                    .iter()
                    .all(|dep| !in_batch.contains(dep) || settled.contains_key(dep))
            });

            let mut groups: BTreeMap<OperationKind, Vec<&Operation>> = BTreeMap::new();
            for &i in &ready {
                let op = &ops[i];
                if let Some(dep) = blocked_by(op, in_batch, settled) {
                    settled.insert(op.id.clone(), false);
                    result.record(op.id.clone(), ItemOutcome::Retry(RetryReason::DependencyFailed(dep)));
                } else {
                    groups.entry(op.kind).or_default().push(op);
                }
            }

            let runs = groups.into_values().map(|group| async move {
                let mut outcomes = Vec::with_capacity(group.len());
                for op in group {
                    outcomes.push((op.id.clone(), self.dispatch(op, DispatchMode::Remote).await));
                }
                outcomes
            });
            for (id, outcome) in join_all(runs).await.into_iter().flatten() {
                settled.insert(id.clone(), matches!(outcome, ItemOutcome::Committed { .. }));
                result.record(id, outcome);
            }

            remaining = waiting;
        }
    }

    async fn dispatch(&self, op: &Operation, mode: DispatchMode) -> ItemOutcome {
        match mode {
            DispatchMode::LocalOnly if op.flags.local_terminal => {
                ItemOutcome::Committed { local_only: true }
            }
            DispatchMode::LocalOnly => ItemOutcome::Retry(RetryReason::Offline),
            DispatchMode::Remote => self.execute(op).await,
        }
    }

    async fn execute(&self, op: &Operation) -> ItemOutcome {
        let expected = self.remote.schema_version();
        if op.schema_version != expected {
            return ItemOutcome::Failed {
                kind: FailureKind::Migration,
                error: format!(
                    "Operation schema v{} does not match remote schema v{}",
                    op.schema_version, expected
                ),
            };
        }

        let response = match timeout(self.config.call_timeout, self.remote.submit(RemoteRequest::from(op))).await {
            Err(_) => {
                warn!("Remote call for {} timed out", op.id);
                return ItemOutcome::Retry(RetryReason::Network(format!(
                    "Timed out after {:?}",
                    self.config.call_timeout
                )));
            }
            Ok(Err(e)) => return failure_from_error(e),
            Ok(Ok(response)) => response,
        };

        if !response.accepted {
            return ItemOutcome::Failed {
                kind: FailureKind::Rejected,
                error: response
                    .error
                    .unwrap_or_else(|| "Rejected without reason".to_string()),
            };
        }

        // Without a server copy the local value is the settled state.
        let settled = match response.server_state {
            Some(server_state) => {
                let remote: ReplicaMap = [(op.entity.clone(), server_state)].into();
                self.replica.merge_remote(&remote, op.safety_critical).await
            }
            None => self.replica.verify_local(&op.entity, op.safety_critical).await,
        };
        match settled {
            Ok(report) if report.is_quarantined(&op.entity) => ItemOutcome::Failed {
                kind: FailureKind::Consistency,
                error: quarantine_message(&op.entity),
            },
            Ok(_) => ItemOutcome::Committed { local_only: false },
            Err(e) => {
                warn!("Settling state of {} failed: {}", op.id, e);
                ItemOutcome::Retry(RetryReason::Offline)
            }
        }
    }
}

/// First in-batch dependency of `op` that settled without committing.
fn blocked_by(
    op: &Operation,
    in_batch: &HashSet<&OperationId>,
    settled: &HashMap<OperationId, bool>,
) -> Option<OperationId> {
    op.dependencies
        .iter()
        .find(|dep| in_batch.contains(dep) && settled.get(*dep) != Some(&true))
        .cloned()
}

fn failure_from_error(error: Error) -> ItemOutcome {
    let kind = match &error {
        Error::Network(_) => return ItemOutcome::Retry(RetryReason::Network(error.to_string())),
        Error::Validation(_) => FailureKind::Validation,
        Error::SafetyCritical(_) => FailureKind::SafetyCritical,
        Error::Conflict(_) => FailureKind::Conflict,
        Error::Consistency(_) => FailureKind::Consistency,
        Error::Migration(_) => FailureKind::Migration,
        _ => FailureKind::Rejected,
    };
    ItemOutcome::Failed {
        kind,
        error: error.to_string(),
    }
}

fn quarantine_message(entity: &EntityKey) -> String {
    format!("Merged state of {} failed validation; entity quarantined", entity)
}
