//! Dependency graph checks and ordering.

use std::collections::{BTreeSet, HashMap, HashSet};

use driftsync_common::{Error, Operation, OperationId, Result};

/// Where a referenced dependency currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// Still queued; the dependent waits for it.
    Pending,
    /// Committed and recorded in the audit trail.
    Committed,
    /// Parked in the dead-letter partition; it will not run on its own.
    DeadLettered,
    /// Not known to the store.
    Unknown,
}

/// Validate the dependencies of a group of operations about to be enqueued
/// together.
///
/// Dependencies may point at other members of the group or at operations the
/// store knows. Self-references, duplicates, dangling or dead-lettered
/// references and cycles are rejected.
pub fn validate_new<F>(ops: &[Operation], lookup: F) -> Result<()>
where
    F: Fn(&OperationId) -> DependencyState,
{
    let mut group_ids = HashSet::new();
    for op in ops {
        if !group_ids.insert(&op.id) {
            return Err(Error::Validation(format!("Duplicate operation id {}", op.id)));
        }
    }

    for op in ops {
        let mut seen = HashSet::new();
        for dep in &op.dependencies {
            if dep == &op.id {
                return Err(Error::Validation(format!("Operation {} depends on itself", op.id)));
            }
            if !seen.insert(dep) {
                return Err(Error::Validation(format!(
                    "Operation {} lists dependency {} twice",
                    op.id, dep
                )));
            }
            if group_ids.contains(dep) {
                continue;
            }
            match lookup(dep) {
                DependencyState::Pending | DependencyState::Committed => {}
                DependencyState::DeadLettered => {
                    return Err(Error::Validation(format!(
                        "Operation {} depends on dead-lettered {}",
                        op.id, dep
                    )))
                }
                DependencyState::Unknown => {
                    return Err(Error::Validation(format!(
                        "Operation {} has dangling dependency {}",
                        op.id, dep
                    )))
                }
            }
        }
    }

    topological_order(ops).map(|_| ()).map_err(|cycle| {
        let ids: Vec<&str> = cycle.iter().map(|id| id.as_str()).collect();
        Error::Validation(format!("Dependency cycle among {}", ids.join(", ")))
    })
}

/// Order `ops` so every operation comes after its in-group dependencies.
///
/// The sort is stable: among operations that are ready at the same time the
/// input (FIFO) order wins. Dependencies outside the slice are ignored. On a
/// cycle, the ids that could not be ordered are returned.
pub fn topological_order(ops: &[Operation]) -> std::result::Result<Vec<usize>, Vec<OperationId>> {
    let position: HashMap<&OperationId, usize> =
        ops.iter().enumerate().map(|(i, op)| (&op.id, i)).collect();

    let mut indegree = vec![0usize; ops.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (i, op) in ops.iter().enumerate() {
        for dep in &op.dependencies {
            if let Some(&j) = position.get(dep) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..ops.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(ops.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() == ops.len() {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..ops.len())
            .filter(|i| !placed.contains(i))
            .map(|i| ops[i].id.clone())
            .collect())
    }
}
