//! Conflict-free replica merging.
//!
//! Values carry vector clocks. Merging two maps keeps whichever side causally
//! dominates each key; concurrent writes are recorded as conflicts and the
//! local value is kept until something resolves them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use driftsync_common::{
    ClockOrdering, DeviceId, EntityKey, Error, Result, TimestampedValue, VectorClock,
};

/// Replicated entity states keyed by entity.
pub type ReplicaMap = BTreeMap<EntityKey, TimestampedValue<Value>>;

/// Which side of a single-key merge wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMerge {
    Local,
    Remote,
    Conflict,
}

/// Two concurrent versions of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingValue {
    pub key: EntityKey,
    pub local: TimestampedValue<Value>,
    pub remote: TimestampedValue<Value>,
    pub detected_at: DateTime<Utc>,
}

/// Result of merging two maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub resolved: ReplicaMap,
    pub conflicts: Vec<ConflictingValue>,
}

/// Decide one key: the strictly newer side wins, equal clocks keep local.
pub fn merge_value<T>(local: &TimestampedValue<T>, remote: &TimestampedValue<T>) -> ValueMerge {
    match local.compare(remote) {
        ClockOrdering::Before => ValueMerge::Remote,
        ClockOrdering::After | ClockOrdering::Equal => ValueMerge::Local,
        ClockOrdering::Concurrent => ValueMerge::Conflict,
    }
}

/// Merge two replica maps. Keys present on one side only are taken as is.
pub fn merge(local: &ReplicaMap, remote: &ReplicaMap) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        resolved: local.clone(),
        conflicts: Vec::new(),
    };

    for (key, theirs) in remote {
        let Some(ours) = local.get(key) else {
            outcome.resolved.insert(key.clone(), theirs.clone());
            continue;
        };

        match merge_value(ours, theirs) {
            ValueMerge::Local => {}
            ValueMerge::Remote => {
                outcome.resolved.insert(key.clone(), theirs.clone());
            }
            ValueMerge::Conflict => outcome.conflicts.push(ConflictingValue {
                key: key.clone(),
                local: ours.clone(),
                remote: theirs.clone(),
                detected_at: Utc::now(),
            }),
        }
    }

    outcome
}

/// Serializable form of a [`ReplicaState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub device_id: DeviceId,
    pub clock: VectorClock,
    pub values: Vec<(EntityKey, TimestampedValue<Value>)>,
    pub conflicts: Vec<ConflictingValue>,
}

/// This device's replica: its values, running clock and open conflicts.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    device_id: DeviceId,
    clock: VectorClock,
    values: ReplicaMap,
    conflicts: BTreeMap<EntityKey, ConflictingValue>,
}

impl ReplicaState {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            clock: VectorClock::new(),
            values: ReplicaMap::new(),
            conflicts: BTreeMap::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Everything this replica has observed.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn get(&self, key: &EntityKey) -> Option<&TimestampedValue<Value>> {
        self.values.get(key)
    }

    pub fn values(&self) -> &ReplicaMap {
        &self.values
    }

    /// Record a local write, advancing this device's clock component.
    pub fn write(&mut self, key: EntityKey, value: Value) -> TimestampedValue<Value> {
        self.clock.increment(&self.device_id);
        let stamped = TimestampedValue::new(value, self.clock.clone(), self.device_id.clone());
        self.values.insert(key, stamped.clone());
        stamped
    }

    /// Merge values received from elsewhere and return the new conflicts.
    ///
    /// Remote clocks are folded into this device's clock so later local
    /// writes dominate what has been seen.
    pub fn apply_remote(&mut self, remote: &ReplicaMap) -> Vec<ConflictingValue> {
        let outcome = merge(&self.values, remote);
        self.values = outcome.resolved;
        for value in remote.values() {
            self.clock.merge(&value.vector_clock);
        }

        for conflict in &outcome.conflicts {
            warn!("Concurrent versions of {} kept for resolution", conflict.key);
            self.conflicts.insert(conflict.key.clone(), conflict.clone());
        }
        outcome.conflicts
    }

    /// Replace a merged value after validation rewrote it (reconciliation).
    ///
    /// The rewrite counts as a local write so it dominates both inputs.
    pub fn overwrite(&mut self, key: EntityKey, value: Value) -> TimestampedValue<Value> {
        self.write(key, value)
    }

    /// Set `key` back to an earlier value, or drop it when there was none.
    /// The clock is left alone.
    pub fn restore_value(&mut self, key: EntityKey, previous: Option<TimestampedValue<Value>>) {
        match previous {
            Some(value) => {
                self.values.insert(key, value);
            }
            None => {
                self.values.remove(&key);
            }
        }
    }

    /// Open conflicts, ordered by entity.
    pub fn conflicts(&self) -> Vec<ConflictingValue> {
        self.conflicts.values().cloned().collect()
    }

    pub fn conflict(&self, key: &EntityKey) -> Option<&ConflictingValue> {
        self.conflicts.get(key)
    }

    /// Settle a conflict with `value`. The resolution's clock dominates both
    /// conflicting versions.
    pub fn resolve(&mut self, key: &EntityKey, value: Value) -> Result<TimestampedValue<Value>> {
        let conflict = self
            .conflicts
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("No open conflict for {}", key)))?;

        self.clock.merge(&conflict.local.vector_clock);
        self.clock.merge(&conflict.remote.vector_clock);
        let resolved = self.write(key.clone(), value);
        debug!("Resolved conflict on {}", key);
        Ok(resolved)
    }

    /// Settle a conflict by keeping the most recently written version. Ties
    /// go to the lower device id so every replica picks the same side.
    pub fn resolve_last_writer(&mut self, key: &EntityKey) -> Result<TimestampedValue<Value>> {
        let conflict = self
            .conflicts
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("No open conflict for {}", key)))?;

        let winner = match conflict.local.updated_at.cmp(&conflict.remote.updated_at) {
            std::cmp::Ordering::Greater => &conflict.local,
            std::cmp::Ordering::Less => &conflict.remote,
            std::cmp::Ordering::Equal if conflict.local.device_id <= conflict.remote.device_id => {
                &conflict.local
            }
            std::cmp::Ordering::Equal => &conflict.remote,
        };
        let value = winner.value.clone();
        self.resolve(key, value)
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            device_id: self.device_id.clone(),
            clock: self.clock.clone(),
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            conflicts: self.conflicts.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: ReplicaSnapshot) -> Self {
        Self {
            device_id: snapshot.device_id,
            clock: snapshot.clock,
            values: snapshot.values.into_iter().collect(),
            conflicts: snapshot
                .conflicts
                .into_iter()
                .map(|c| (c.key.clone(), c))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn device(name: &str) -> DeviceId {
        DeviceId::new(name).unwrap()
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new("note", id)
    }

    fn stamped(value: Value, writes: &[(&str, u64)]) -> TimestampedValue<Value> {
        let mut clock = VectorClock::new();
        for (name, count) in writes {
            for _ in 0..*count {
                clock.increment(&device(name));
            }
        }
        let author = device(writes.first().map(|(n, _)| *n).unwrap_or("x"));
        TimestampedValue::new(value, clock, author)
    }

    #[test]
    fn test_one_sided_keys_are_taken() {
        let local: ReplicaMap = [(key("1"), stamped(json!(1), &[("a", 1)]))].into();
        let remote: ReplicaMap = [(key("2"), stamped(json!(2), &[("b", 1)]))].into();

        let outcome = merge(&local, &remote);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.resolved.len(), 2);
    }

    #[test]
    fn test_newer_side_wins() {
        let old = stamped(json!("old"), &[("a", 1)]);
        let new = stamped(json!("new"), &[("a", 2)]);

        let local: ReplicaMap = [(key("1"), old.clone())].into();
        let remote: ReplicaMap = [(key("1"), new.clone())].into();
        assert_eq!(merge(&local, &remote).resolved[&key("1")].value, json!("new"));
        assert_eq!(merge(&remote, &local).resolved[&key("1")].value, json!("new"));
    }

    #[test]
    fn test_concurrent_keeps_local_and_reports() {
        let local: ReplicaMap = [(key("1"), stamped(json!("mine"), &[("a", 1)]))].into();
        let remote: ReplicaMap = [(key("1"), stamped(json!("theirs"), &[("b", 1)]))].into();

        let outcome = merge(&local, &remote);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.resolved[&key("1")].value, json!("mine"));
        assert_eq!(outcome.conflicts[0].remote.value, json!("theirs"));
    }

    #[test]
    fn test_replica_write_advances_own_component() {
        let mut replica = ReplicaState::new(device("a"));
        let first = replica.write(key("1"), json!(1));
        let second = replica.write(key("1"), json!(2));
        assert_eq!(first.compare(&second), ClockOrdering::Before);
        assert_eq!(replica.clock().get(&device("a")), 2);
    }

    #[test]
    fn test_resolution_dominates_both_sides() {
        let mut replica = ReplicaState::new(device("a"));
        replica.write(key("1"), json!("mine"));

        let remote: ReplicaMap = [(key("1"), stamped(json!("theirs"), &[("b", 3)]))].into();
        let conflicts = replica.apply_remote(&remote);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(replica.conflicts().len(), 1);

        let resolved = replica.resolve(&key("1"), json!("both")).unwrap();
        assert!(replica.conflicts().is_empty());
        assert_eq!(resolved.compare(&conflicts[0].local), ClockOrdering::After);
        assert_eq!(resolved.compare(&conflicts[0].remote), ClockOrdering::After);
        assert!(replica.resolve(&key("1"), json!("again")).is_err());
    }

    #[test]
    fn test_last_writer_resolution() {
        let mut replica = ReplicaState::new(device("a"));
        replica.write(key("1"), json!("mine"));
        let mut theirs = stamped(json!("theirs"), &[("b", 1)]);
        theirs.updated_at = Utc::now() + chrono::Duration::seconds(5);
        replica.apply_remote(&[(key("1"), theirs)].into());

        let resolved = replica.resolve_last_writer(&key("1")).unwrap();
        assert_eq!(resolved.value, json!("theirs"));
    }

    #[test]
    fn test_snapshot_restores_conflicts() {
        let mut replica = ReplicaState::new(device("a"));
        replica.write(key("1"), json!("mine"));
        replica.apply_remote(&[(key("1"), stamped(json!("theirs"), &[("b", 1)]))].into());

        let json = serde_json::to_string(&replica.snapshot()).unwrap();
        let restored = ReplicaState::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.conflicts(), replica.conflicts());
        assert_eq!(restored.values(), replica.values());
        assert_eq!(restored.clock(), replica.clock());
    }

    fn arb_map(author: &'static str) -> impl Strategy<Value = ReplicaMap> {
        proptest::collection::btree_map(0u8..8, (0u64..4, 0u64..4, any::<i32>()), 0..8).prop_map(
            move |entries| {
                entries
                    .into_iter()
                    .map(|(k, (mine, shared, v))| {
                        (
                            key(&k.to_string()),
                            stamped(json!(v), &[(author, mine), ("shared", shared)]),
                        )
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_merge_never_drops_keys(local in arb_map("a"), remote in arb_map("b")) {
            let outcome = merge(&local, &remote);
            for k in local.keys().chain(remote.keys()) {
                prop_assert!(outcome.resolved.contains_key(k));
            }
            for conflict in &outcome.conflicts {
                prop_assert_eq!(&outcome.resolved[&conflict.key], &local[&conflict.key]);
            }
        }

        #[test]
        fn prop_conflicts_are_symmetric(local in arb_map("a"), remote in arb_map("b")) {
            let forward = merge(&local, &remote);
            let backward = merge(&remote, &local);
            let f: Vec<_> = forward.conflicts.iter().map(|c| c.key.clone()).collect();
            let b: Vec<_> = backward.conflicts.iter().map(|c| c.key.clone()).collect();
            prop_assert_eq!(f, b);
        }

        #[test]
        fn prop_merge_with_self_is_identity(local in arb_map("a")) {
            let outcome = merge(&local, &local);
            prop_assert!(outcome.conflicts.is_empty());
            prop_assert_eq!(outcome.resolved, local);
        }
    }
}
