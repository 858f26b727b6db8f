//! In-memory remote for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use driftsync_common::{
    ClockOrdering, EntityKey, Error, OperationId, Result, TimestampedValue, CURRENT_SCHEMA_VERSION,
};

use crate::remote::{RemoteCollaborator, RemoteRequest, RemoteResponse};

/// A failure to inject into upcoming submissions.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFailure {
    /// Transport error.
    Network,
    /// Definitive refusal.
    Reject(String),
}

#[derive(Default)]
struct Inner {
    entities: BTreeMap<EntityKey, TimestampedValue<Value>>,
    applied: HashSet<OperationId>,
    submitted: Vec<RemoteRequest>,
    failures: VecDeque<ScriptedFailure>,
}

/// In-memory remote store.
///
/// Accepts every write unless a failure was scripted. A write whose clock
/// does not dominate the stored version leaves the stored version in place
/// and returns it, so the caller sees the remote's concurrent state. All
/// data is lost on drop.
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    schema_version: u32,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            schema_version: CURRENT_SCHEMA_VERSION,
            latency: None,
        }
    }

    /// Advertise a different schema version.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Delay every submission.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` submissions with a network error.
    pub fn fail_next(&self, count: usize) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner.failures.push_back(ScriptedFailure::Network);
        }
    }

    /// Queue an arbitrary failure for an upcoming submission.
    pub fn script(&self, failure: ScriptedFailure) {
        self.lock().failures.push_back(failure);
    }

    /// Seed or overwrite the remote's version of an entity.
    pub fn set_entity(&self, key: EntityKey, value: TimestampedValue<Value>) {
        self.lock().entities.insert(key, value);
    }

    pub fn entity(&self, key: &EntityKey) -> Option<TimestampedValue<Value>> {
        self.lock().entities.get(key).cloned()
    }

    /// Every request received, including failed and repeated ones.
    pub fn submitted(&self) -> Vec<RemoteRequest> {
        self.lock().submitted.clone()
    }

    /// Number of distinct operations applied.
    pub fn applied_count(&self) -> usize {
        self.lock().applied.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCollaborator for MemoryRemote {
    async fn submit(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        inner.submitted.push(request.clone());

        match inner.failures.pop_front() {
            Some(ScriptedFailure::Network) => {
                return Err(Error::Network(format!(
                    "Simulated network failure for {}",
                    request.operation_id
                )))
            }
            Some(ScriptedFailure::Reject(reason)) => return Ok(RemoteResponse::rejected(reason)),
            None => {}
        }

        if !inner.applied.insert(request.operation_id.clone()) {
            return Ok(RemoteResponse::accepted(inner.entities.get(&request.entity).cloned()));
        }

        let incoming = TimestampedValue::new(
            request.payload,
            request.vector_clock,
            request.device_id,
        );
        let keep_stored = inner
            .entities
            .get(&request.entity)
            .is_some_and(|stored| {
                matches!(
                    stored.compare(&incoming),
                    ClockOrdering::After | ClockOrdering::Concurrent
                )
            });
        if !keep_stored {
            inner.entities.insert(request.entity.clone(), incoming);
        }

        Ok(RemoteResponse::accepted(inner.entities.get(&request.entity).cloned()))
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_common::{DeviceId, OperationKind, VectorClock};
    use serde_json::json;

    fn request(id: &str, payload: Value, clock: VectorClock) -> RemoteRequest {
        RemoteRequest {
            operation_id: OperationId::new(id).unwrap(),
            kind: OperationKind::Update,
            entity: EntityKey::new("note", "1"),
            payload,
            device_id: DeviceId::new("device-a").unwrap(),
            vector_clock: clock,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    fn clock(count: u64) -> VectorClock {
        let mut clock = VectorClock::new();
        for _ in 0..count {
            clock.increment(&DeviceId::new("device-a").unwrap());
        }
        clock
    }

    #[tokio::test]
    async fn test_accepts_and_stores() {
        let remote = MemoryRemote::new();
        let response = remote.submit(request("op-1", json!("v1"), clock(1))).await.unwrap();
        assert!(response.accepted);
        assert_eq!(response.server_state.unwrap().value, json!("v1"));
        assert_eq!(remote.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_id_is_noop() {
        let remote = MemoryRemote::new();
        remote.submit(request("op-1", json!("v1"), clock(1))).await.unwrap();
        remote.submit(request("op-1", json!("v1"), clock(1))).await.unwrap();
        assert_eq!(remote.applied_count(), 1);
        assert_eq!(remote.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next(1);
        remote.script(ScriptedFailure::Reject("read-only".to_string()));

        let first = remote.submit(request("op-1", json!(1), clock(1))).await;
        assert!(matches!(first, Err(Error::Network(_))));

        let second = remote.submit(request("op-1", json!(1), clock(1))).await.unwrap();
        assert!(!second.accepted);
        assert_eq!(second.error.as_deref(), Some("read-only"));

        let third = remote.submit(request("op-1", json!(1), clock(1))).await.unwrap();
        assert!(third.accepted);
    }

    #[tokio::test]
    async fn test_concurrent_stored_version_is_kept() {
        let remote = MemoryRemote::new();
        let mut theirs = VectorClock::new();
        theirs.increment(&DeviceId::new("device-b").unwrap());
        remote.set_entity(
            EntityKey::new("note", "1"),
            TimestampedValue::new(json!("theirs"), theirs, DeviceId::new("device-b").unwrap()),
        );

        let response = remote.submit(request("op-1", json!("mine"), clock(1))).await.unwrap();
        assert_eq!(response.server_state.unwrap().value, json!("theirs"));
    }
}
