//! Contract with the remote store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use driftsync_common::{
    DeviceId, EntityKey, Error, Operation, OperationId, OperationKind, Result, TimestampedValue,
    VectorClock, CURRENT_SCHEMA_VERSION,
};

/// One operation as sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub entity: EntityKey,
    pub payload: Value,
    pub device_id: DeviceId,
    pub vector_clock: VectorClock,
    pub schema_version: u32,
}

impl From<&Operation> for RemoteRequest {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            kind: op.kind,
            entity: op.entity.clone(),
            payload: op.payload.clone(),
            device_id: op.device_id.clone(),
            vector_clock: op.vector_clock.clone(),
            schema_version: op.schema_version,
        }
    }
}

/// The remote's answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub accepted: bool,
    /// The remote's current version of the entity, to be merged locally.
    pub server_state: Option<TimestampedValue<Value>>,
    pub error: Option<String>,
}

impl RemoteResponse {
    pub fn accepted(server_state: Option<TimestampedValue<Value>>) -> Self {
        Self {
            accepted: true,
            server_state,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            server_state: None,
            error: Some(reason.into()),
        }
    }
}

/// The remote store the engine synchronizes with.
///
/// Implementations must treat a repeated `operation_id` as a no-op: the
/// engine may resend an operation whose acknowledgement was lost.
#[async_trait]
pub trait RemoteCollaborator: Send + Sync {
    /// Apply one operation.
    ///
    /// Transport failures are `Error::Network`; a definitive refusal is an
    /// `Ok` response with `accepted == false`.
    async fn submit(&self, request: RemoteRequest) -> Result<RemoteResponse>;

    /// Schema version the remote understands.
    fn schema_version(&self) -> u32 {
        CURRENT_SCHEMA_VERSION
    }
}

/// Remote that can never be reached. Used by tools operating on local state.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableRemote;

#[async_trait]
impl RemoteCollaborator for UnreachableRemote {
    async fn submit(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        Err(Error::Network(format!(
            "Remote unreachable for {}",
            request.operation_id
        )))
    }
}
