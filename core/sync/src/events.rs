//! Structured observability events.
//!
//! The engine publishes on a broadcast channel and mirrors every event to
//! `tracing`; it does not mandate a sink.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use driftsync_common::{EntityKey, OperationId, Priority};

use crate::network::ConnectivityState;
use crate::scheduler::TierState;
use crate::validator::ConsistencyIssue;

/// Something an external logger or metrics collector may want to see.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    TierStateChanged {
        priority: Priority,
        from: TierState,
        to: TierState,
    },
    ConnectivityChanged {
        from: ConnectivityState,
        to: ConnectivityState,
    },
    ConsistencyIssue(ConsistencyIssue),
    EntityQuarantined {
        entity: EntityKey,
        reason: String,
    },
    ConflictDetected {
        entity: EntityKey,
    },
    ConflictResolved {
        entity: EntityKey,
    },
    OperationCommitted {
        operation_id: OperationId,
        local_only: bool,
    },
    OperationDeadLettered {
        operation_id: OperationId,
        reason: String,
    },
    BackupCreated {
        backup_id: String,
        reason: String,
    },
}

/// Fan-out of engine events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Log and publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        log_event(&event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::TierStateChanged { priority, from, to } => {
            info!(tier = %priority, "Tier state {:?} -> {:?}", from, to)
        }
        EngineEvent::ConnectivityChanged { from, to } => {
            info!("Connectivity {:?} -> {:?}", from, to)
        }
        EngineEvent::ConsistencyIssue(issue) => warn!(
            entity = %issue.entity,
            severity = ?issue.severity,
            auto_reconcilable = issue.auto_reconcilable,
            "Consistency issue: {}",
            issue.description
        ),
        EngineEvent::EntityQuarantined { entity, reason } => {
            error!(entity = %entity, "Entity quarantined: {}", reason)
        }
        EngineEvent::ConflictDetected { entity } => {
            warn!(entity = %entity, "Concurrent update detected")
        }
        EngineEvent::ConflictResolved { entity } => info!(entity = %entity, "Conflict resolved"),
        EngineEvent::OperationCommitted {
            operation_id,
            local_only,
        } => info!(operation = %operation_id, local_only, "Operation committed"),
        EngineEvent::OperationDeadLettered {
            operation_id,
            reason,
        } => error!(operation = %operation_id, "Operation dead-lettered: {}", reason),
        EngineEvent::BackupCreated { backup_id, reason } => {
            info!(backup = %backup_id, "Backup created: {}", reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ConflictDetected {
            entity: EntityKey::new("assessment", "1"),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::ConflictDetected { entity } => assert_eq!(entity.id, "1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::BackupCreated {
            backup_id: "b1".to_string(),
            reason: "test".to_string(),
        });
    }
}
