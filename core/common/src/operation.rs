//! Queued operations and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clock::VectorClock;
use crate::types::{DeviceId, EntityKey, OperationId, Priority};

/// Schema version stamped on operations created by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Default retry budget for a new operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Emergency-class action; always classified CRITICAL.
    Emergency,
    /// Kind written by a newer build that this one does not know.
    #[serde(other)]
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Emergency => "emergency",
            OperationKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "emergency" => Ok(OperationKind::Emergency),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// Classification hints supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    /// The mutation should reach the remote soon.
    #[serde(default)]
    pub time_sensitive: bool,
    /// The mutation touches a safety-critical domain entity.
    #[serde(default)]
    pub safety_domain: bool,
    /// Explicit emergency override.
    #[serde(default)]
    pub emergency: bool,
    /// The action is complete once recorded locally; it may be committed
    /// without the remote while offline.
    #[serde(default)]
    pub local_terminal: bool,
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Validated,
    Queued,
    InBatch,
    Committed,
    RetryPending,
    DeadLettered,
}

/// What the store should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the operation queued; `attempts_left` more failures are allowed.
    Retry { attempts_left: u32 },
    /// The retry budget is spent.
    Exhausted,
}

/// A mutation waiting to be synchronized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub entity: EntityKey,
    /// Opaque payload; the engine only hands it to validators and the remote.
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub safety_critical: bool,
    #[serde(default)]
    pub flags: OperationFlags,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub dependencies: Vec<OperationId>,
    pub device_id: DeviceId,
    #[serde(default)]
    pub vector_clock: VectorClock,
    pub schema_version: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Operation {
    /// Create a pending operation with default priority and retry budget.
    pub fn new(
        kind: OperationKind,
        entity: EntityKey,
        payload: serde_json::Value,
        device_id: DeviceId,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            entity,
            payload,
            priority: Priority::Low,
            safety_critical: false,
            flags: OperationFlags::default(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            dependencies: Vec::new(),
            device_id,
            vector_clock: VectorClock::new(),
            schema_version: CURRENT_SCHEMA_VERSION,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    /// Set classification hints.
    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set dependencies.
    pub fn with_dependencies(mut self, dependencies: Vec<OperationId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the declared schema version.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Count a failed attempt.
    ///
    /// `retry_count` never exceeds `max_retries`: the failure that reaches the
    /// budget reports `Exhausted` instead of scheduling another attempt.
    pub fn register_failure(&mut self, error: impl Into<String>) -> RetryDecision {
        self.last_error = Some(error.into());
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        if self.retry_count >= self.max_retries {
            RetryDecision::Exhausted
        } else {
            self.status = OperationStatus::RetryPending;
            RetryDecision::Retry {
                attempts_left: self.max_retries - self.retry_count,
            }
        }
    }

    /// Whether every attempt has been used.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}
