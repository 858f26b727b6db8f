//! DriftSync Sync Engine
//!
//! This module provides the offline-first synchronization engine, including:
//! - Priority classification and per-tier scheduling loops
//! - Network quality monitoring with quality-dependent sync strategies
//! - Dependency-ordered batch execution against a remote collaborator
//! - Vector-clock replica merging with conflict tracking
//! - Pluggable consistency validation and entity quarantine
//! - Exponential backoff for failing tiers

pub mod backoff;
pub mod batch;
pub mod classifier;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod events;
pub mod manager;
pub mod memory;
pub mod network;
pub mod remote;
pub mod replica;
pub mod scheduler;
pub mod validator;

// Re-export main types
pub use backoff::{Backoff, BackoffConfig};
pub use batch::{
    BatchConfig, BatchProcessor, BatchResult, CommittedItem, DispatchMode, FailedItem,
    FailureKind, ItemOutcome, RetryItem, RetryReason,
};
pub use classifier::{Classification, PriorityClassifier};
pub use config::EngineConfig;
pub use dependency::{topological_order, validate_new, DependencyState};
pub use engine::{
    DrainReport, EngineSnapshot, EngineStats, EnqueueOptions, QueueResult, SyncEngine,
};
pub use events::{EngineEvent, EventBus};
pub use manager::{MergeReport, ReplicaManager};
pub use memory::{MemoryRemote, ScriptedFailure};
pub use network::{
    failed_measurement, online_measurement, strategy_for, ConnectivityState, NetworkConfig,
    NetworkProbe, NetworkQuality, NetworkQualityMeasurement, NetworkQualityMonitor, StaticProbe,
    SyncStrategy,
};
pub use remote::{RemoteCollaborator, RemoteRequest, RemoteResponse, UnreachableRemote};
pub use replica::{
    merge, merge_value, ConflictingValue, MergeOutcome, ReplicaMap, ReplicaSnapshot,
    ReplicaState, ValueMerge,
};
pub use scheduler::{SchedulerConfig, SchedulerHandle, TickOutcome, Tier, TierState};
pub use validator::{
    ConsistencyIssue, ConsistencyValidator, Entity, PostMergeVerdict, QuarantinedEntity,
    Severity, ValidationHook,
};
