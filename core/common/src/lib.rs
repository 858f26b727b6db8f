//! Common utilities and types shared across DriftSync crates.
//!
//! This module provides the error taxonomy, identifiers, the queued
//! `Operation` model and the vector clocks used for replication.

pub mod clock;
pub mod error;
pub mod operation;
pub mod types;

pub use clock::{ClockOrdering, TimestampedValue, VectorClock};
pub use error::{Error, Result};
pub use operation::{
    Operation, OperationFlags, OperationKind, OperationStatus, RetryDecision,
    CURRENT_SCHEMA_VERSION, DEFAULT_MAX_RETRIES,
};
pub use types::{DeviceId, EntityKey, OperationId, Priority};
