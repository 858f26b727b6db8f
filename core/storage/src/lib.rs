//! Durable storage for DriftSync.
//!
//! This crate persists the local side of the sync engine:
//! - the priority-partitioned operation store and its dead-letter partition
//! - the append-only audit trail of operation outcomes
//! - bounded emergency backups taken before destructive recovery
//!
//! # Design Principles
//! - Durability first: a successful `append` survives a process kill
//! - Never destroy data silently: unreadable files are set aside, destructive
//!   actions are preceded by a backup
//! - Single writer per partition

pub mod audit;
pub mod backup;
pub mod fsutil;
pub mod store;

pub use audit::{AuditLog, AuditOutcome, AuditRecord};
pub use backup::{BackupInfo, BackupManager, EmergencyBackup, BACKUP_FORMAT_VERSION};
pub use fsutil::{read_json_or_quarantine, write_atomic, write_json_atomic};
pub use store::{
    DeadLetter, OperationStore, StoreConfig, StoreReceipt, StoreSnapshot, StoreStats,
};
