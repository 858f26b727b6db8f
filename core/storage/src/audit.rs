//! Append-only audit trail of operation outcomes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use driftsync_common::{OperationId, Result};

use crate::fsutil::write_atomic;

/// Final (or operator-driven) outcome recorded for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// Accepted by the remote.
    Committed,
    /// Committed through the local-only path while offline.
    CommittedLocally,
    /// Moved to the dead-letter partition.
    DeadLettered,
    /// Returned from the dead-letter partition by an operator.
    Requeued,
}

impl AuditOutcome {
    fn is_commit(&self) -> bool {
        matches!(self, AuditOutcome::Committed | AuditOutcome::CommittedLocally)
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation_id: OperationId,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(operation_id: OperationId, outcome: AuditOutcome, detail: Option<String>) -> Self {
        Self {
            operation_id,
            outcome,
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// JSON-lines audit log with an in-memory index of committed ids.
pub struct AuditLog {
    path: PathBuf,
    records: Vec<AuditRecord>,
    committed: HashSet<OperationId>,
    retention: Duration,
}

impl AuditLog {
    /// Open (or create) the log at `path`.
    ///
    /// Lines that fail to parse are skipped; a torn final line is the
    /// expected result of a crash mid-append. When anything was skipped the
    /// file is rewritten from the readable records before the next append.
    pub async fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = Vec::new();
        let mut needs_repair = false;

        if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            needs_repair = !content.is_empty() && !content.ends_with('\n');
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!("Skipping unreadable audit line {}: {}", line_no + 1, e);
                        needs_repair = true;
                    }
                }
            }
        }

        let mut log = Self {
            path,
            records: Vec::new(),
            committed: HashSet::new(),
            retention,
        };
        if needs_repair {
            log.replace(records).await?;
            warn!("Rewrote audit log {} without its unreadable lines", log.path.display());
        } else {
            for record in records {
                log.index(&record);
                log.records.push(record);
            }
        }

        debug!("Audit log loaded with {} records", log.records.len());
        Ok(log)
    }

    /// Durably append a record.
    pub async fn append(&mut self, record: AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        self.index(&record);
        self.records.push(record);
        Ok(())
    }

    /// Whether the operation's latest recorded outcome is a commit.
    pub fn is_committed(&self, id: &OperationId) -> bool {
        self.committed.contains(id)
    }

    /// Whether any record exists for the operation.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.records.iter().any(|r| &r.operation_id == id)
    }

    /// Most recent record for an operation.
    pub fn latest(&self, id: &OperationId) -> Option<&AuditRecord> {
        self.records.iter().rev().find(|r| &r.operation_id == id)
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records older than the retention window and rewrite the file.
    ///
    /// Returns the number of records removed.
    pub async fn compact(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.retention;
        let before = self.records.len();
        let kept: Vec<AuditRecord> = self
            .records
            .iter()
            .filter(|r| r.recorded_at >= cutoff)
            .cloned()
            .collect();
        let removed = before - kept.len();

        if removed > 0 {
            self.replace(kept).await?;
            debug!("Audit compaction removed {} records", removed);
        }
        Ok(removed)
    }

    /// Replace the whole trail (used when restoring a backup).
    pub async fn replace(&mut self, records: Vec<AuditRecord>) -> Result<()> {
        let mut buf = Vec::new();
        for record in &records {
            buf.extend(serde_json::to_vec(record)?);
            buf.push(b'\n');
        }
        write_atomic(&self.path, &buf).await?;

        self.committed.clear();
        self.records.clear();
        for record in records {
            self.index(&record);
            self.records.push(record);
        }
        Ok(())
    }

    fn index(&mut self, record: &AuditRecord) {
        if record.outcome.is_commit() {
            self.committed.insert(record.operation_id.clone());
        } else {
            self.committed.remove(&record.operation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn op_id(s: &str) -> OperationId {
        OperationId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.log");

        {
            let mut log = AuditLog::open(&path, Duration::days(30)).await.unwrap();
            log.append(AuditRecord::new(op_id("a"), AuditOutcome::Committed, None))
                .await
                .unwrap();
            log.append(AuditRecord::new(
                op_id("b"),
                AuditOutcome::DeadLettered,
                Some("retries exhausted".to_string()),
            ))
            .await
            .unwrap();
        }

        let log = AuditLog::open(&path, Duration::days(30)).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.is_committed(&op_id("a")));
        assert!(!log.is_committed(&op_id("b")));
        assert!(log.contains(&op_id("b")));
    }

    #[tokio::test]
    async fn test_torn_tail_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.log");

        let record = AuditRecord::new(op_id("a"), AuditOutcome::Committed, None);
        let mut content = serde_json::to_string(&record).unwrap();
        content.push_str("\n{\"operation_id\":\"b\",\"outc");
        fs::write(&path, content).await.unwrap();

        let log = AuditLog::open(&path, Duration::days(30)).await.unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.is_committed(&op_id("a")));
    }

    #[tokio::test]
    async fn test_append_after_torn_tail_survives_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.log");

        let record = AuditRecord::new(op_id("a"), AuditOutcome::Committed, None);
        let mut content = serde_json::to_string(&record).unwrap();
        content.push_str("\n{\"operation_id\":\"b\",\"outc");
        fs::write(&path, content).await.unwrap();

        {
            let mut log = AuditLog::open(&path, Duration::days(30)).await.unwrap();
            log.append(AuditRecord::new(op_id("c"), AuditOutcome::Committed, None))
                .await
                .unwrap();
        }

        let log = AuditLog::open(&path, Duration::days(30)).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.is_committed(&op_id("a")));
        assert!(log.is_committed(&op_id("c")));
        assert!(fs::read_to_string(&path).await.unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_compact_respects_retention() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.log");
        let mut log = AuditLog::open(&path, Duration::days(7)).await.unwrap();

        let mut old = AuditRecord::new(op_id("old"), AuditOutcome::Committed, None);
        old.recorded_at = Utc::now() - Duration::days(10);
        log.append(old).await.unwrap();
        log.append(AuditRecord::new(op_id("new"), AuditOutcome::Committed, None))
            .await
            .unwrap();

        let removed = log.compact(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!log.is_committed(&op_id("old")));
        assert!(log.is_committed(&op_id("new")));

        let reloaded = AuditLog::open(&path, Duration::days(7)).await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
