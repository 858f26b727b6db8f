//! Emergency backups taken before destructive recovery actions.
//!
//! A backup is a versioned JSON document whose payload is a gzip-compressed
//! JSON snapshot (base64 on disk) protected by a BLAKE2b-256 digest. Only the
//! newest `max_backups` files are retained.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use driftsync_common::{Error, Result};

use crate::fsutil::write_json_atomic;

/// Backup document format version.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// A compressed, digest-protected snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyBackup {
    pub id: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub integrity_digest: String,
}

impl EmergencyBackup {
    /// Compress `state` into a new backup.
    pub fn seal<T: Serialize + ?Sized>(reason: impl Into<String>, state: &T) -> Result<Self> {
        let json = serde_json::to_vec(state)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let payload = encoder.finish()?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            version: BACKUP_FORMAT_VERSION,
            timestamp: Utc::now(),
            reason: reason.into(),
            integrity_digest: digest(&payload),
            payload,
        })
    }

    /// Check the payload against the recorded digest.
    pub fn verify(&self) -> Result<()> {
        if self.version != BACKUP_FORMAT_VERSION {
            return Err(Error::Integrity(format!(
                "Unsupported backup version {} (expected {})",
                self.version, BACKUP_FORMAT_VERSION
            )));
        }
        let actual = digest(&self.payload);
        if actual != self.integrity_digest {
            return Err(Error::Integrity(format!(
                "Backup {} digest mismatch",
                self.id
            )));
        }
        Ok(())
    }

    /// Verify, decompress and deserialize the snapshot.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T> {
        self.verify()?;

        let mut json = Vec::new();
        GzDecoder::new(self.payload.as_slice()).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// Summary of a backup on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Bounded directory of emergency backups.
pub struct BackupManager {
    dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    /// Create a manager rooted at `dir`, creating it if needed.
    pub async fn new(dir: impl AsRef<Path>, max_backups: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            max_backups: max_backups.max(1),
        })
    }

    /// Seal `state` into a new backup file and evict the oldest ones beyond
    /// the retention bound.
    pub async fn create<T: Serialize + ?Sized>(
        &self,
        reason: impl Into<String>,
        state: &T,
    ) -> Result<BackupInfo> {
        let backup = EmergencyBackup::seal(reason, state)?;
        let path = self.dir.join(file_name_for(&backup));
        write_json_atomic(&path, &backup).await?;

        let size = fs::metadata(&path).await?.len();
        info!(
            "Created emergency backup {} ({} bytes): {}",
            backup.id, size, backup.reason
        );

        let evicted = self.evict().await?;
        if evicted > 0 {
            debug!("Evicted {} old backups", evicted);
        }

        Ok(BackupInfo {
            id: backup.id,
            timestamp: backup.timestamp,
            reason: backup.reason,
            size,
            path,
        })
    }

    /// List backups, oldest first.
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut infos = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_backup(&path).await {
                Ok(backup) => infos.push(BackupInfo {
                    id: backup.id,
                    timestamp: backup.timestamp,
                    reason: backup.reason,
                    size: entry.metadata().await?.len(),
                    path,
                }),
                Err(e) => warn!("Ignoring unreadable backup {}: {}", path.display(), e),
            }
        }

        infos.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(infos)
    }

    /// Load a backup by id.
    pub async fn load(&self, id: &str) -> Result<EmergencyBackup> {
        let info = self
            .list()
            .await?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| Error::NotFound(format!("Backup not found: {}", id)))?;
        read_backup(&info.path).await
    }

    /// Maximum number of retained backups.
    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    async fn evict(&self) -> Result<usize> {
        let infos = self.list().await?;
        let excess = infos.len().saturating_sub(self.max_backups);
        for info in infos.iter().take(excess) {
            fs::remove_file(&info.path).await?;
        }
        Ok(excess)
    }
}

/// BLAKE2b-256 digest as lowercase hex.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn file_name_for(backup: &EmergencyBackup) -> String {
    format!(
        "backup-{}-{}.json",
        backup.timestamp.timestamp_millis(),
        backup.id
    )
}

async fn read_backup(path: &Path) -> Result<EmergencyBackup> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_state() -> BTreeMap<String, Vec<u32>> {
        let mut state = BTreeMap::new();
        state.insert("high".to_string(), vec![1, 2, 3]);
        state.insert("low".to_string(), vec![]);
        state
    }

    #[test]
    fn test_seal_and_open_round_trip() {
        let state = sample_state();
        let backup = EmergencyBackup::seal("test", &state).unwrap();
        let restored: BTreeMap<String, Vec<u32>> = backup.open().unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let mut backup = EmergencyBackup::seal("test", &sample_state()).unwrap();
        backup.payload[0] ^= 0xff;
        assert!(matches!(backup.verify(), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"abc").len(), 64);
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path(), 5).await.unwrap();

        let info = manager.create("before restore", &sample_state()).await.unwrap();
        let backup = manager.load(&info.id).await.unwrap();

        assert_eq!(backup.reason, "before restore");
        let restored: BTreeMap<String, Vec<u32>> = backup.open().unwrap();
        assert_eq!(restored, sample_state());
    }

    #[tokio::test]
    async fn test_oldest_backups_are_evicted() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path(), 2).await.unwrap();

        let first = manager.create("one", &1u32).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager.create("two", &2u32).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let third = manager.create("three", &3u32).await.unwrap();

        let ids: Vec<String> = manager.list().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![second.id, third.id]);
        assert!(manager.load(&first.id).await.is_err());
    }
}
