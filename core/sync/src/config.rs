//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use driftsync_common::{DeviceId, Result};
use driftsync_storage::{write_json_atomic, StoreConfig};

use crate::backoff::BackoffConfig;
use crate::batch::BatchConfig;
use crate::network::NetworkConfig;
use crate::scheduler::SchedulerConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// This replica's identity in vector clocks.
    pub device_id: String,
    /// Maximum number of emergency backups kept.
    pub max_backups: usize,
    /// Events buffered per slow subscriber.
    pub event_capacity: usize,
    /// Settle conflicts on non-safety entity types by last-writer-wins.
    #[serde(default)]
    pub last_writer_wins_non_safety: bool,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("driftsync-data")
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`, with a freshly generated device id.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            device_id: format!("device-{}", uuid::Uuid::new_v4()),
            max_backups: 10,
            event_capacity: 256,
            last_writer_wins_non_safety: false,
            network: NetworkConfig::default(),
            backoff: BackoffConfig::default(),
            batch: BatchConfig::default(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn with_last_writer_wins(mut self, enabled: bool) -> Self {
        self.last_writer_wins_non_safety = enabled;
        self
    }

    /// Validated device id.
    pub fn device(&self) -> Result<DeviceId> {
        DeviceId::new(self.device_id.clone())
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn replica_path(&self) -> PathBuf {
        self.data_dir.join("replica.json")
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.data_dir.join("quarantine.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Load a configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).await?;
        let config = serde_json::from_slice(&data)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_json_atomic(path, self).await
    }
}
