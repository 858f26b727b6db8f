//! Crash-safe file helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::error;

use driftsync_common::{Error, Result};

/// Write `data` to `path` so that readers see either the old or the new
/// content, never a torn file.
///
/// The bytes go to a sibling `.tmp` file which is fsynced and then renamed
/// over the target. On Unix the parent directory is fsynced too, so the
/// rename itself survives power loss.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = tmp_path_for(path);

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    sync_parent(path).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

/// Load a JSON document, returning `None` if the file does not exist.
///
/// A file that exists but fails to parse is moved aside to
/// `<name>.corrupt-<unix millis>` and reported as `None`; its bytes are kept
/// for manual recovery.
pub async fn read_json_or_quarantine<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }

    let content = fs::read(path).await?;
    match serde_json::from_slice(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let aside = corrupt_path_for(path);
            error!(
                "Unreadable state file {} ({}); moved to {}",
                path.display(),
                e,
                aside.display()
            );
            fs::rename(path, &aside)
                .await
                .map_err(|io| Error::Storage(format!("Failed to set aside {}: {}", path.display(), io)))?;
            Ok(None)
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", chrono::Utc::now().timestamp_millis()));
    path.with_file_name(name)
}
