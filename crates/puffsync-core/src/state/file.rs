// # File Baseline Store
//
// File-based implementation of BaselineStore with crash recovery.
//
// ## Purpose
//
// Keeps per-device baselines across process restarts so that usage which
// happened while nothing was running is reported as one catch-up event.
//
// ## Crash Recovery
//
// - Atomic writes: write to `.tmp`, then rename over the state file
// - Backup: the previous good file is copied to `.backup` before each rename
// - Corruption: an unparsable state file falls back to the backup
// - Last resort: both unreadable → start empty (logged loudly)
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "baselines": {
//     "AA:BB:CC:DD:EE:FF": {
//       "value": 1234,
//       "device_name": "Purifier-ACQD-01",
//       "updated_at": "2026-01-09T12:00:00Z"
//     }
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::Error;
use crate::traits::baseline_store::{BaselineRecord, BaselineStore};
use crate::traits::transport::DeviceIdentity;

/// Baseline file format version
const BASELINE_FILE_VERSION: &str = "1.0";

/// File-based baseline store with crash recovery
///
/// Every mutation is written through to disk before the call returns, which
/// is what the reconciler's persist-before-publish rule needs.
///
/// # Example
///
/// ```rust,no_run
/// use puffsync_core::state::FileBaselineStore;
/// use puffsync_core::traits::{BaselineStore, DeviceIdentity};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileBaselineStore::new("/var/lib/puffsync/baselines.json").await?;
///     let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
///
///     store.set_baseline(&device, 1234).await?;
///     assert_eq!(store.get_baseline(&device.id).await?, Some(1234));
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileBaselineStore {
    path: PathBuf,
    // Held for the whole write so two writers can't interleave temp files
    state: RwLock<FileState>,
}

#[derive(Debug, Default)]
struct FileState {
    baselines: HashMap<String, BaselineRecord>,
    // Disk may differ from `baselines` (a write was interrupted)
    dirty: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct BaselineFileFormat {
    version: String,
    baselines: HashMap<String, BaselineRecord>,
}

/// Why a state file could not be loaded
enum LoadFailure {
    /// The file exists but is not a valid baseline file
    Corrupt(String),
    /// The file could not be read at all
    Io(Error),
}

impl FileBaselineStore {
    /// Create or load a file baseline store
    ///
    /// Creates the parent directory when missing, loads the existing file,
    /// and falls back to the backup if the main file is corrupt.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create baseline directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let baselines = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: RwLock::new(FileState {
                baselines,
                dirty: false,
            }),
        })
    }

    /// Path of the main baseline file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_with_recovery(path: &Path) -> Result<HashMap<String, BaselineRecord>, Error> {
        let reason = match Self::load(path).await {
            Ok(baselines) => {
                debug!(count = baselines.len(), path = %path.display(), "Loaded baselines");
                return Ok(baselines);
            }
            Err(LoadFailure::Io(e)) => return Err(e),
            Err(LoadFailure::Corrupt(reason)) => reason,
        };

        warn!(path = %path.display(), %reason, "Baseline file corrupted, trying backup");

        let backup_path = Self::backup_path(path);
        match Self::load(&backup_path).await {
            Ok(baselines) if backup_path.exists() => {
                info!(count = baselines.len(), "Recovered baselines from backup");
                if let Err(e) = fs::copy(&backup_path, path).await {
                    error!("Failed to restore baseline file from backup: {}", e);
                }
                Ok(baselines)
            }
            Ok(_) => {
                warn!("No baseline backup found, starting with empty state");
                Ok(HashMap::new())
            }
            Err(LoadFailure::Corrupt(backup_reason)) => {
                error!(reason = %backup_reason, "Baseline backup also corrupted, starting with empty state");
                Ok(HashMap::new())
            }
            Err(LoadFailure::Io(e)) => {
                error!("Failed to read baseline backup: {}. Starting with empty state.", e);
                Ok(HashMap::new())
            }
        }
    }

    async fn load(path: &Path) -> Result<HashMap<String, BaselineRecord>, LoadFailure> {
        if !path.exists() {
            trace!(path = %path.display(), "Baseline file does not exist");
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            LoadFailure::Io(Error::baseline_store(format!(
                "Failed to read baseline file {}: {}",
                path.display(),
                e
            )))
        })?;

        let file: BaselineFileFormat =
            serde_json::from_str(&content).map_err(|e| LoadFailure::Corrupt(e.to_string()))?;

        if file.version != BASELINE_FILE_VERSION {
            warn!(
                expected = BASELINE_FILE_VERSION,
                found = %file.version,
                "Baseline file version mismatch, loading anyway"
            );
        }

        Ok(file.baselines)
    }

    /// Write `next` to disk, then make it the visible state
    ///
    /// The in-memory map only changes once the rename succeeded. If the call
    /// fails or is cancelled, readers keep seeing the previous state and the
    /// store stays dirty so `flush` rewrites it.
    async fn commit(
        &self,
        state: &mut FileState,
        next: HashMap<String, BaselineRecord>,
    ) -> Result<(), Error> {
        state.dirty = true;
        self.write_baselines(&next).await?;
        state.baselines = next;
        state.dirty = false;
        Ok(())
    }

    /// Serialize `baselines` and atomically replace the file with it
    async fn write_baselines(
        &self,
        baselines: &HashMap<String, BaselineRecord>,
    ) -> Result<(), Error> {
        let file = BaselineFileFormat {
            version: BASELINE_FILE_VERSION.to_string(),
            baselines: baselines.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::baseline_store(format!("Failed to serialize baselines: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut out = fs::File::create(&temp_path).await.map_err(|e| {
                Error::baseline_store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            out.write_all(json.as_bytes()).await.map_err(|e| {
                Error::baseline_store(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            out.sync_all().await.map_err(|e| {
                Error::baseline_store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            warn!("Failed to create baseline backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::baseline_store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        trace!(path = %self.path.display(), "Baselines written");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl BaselineStore for FileBaselineStore {
    async fn get_baseline(&self, device_id: &str) -> Result<Option<u32>, Error> {
        let state = self.state.read().await;
        Ok(state.baselines.get(device_id).map(|r| r.value))
    }

    async fn get_record(&self, device_id: &str) -> Result<Option<BaselineRecord>, Error> {
        let state = self.state.read().await;
        Ok(state.baselines.get(device_id).cloned())
    }

    async fn set_baseline(&self, device: &DeviceIdentity, value: u32) -> Result<(), Error> {
        let mut state = self.state.write().await;
        let mut next = state.baselines.clone();
        next.insert(device.id.clone(), BaselineRecord::new(device, value));
        self.commit(&mut state, next).await
    }

    async fn delete_baseline(&self, device_id: &str) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if !state.baselines.contains_key(device_id) {
            return Ok(());
        }
        let mut next = state.baselines.clone();
        next.remove(device_id);
        self.commit(&mut state, next).await
    }

    async fn list_devices(&self) -> Result<Vec<String>, Error> {
        let state = self.state.read().await;
        Ok(state.baselines.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if state.dirty {
            let current = state.baselines.clone();
            self.commit(&mut state, current).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device() -> DeviceIdentity {
        DeviceIdentity::new("AA:BB:CC:DD:EE:FF").with_name("Purifier-ACQD-01")
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        assert!(store.list_devices().await.unwrap().is_empty());

        store.set_baseline(&device(), 50).await.unwrap();
        assert!(path.exists());
        drop(store);

        // A new process sees the same baseline
        let reopened = FileBaselineStore::new(&path).await.unwrap();
        assert_eq!(reopened.get_baseline(&device().id).await.unwrap(), Some(50));
        let record = reopened.get_record(&device().id).await.unwrap().unwrap();
        assert_eq!(record.device_name.as_deref(), Some("Purifier-ACQD-01"));
    }

    #[tokio::test]
    async fn test_file_store_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        store.set_baseline(&device(), 10).await.unwrap();
        // Second write moves the first file into .backup
        store.set_baseline(&device(), 11).await.unwrap();
        assert!(FileBaselineStore::backup_path(&path).exists());

        fs::write(&path, b"{ not json").await.unwrap();

        let recovered = FileBaselineStore::new(&path).await.unwrap();
        assert_eq!(
            recovered.get_baseline(&device().id).await.unwrap(),
            Some(10),
            "backup holds the state before the last write"
        );
    }

    #[tokio::test]
    async fn test_file_store_corrupt_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baselines.json");
        fs::write(&path, b"garbage").await.unwrap();

        let store = FileBaselineStore::new(&path).await.unwrap();
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_delete_is_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        store.set_baseline(&device(), 3).await.unwrap();
        store.delete_baseline(&device().id).await.unwrap();
        store.delete_baseline("never-seen").await.unwrap();

        let reopened = FileBaselineStore::new(&path).await.unwrap();
        assert_eq!(reopened.get_baseline(&device().id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_last_write_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        for value in 0..10 {
            store.set_baseline(&device(), value).await.unwrap();
        }
        store.flush().await.unwrap();

        let reopened = FileBaselineStore::new(&path).await.unwrap();
        assert_eq!(reopened.get_baseline(&device().id).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_file_store_failed_write_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        let path = nested.join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        store.set_baseline(&device(), 10).await.unwrap();
        std::fs::remove_dir_all(&nested).unwrap();

        assert!(store.set_baseline(&device(), 15).await.is_err());
        assert_eq!(store.get_baseline(&device().id).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_file_store_cancelled_write_is_not_visible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("baselines.json");

        let store = FileBaselineStore::new(&path).await.unwrap();
        store.set_baseline(&device(), 10).await.unwrap();

        let device = device();
        let mut write = tokio_test::task::spawn(store.set_baseline(&device, 15));
        tokio_test::assert_pending!(write.poll());
        drop(write);

        assert_eq!(store.get_baseline(&device.id).await.unwrap(), Some(10));

        // The interrupted write may have reached the disk; flush puts back what readers saw
        store.flush().await.unwrap();
        let reopened = FileBaselineStore::new(&path).await.unwrap();
        assert_eq!(reopened.get_baseline(&device.id).await.unwrap(), Some(10));
    }
}
