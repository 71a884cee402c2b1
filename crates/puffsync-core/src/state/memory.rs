// # Memory Baseline Store
//
// In-memory implementation of BaselineStore.
//
// ## Purpose
//
// Fast, non-durable store for tests and for embedders that persist
// baselines through their own channel.
//
// ## Crash Behavior
//
// - All baselines are lost on restart
// - The first reading after a restart is treated as having no baseline,
//   so usage that happened while the process was down is not reported

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use async_trait::async_trait;

use crate::traits::baseline_store::{BaselineRecord, BaselineStore};
use crate::traits::transport::DeviceIdentity;
use crate::Error;

/// In-memory baseline store
///
/// Clones share the same underlying map, which lets a test hand one clone
/// to a session and inspect the other.
///
/// # Example
///
/// ```rust,no_run
/// use puffsync_core::state::MemoryBaselineStore;
/// use puffsync_core::traits::{BaselineStore, DeviceIdentity};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryBaselineStore::new();
///     let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
///
///     store.set_baseline(&device, 42).await?;
///     assert_eq!(store.get_baseline(&device.id).await?, Some(42));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBaselineStore {
    inner: Arc<RwLock<HashMap<String, BaselineRecord>>>,
}

impl MemoryBaselineStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with baselines, as if left by an earlier process
    pub fn with_baselines<I>(baselines: I) -> Self
    where
        I: IntoIterator<Item = (DeviceIdentity, u32)>,
    {
        let records = baselines
            .into_iter()
            .map(|(device, value)| {
                let record = BaselineRecord::new(&device, value);
                (device.id, record)
            })
            .collect();

        Self {
            inner: Arc::new(RwLock::new(records)),
        }
    }

    /// Number of devices with a baseline
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the store holds no baselines
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl BaselineStore for MemoryBaselineStore {
    async fn get_baseline(&self, device_id: &str) -> Result<Option<u32>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get(device_id).map(|record| record.value))
    }

    async fn get_record(&self, device_id: &str) -> Result<Option<BaselineRecord>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.get(device_id).cloned())
    }

    async fn set_baseline(&self, device: &DeviceIdentity, value: u32) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.insert(device.id.clone(), BaselineRecord::new(device, value));
        Ok(())
    }

    async fn delete_baseline(&self, device_id: &str) -> Result<(), Error> {
        let mut guard = self.inner.write().await;
        guard.remove(device_id);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.keys().cloned().collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}
