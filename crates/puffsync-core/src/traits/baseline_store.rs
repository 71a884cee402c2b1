// # Baseline Store Trait
//
// Defines the interface for persistent reconciliation state.
//
// ## Purpose
//
// The baseline is the last counter value that was reconciled for a device.
// It is what lets a freshly started process turn "the device says 70" into
// "20 puffs happened while nobody was watching" instead of losing them.
//
// ## Implementations
//
// - File-based JSON store with atomic writes: `state::FileBaselineStore`
// - In-memory store for tests and embedding: `state::MemoryBaselineStore`
//
// ## Usage
//
// ```rust,ignore
// use puffsync_core::traits::{BaselineStore, DeviceIdentity};
//
// async fn example(store: &dyn BaselineStore) -> puffsync_core::Result<()> {
//     let device = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
//
//     let previous = store.get_baseline(&device.id).await?;
//     store.set_baseline(&device, 42).await?;
//
//     Ok(())
// }
// ```

use async_trait::async_trait;

use crate::traits::transport::DeviceIdentity;

/// Persisted baseline for one device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BaselineRecord {
    /// Last reconciled raw counter value
    pub value: u32,
    /// Device name at the time of the last write
    #[serde(default)]
    pub device_name: Option<String>,
    /// Timestamp of the last write
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl BaselineRecord {
    /// Stores build records; callers only read them.
    pub(crate) fn new(device: &DeviceIdentity, value: u32) -> Self {
        Self {
            value,
            device_name: device.name.clone(),
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Trait for baseline store implementations
///
/// # Durability
///
/// A successful `set_baseline` must survive a process restart for any store
/// used in production. The reconciler relies on this before it lets an event
/// reach subscribers.
///
/// # Atomicity
///
/// Each write replaces one device's record as a unit. Concurrent readers see
/// either the old record or the new one, never a mix.
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Last reconciled counter value for a device
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))`: a baseline exists
    /// - `Ok(None)`: device never reconciled (or forgotten)
    /// - `Err(Error)`: storage error
    async fn get_baseline(&self, device_id: &str) -> Result<Option<u32>, crate::Error>;

    /// Full baseline record for a device
    async fn get_record(&self, device_id: &str) -> Result<Option<BaselineRecord>, crate::Error>;

    /// Create or overwrite the baseline for a device
    ///
    /// Must be durable when it returns `Ok`.
    async fn set_baseline(&self, device: &DeviceIdentity, value: u32) -> Result<(), crate::Error>;

    /// Delete a device's baseline ("forget device")
    ///
    /// Deleting a missing record is not an error.
    async fn delete_baseline(&self, device_id: &str) -> Result<(), crate::Error>;

    /// All device ids that have a baseline
    async fn list_devices(&self) -> Result<Vec<String>, crate::Error>;

    /// Persist anything still buffered
    async fn flush(&self) -> Result<(), crate::Error>;
}
