//! Configuration types for the puffsync system
//!
//! All structures deserialize with serde and fill in defaults for omitted
//! fields, so an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::state::{FileBaselineStore, MemoryBaselineStore};
use crate::traits::{BaselineStore, CounterChannel, DeviceFilter};

/// Main session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Criteria used when a new device has to be selected
    #[serde(default)]
    pub device_filter: DeviceFilter,

    /// Where the counter lives on the device
    #[serde(default)]
    pub counter_channel: CounterChannel,

    /// Automatic reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Baseline persistence
    #[serde(default)]
    pub baseline_store: BaselineStoreConfig,
}

impl SessionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.counter_channel.service.trim().is_empty() {
            return Err(crate::Error::config("Counter service id cannot be empty"));
        }
        if self.counter_channel.characteristic.trim().is_empty() {
            return Err(crate::Error::config(
                "Counter characteristic id cannot be empty",
            ));
        }

        self.reconnect.validate()?;
        self.baseline_store.validate()?;

        Ok(())
    }
}

/// Reconnection policy
///
/// With the defaults every attempt waits the same 1.2s and attempts continue
/// until one succeeds or the user disconnects. A multiplier above 1 turns
/// this into exponential backoff capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt after a loss (milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive attempts. `1.0` keeps the delay fixed.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Give up after this many failed attempts. `None` retries until success
    /// or user cancellation.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// A fixed-interval policy
    pub fn fixed(delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            backoff_multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Stop after `max_attempts` failed attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms.max(self.initial_delay_ms) as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt may follow `failed_attempts` failures
    pub fn allows_attempt(&self, failed_attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed_attempts < max)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(crate::Error::config(format!(
                "Reconnect backoff multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(crate::Error::config(format!(
                "Reconnect max delay ({}ms) is shorter than the initial delay ({}ms)",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(crate::Error::config(
                "Reconnect max attempts must be at least 1 (omit it to retry forever)",
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: None,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

/// Baseline store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BaselineStoreConfig {
    /// JSON file with atomic writes
    File {
        /// Path to the baseline file
        path: PathBuf,
    },

    /// In-memory store (not durable across restarts)
    #[default]
    Memory,
}

impl BaselineStoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BaselineStoreConfig::File { path } if path.as_os_str().is_empty() => Err(
                crate::Error::config("Baseline store path cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Build the configured store
    pub async fn open(&self) -> Result<Arc<dyn BaselineStore>, crate::Error> {
        self.validate()?;
        match self {
            BaselineStoreConfig::File { path } => {
                Ok(Arc::new(FileBaselineStore::new(path).await?))
            }
            BaselineStoreConfig::Memory => {
                tracing::warn!("Using in-memory baseline store; catch-up across restarts is disabled");
                Ok(Arc::new(MemoryBaselineStore::new()))
            }
        }
    }
}
