// # puffsync-core
//
// Core library for the puff-counting wearable's connection layer.
//
// ## Architecture Overview
//
// This library turns the device's raw, monotonically increasing counter into
// discrete usage events while the link to the device comes and goes:
// - **Transport / Link**: Traits for the short-range radio stack
// - **BaselineStore**: Trait for durable per-device reconciliation state
// - **CounterReconciler**: Reading → event logic, tolerant of resets and restarts
// - **ReconnectScheduler**: The single pending reconnection timer
// - **SessionBus**: Status transitions and puff events for subscribers
// - **DeviceSession**: Owns the link and wires everything together
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Radio and storage are injected behind traits
// 2. **Event-Driven**: Notifications are consumed as an async stream
// 3. **Durable Before Visible**: A baseline is persisted before its event is published
// 4. **Library-First**: The daemon is a thin wrapper over this crate
// 5. **No Globals**: Every session is an explicitly owned handle

pub mod traits;
pub mod bus;
pub mod reconciler;
pub mod scheduler;
pub mod session;
pub mod config;
pub mod error;
pub mod state;

// Re-export core types for convenience
pub use traits::{BaselineStore, DeviceIdentity, Link, LinkEvent, Transport};
pub use bus::{ConnectionStatus, PuffEvent, SessionBus, Subscription, Unsubscribe};
pub use reconciler::{reconcile, CounterReconciler};
pub use scheduler::{ReconnectScheduler, ReconnectStats};
pub use session::DeviceSession;
pub use config::{BaselineStoreConfig, ReconnectPolicy, SessionConfig};
pub use error::{Error, Result};
pub use state::{FileBaselineStore, MemoryBaselineStore};
