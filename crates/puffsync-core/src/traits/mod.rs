//! Core traits for the puffsync system
//!
//! Abstract interfaces to the collaborators this core depends on.
//!
//! - [`Transport`] / [`Link`]: the short-range radio stack
//! - [`BaselineStore`]: durable per-device reconciliation state

pub mod transport;
pub mod baseline_store;

pub use transport::{
    CounterChannel, DeviceFilter, DeviceIdentity, Link, LinkEvent, LinkEventStream, Transport,
    decode_counter, DEVICE_NAME_PREFIX, PUFF_COUNT_UUID, PUFF_SERVICE_UUID,
};
pub use baseline_store::{BaselineRecord, BaselineStore};
