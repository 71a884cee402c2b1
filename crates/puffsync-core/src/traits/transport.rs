// # Transport Trait
//
// Defines the interface to the short-range radio stack that reaches the
// counting device.
//
// ## Shape
//
// A `Transport` selects devices and opens links. A `Link` is one live
// connection to one device: it resolves the counter channel, reads it once,
// and subscribes to pushed counter notifications.
//
// ## Usage
//
// ```rust,ignore
// use puffsync_core::traits::{CounterChannel, DeviceFilter, LinkEvent, Transport};
// use tokio_stream::StreamExt;
//
// async fn watch(transport: &dyn Transport) -> puffsync_core::Result<()> {
//     let device = transport.select_device(&DeviceFilter::default()).await?;
//     let link = transport.open_link(&device).await?;
//
//     let channel = CounterChannel::default();
//     link.resolve_channel(&channel).await?;
//     let mut events = link.subscribe(&channel).await?;
//     while let Some(LinkEvent::Value(bytes)) = events.next().await {
//         println!("counter: {:?}", puffsync_core::traits::decode_counter(&bytes));
//     }
//     Ok(())
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Service exposing the counter characteristic
pub const PUFF_SERVICE_UUID: &str = "9fcefd20-3f2a-4d7b-9b42-9b2ea9f6b0a1";

/// Characteristic carrying the little-endian `u32` counter
pub const PUFF_COUNT_UUID: &str = "9fcefd21-3f2a-4d7b-9b42-9b2ea9f6b0a1";

/// Advertised name prefix of compatible devices
pub const DEVICE_NAME_PREFIX: &str = "Purifier-ACQD";

/// Stable identity of a paired physical device
///
/// `id` is the baseline store key. It is stable across reconnects within a
/// pairing but may change after re-pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque identifier assigned by the radio stack
    pub id: String,
    /// Advertised name, if the device exposed one
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Criteria handed to the radio stack when selecting a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Only offer devices whose advertised name starts with this prefix
    pub name_prefix: Option<String>,
    /// Services the device must advertise
    pub services: Vec<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_prefix: Some(DEVICE_NAME_PREFIX.to_string()),
            services: vec![PUFF_SERVICE_UUID.to_string()],
        }
    }
}

/// Well-known service/characteristic pair of the counter notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterChannel {
    pub service: String,
    pub characteristic: String,
}

impl Default for CounterChannel {
    fn default() -> Self {
        Self {
            service: PUFF_SERVICE_UUID.to_string(),
            characteristic: PUFF_COUNT_UUID.to_string(),
        }
    }
}

/// Item pushed by a subscribed link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw characteristic value as delivered by the device
    Value(Vec<u8>),
    /// The peer went away. The stream may also simply end, which means the same.
    Lost { reason: String },
}

/// Stream of link events returned by [`Link::subscribe`]
pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send + 'static>>;

/// Decode a counter payload.
///
/// The device reports the counter as a little-endian `u32` in the first
/// four bytes. Shorter payloads are malformed and yield `None`.
pub fn decode_counter(bytes: &[u8]) -> Option<u32> {
    let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}

/// Trait for radio stack implementations
///
/// # Failure mapping
///
/// Implementations translate platform failures into the core taxonomy:
///
/// - no radio on this host → [`Error::TransportUnavailable`](crate::Error::TransportUnavailable)
/// - chooser dismissed / discovery aborted → [`Error::SelectionCancelled`](crate::Error::SelectionCancelled)
/// - access refused → [`Error::PermissionDenied`](crate::Error::PermissionDenied)
/// - anything during link negotiation → [`Error::HandshakeFailed`](crate::Error::HandshakeFailed)
///
/// # Blocking
///
/// `select_device` may legitimately wait until a peer is found or the
/// selection is cancelled. Every other method must resolve.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether this host has radio capability at all
    fn is_available(&self) -> bool {
        true
    }

    /// Let the user (or a policy) pick a device matching `filter`
    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity, crate::Error>;

    /// Establish the logical link to a previously selected device
    async fn open_link(&self, device: &DeviceIdentity) -> Result<Box<dyn Link>, crate::Error>;
}

/// One live connection to one device
#[async_trait]
pub trait Link: Send + Sync {
    /// Whether the link still reports itself as connected
    fn is_connected(&self) -> bool;

    /// Resolve the counter channel by its well-known identifiers
    async fn resolve_channel(&self, channel: &CounterChannel) -> Result<(), crate::Error>;

    /// One-shot read of the channel's current value
    async fn read_value(&self, channel: &CounterChannel) -> Result<Vec<u8>, crate::Error>;

    /// Start notifications on the channel
    ///
    /// The returned stream yields every pushed value in arrival order and
    /// reports link loss either with [`LinkEvent::Lost`] or by ending.
    async fn subscribe(&self, channel: &CounterChannel) -> Result<LinkEventStream, crate::Error>;

    /// Caller-initiated release of the link
    async fn disconnect(&self) -> Result<(), crate::Error>;
}
