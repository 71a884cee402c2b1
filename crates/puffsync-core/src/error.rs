//! Error types for the puffsync core
//!
//! The connection variants form the taxonomy that callers of
//! [`DeviceSession`](crate::DeviceSession) match on. The remaining variants
//! cover the ambient concerns (storage, configuration, serialization).

use thiserror::Error;

/// Result type alias for puffsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the puffsync system
#[derive(Error, Debug)]
pub enum Error {
    /// The host has no radio capability. Never retried automatically.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Device selection was aborted by the user or caller. Never retried automatically.
    #[error("Device selection cancelled")]
    SelectionCancelled,

    /// Access to the radio or device was refused. Never retried automatically.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Lower-layer negotiation failed (link, channel resolution, priming read, subscribe)
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A previously live link went away without a caller-initiated teardown
    #[error("Unexpected disconnect: {0}")]
    UnexpectedDisconnect(String),

    /// A user-initiated teardown landed while this connect attempt was in flight
    #[error("Connect aborted: {0}")]
    ConnectAborted(String),

    /// Baseline store errors
    #[error("Baseline store error: {0}")]
    BaselineStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport-unavailable error
    pub fn transport_unavailable(msg: impl Into<String>) -> Self {
        Self::TransportUnavailable(msg.into())
    }

    /// Create a permission-denied error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Create an unexpected-disconnect error
    pub fn unexpected_disconnect(msg: impl Into<String>) -> Self {
        Self::UnexpectedDisconnect(msg.into())
    }

    /// Create a baseline store error
    pub fn baseline_store(msg: impl Into<String>) -> Self {
        Self::BaselineStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether a failed reconnection attempt with this error may be retried
    /// by the scheduler.
    ///
    /// Only link-level failures qualify. Capability, permission and selection
    /// failures need a human and end automatic reconnection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeFailed(_) | Self::UnexpectedDisconnect(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
