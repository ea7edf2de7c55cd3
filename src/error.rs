// Error types for the Bean bridge

use bluer::Uuid;
use thiserror::Error;

/// Failures raised by the BLE transport.
#[derive(Debug, Error)]
pub enum BleError {
    #[error(transparent)]
    Bluetooth(#[from] bluer::Error),

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("link used before negotiation")]
    NotNegotiated,

    #[error("RSSI unavailable")]
    RssiUnavailable,

    #[error("device disconnected")]
    Disconnected,
}

/// Failures of the session manager.
///
/// Cloneable so one resolution outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("neither a device identifier nor a local name is configured")]
    NotConfigured,

    #[error("bluetooth scan failed: {0}")]
    ScanFailure(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// True for failures of the discover/connect/negotiate sequence. These
    /// are reported by the session manager itself.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            SessionError::ScanFailure(_)
                | SessionError::DeviceNotFound(_)
                | SessionError::ConnectionFailure(_)
                | SessionError::NegotiationFailure(_)
        )
    }
}
