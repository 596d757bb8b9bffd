//! Error types for the BLE radio shims

use tether_core::{RadioError, TetherError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Failures raised by a platform radio stack
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Bluetooth is powered off")]
    PoweredOff,

    #[error("Bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("Peripheral role is not supported on this platform")]
    PeripheralUnsupported,

    #[error("Device not known to the adapter: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Failed to start advertising: {0}")]
    AdvertisingFailed(String),

    #[error("Failed to register GATT service: {0}")]
    ServiceRegistrationFailed(String),

    #[error("Radio input channel closed")]
    InputChannelClosed,
}

impl From<BleTransportError> for TetherError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::AdapterNotAvailable | BleTransportError::PeripheralUnsupported => {
                RadioError::Unsupported.into()
            }
            BleTransportError::PoweredOff => RadioError::PoweredOff.into(),
            BleTransportError::PermissionDenied(_) => RadioError::Unauthorized.into(),
            BleTransportError::UnknownDevice { device_id } => {
                TetherError::Operation(tether_core::OperationError::DeviceNotFound { device_id })
            }
            BleTransportError::InputChannelClosed => {
                TetherError::channel_error("radio input channel closed")
            }
            other => TetherError::platform(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tether_core::ErrorCode;

    use super::*;

    #[test]
    fn permanent_conditions_map_to_radio_codes() {
        let err: TetherError = BleTransportError::PoweredOff.into();
        assert_eq!(err.code(), ErrorCode::PoweredOff);
        let err: TetherError = BleTransportError::PermissionDenied("denied".into()).into();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        let err: TetherError = BleTransportError::AdapterNotAvailable.into();
        assert_eq!(err.code(), ErrorCode::Unsupported);
    }

    #[test]
    fn stack_failures_are_platform_errors() {
        let err: TetherError = BleTransportError::WriteFailed("att error".into()).into();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("att error"));
    }
}
