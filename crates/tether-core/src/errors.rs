//! Error types for the Tether protocol
//!
//! This module contains all error types used throughout the core: radio-state
//! errors, per-operation errors, cryptographic errors, storage errors, and the
//! `TetherError` type that unifies them. Every error maps onto an [`ErrorCode`]
//! so an upper layer can decide between "ask the user to enable Bluetooth",
//! "ask for permission" and "retry automatically".

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Codes
// ----------------------------------------------------------------------------

/// Stable, UI-facing error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PoweredOff,
    Unauthorized,
    Unsupported,
    DeviceNotFound,
    NotConnected,
    CharacteristicNotFound,
    InvalidPayload,
    Timeout,
    Disconnected,
    NoData,
    InvalidOffset,
    Superseded,
    InvalidTransition,
    ConnectionNotFound,
    Crypto,
    Storage,
    Internal,
}

impl ErrorCode {
    /// Whether the condition persists until the user or OS acts
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorCode::PoweredOff | ErrorCode::Unauthorized | ErrorCode::Unsupported
        )
    }

    /// Whether an automatic retry is a sensible reaction
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::Disconnected | ErrorCode::NotConnected
        )
    }
}

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Permanent radio-state errors, never retried automatically
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("Bluetooth is powered off")]
    PoweredOff,
    #[error("Bluetooth permission not granted")]
    Unauthorized,
    #[error("Bluetooth LE is not supported on this device")]
    Unsupported,
}

/// Per-call operation errors, returned to the immediate caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },
    #[error("Device not connected: {device_id}")]
    NotConnected { device_id: String },
    #[error("Characteristic {characteristic} not found on {device_id}")]
    CharacteristicNotFound {
        device_id: String,
        characteristic: String,
    },
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Device {device_id} disconnected")]
    Disconnected { device_id: String },
    #[error("No profile data available")]
    NoData,
    #[error("Read offset {offset} beyond value length {length}")]
    InvalidOffset { offset: usize, length: usize },
    #[error("Request superseded by a newer request")]
    Superseded,
    #[error("Invalid transition for {user_id}: {reason}")]
    InvalidTransition { user_id: String, reason: String },
    #[error("No connection for user {user_id}")]
    ConnectionNotFound { user_id: String },
    #[error("Platform error: {reason}")]
    Platform { reason: String },
}

/// Cryptographic failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key unwrap failed")]
    KeyUnwrapFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}

/// Storage boundary failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Record not found: {id}")]
    NotFound { id: String },
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Tether protocol
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Actor mailbox closed or reply dropped
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl TetherError {
    /// Classify this error for the upper layer
    pub fn code(&self) -> ErrorCode {
        match self {
            TetherError::Radio(RadioError::PoweredOff) => ErrorCode::PoweredOff,
            TetherError::Radio(RadioError::Unauthorized) => ErrorCode::Unauthorized,
            TetherError::Radio(RadioError::Unsupported) => ErrorCode::Unsupported,
            TetherError::Operation(op) => match op {
                OperationError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
                OperationError::NotConnected { .. } => ErrorCode::NotConnected,
                OperationError::CharacteristicNotFound { .. } => {
                    ErrorCode::CharacteristicNotFound
                }
                OperationError::InvalidPayload { .. } => ErrorCode::InvalidPayload,
                OperationError::Timeout { .. } => ErrorCode::Timeout,
                OperationError::Disconnected { .. } => ErrorCode::Disconnected,
                OperationError::NoData => ErrorCode::NoData,
                OperationError::InvalidOffset { .. } => ErrorCode::InvalidOffset,
                OperationError::Superseded => ErrorCode::Superseded,
                OperationError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
                OperationError::ConnectionNotFound { .. } => ErrorCode::ConnectionNotFound,
                OperationError::Platform { .. } => ErrorCode::Internal,
            },
            TetherError::Crypto(_) => ErrorCode::Crypto,
            TetherError::Storage(_) => ErrorCode::Storage,
            TetherError::Serialization(_) => ErrorCode::InvalidPayload,
            TetherError::Channel { .. } | TetherError::Configuration { .. } => ErrorCode::Internal,
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TetherError {
    /// Create an invalid payload error with a reason
    pub fn invalid_payload<T: Into<String>>(reason: T) -> Self {
        TetherError::Operation(OperationError::InvalidPayload {
            reason: reason.into(),
        })
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        TetherError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TetherError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a platform error wrapping a radio stack failure
    pub fn platform<T: Into<String>>(reason: T) -> Self {
        TetherError::Operation(OperationError::Platform {
            reason: reason.into(),
        })
    }

    /// Create a not-connected error
    pub fn not_connected<D: Into<String>>(device_id: D) -> Self {
        TetherError::Operation(OperationError::NotConnected {
            device_id: device_id.into(),
        })
    }

    /// Create a disconnected error
    pub fn disconnected<D: Into<String>>(device_id: D) -> Self {
        TetherError::Operation(OperationError::Disconnected {
            device_id: device_id.into(),
        })
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        TetherError::Operation(OperationError::Timeout { duration_ms })
    }

    /// Create a connection-not-found error
    pub fn connection_not_found<U: Into<String>>(user_id: U) -> Self {
        TetherError::Operation(OperationError::ConnectionNotFound {
            user_id: user_id.into(),
        })
    }

    /// Create an invalid transition error
    pub fn invalid_transition<U: Into<String>, R: Into<String>>(user_id: U, reason: R) -> Self {
        TetherError::Operation(OperationError::InvalidTransition {
            user_id: user_id.into(),
            reason: reason.into(),
        })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, TetherError>;
pub type TetherResult<T> = Result<T>;
