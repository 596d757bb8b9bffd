//! Radio power/authorization state as reported by the platform

use serde::{Deserialize, Serialize};

use crate::errors::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_ready(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }

    /// Transient states resolve on their own; requests wait for them
    pub fn is_transient(&self) -> bool {
        matches!(self, RadioState::Unknown | RadioState::Resetting)
    }

    /// States that need the user or OS to act before anything can work
    pub fn is_permanent_failure(&self) -> bool {
        self.to_error().is_some()
    }

    pub fn to_error(&self) -> Option<RadioError> {
        match self {
            RadioState::PoweredOff => Some(RadioError::PoweredOff),
            RadioState::Unauthorized => Some(RadioError::Unauthorized),
            RadioState::Unsupported => Some(RadioError::Unsupported),
            _ => None,
        }
    }
}

impl From<&RadioError> for RadioState {
    fn from(error: &RadioError) -> Self {
        match error {
            RadioError::PoweredOff => RadioState::PoweredOff,
            RadioError::Unauthorized => RadioState::Unauthorized,
            RadioError::Unsupported => RadioState::Unsupported,
        }
    }
}

impl Default for RadioState {
    fn default() -> Self {
        RadioState::Unknown
    }
}
