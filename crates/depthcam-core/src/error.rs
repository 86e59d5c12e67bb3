//! Error taxonomy for the device registry

use thiserror::Error;

use crate::sdk::SdkError;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The physical device was removed or is not ready yet
    #[error("Device {uri} unavailable: {reason}")]
    DeviceUnavailable { uri: String, reason: String },
    /// The native binding has not been initialized with a valid library path
    #[error("Sensor SDK is not initialized")]
    SdkUninitialized,
}

impl RegistryError {
    /// Convert a raw native failure for the device at `uri`
    pub fn from_sdk(uri: &str, err: SdkError) -> Self {
        match err {
            SdkError::Uninitialized => Self::SdkUninitialized,
            SdkError::Unavailable(reason) => Self::DeviceUnavailable {
                uri: uri.to_string(),
                reason,
            },
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

/// Raised by strict decoding only; labeling falls back to the numeric code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityDecodeError {
    #[error("Unknown pixel format code {0}")]
    UnknownPixelFormat(u32),
}
