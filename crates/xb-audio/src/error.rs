//! Device error types

use thiserror::Error;
use xb_core::XbError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device not open: {0}")]
    NotOpen(String),

    #[error("Timed out waiting for a device period")]
    Timeout,

    #[error("Device closed")]
    Closed,

    #[error("Invalid device configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl From<DeviceError> for XbError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotOpen(name) => XbError::NotInitialized(format!("device '{}' is not open", name)),
            DeviceError::InvalidConfig(msg) => XbError::InvalidParam(msg),
            other => XbError::Failed(other.to_string()),
        }
    }
}
