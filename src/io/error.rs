// src/io/error.rs
//
// Device-level error type shared by all pollers.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    /// Open/connect failed or the handle went away.
    #[error("{device}: device unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("{device}: timed out during {operation}")]
    Timeout { device: String, operation: String },
    #[error("{device}: read failed: {reason}")]
    Read { device: String, reason: String },
    #[error("{device}: write failed: {reason}")]
    Write { device: String, reason: String },
    #[error("{device}: protocol error: {reason}")]
    Protocol { device: String, reason: String },
}

impl IoError {
    pub fn unavailable(device: &str, reason: impl Into<String>) -> Self {
        IoError::DeviceUnavailable { device: device.to_string(), reason: reason.into() }
    }

    pub fn timeout(device: &str, operation: impl Into<String>) -> Self {
        IoError::Timeout { device: device.to_string(), operation: operation.into() }
    }

    pub fn read(device: &str, reason: impl Into<String>) -> Self {
        IoError::Read { device: device.to_string(), reason: reason.into() }
    }

    pub fn write(device: &str, reason: impl Into<String>) -> Self {
        IoError::Write { device: device.to_string(), reason: reason.into() }
    }

    pub fn protocol(device: &str, reason: impl Into<String>) -> Self {
        IoError::Protocol { device: device.to_string(), reason: reason.into() }
    }

    /// Errors after which the handle must be dropped and reopened.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            IoError::DeviceUnavailable { .. } | IoError::Read { .. } | IoError::Write { .. }
        )
    }

    pub fn device(&self) -> &str {
        match self {
            IoError::DeviceUnavailable { device, .. }
            | IoError::Timeout { device, .. }
            | IoError::Read { device, .. }
            | IoError::Write { device, .. }
            | IoError::Protocol { device, .. } => device,
        }
    }
}
