//! Link and transport error types.

use thiserror::Error;

/// Link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The device-permission service refused access
    #[error("permission denied for device {0}")]
    PermissionDenied(String),

    /// I/O failure on the hardware channel
    #[error("channel error: {0}")]
    Channel(String),

    /// Device is not a supported radio
    #[error("unsupported device {0}")]
    UnsupportedDevice(String),

    /// Configuration rejected by validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The transport worker is no longer running
    #[error("transport service stopped")]
    ServiceStopped,
}
