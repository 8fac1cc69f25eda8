//! Error types for vdec-pipeline-core

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for vdec-pipeline-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Device a failure originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Hardware video decoder
    Decoder,
    /// Scaler / colour converter
    PostProcessor,
    /// Framebuffer
    Presenter,
    /// Encoded input stream
    Input,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Decoder => "decoder",
            DeviceKind::PostProcessor => "post-processor",
            DeviceKind::Presenter => "presenter",
            DeviceKind::Input => "input",
        };
        f.write_str(name)
    }
}

/// Error types for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// Invalid or inconsistent configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Codec not supported
    #[error("Codec not supported: {0}")]
    CodecNotSupported(String),

    /// A device operation failed
    #[error("{device} {operation} failed: {message}")]
    Device {
        device: DeviceKind,
        operation: &'static str,
        message: String,
    },

    /// A device did not complete an operation in time
    #[error("{device} {operation} timed out after {timeout:?}")]
    Timeout {
        device: DeviceKind,
        operation: &'static str,
        timeout: Duration,
    },

    /// Buffer ownership bookkeeping is inconsistent
    #[error("Buffer protocol violation: {0}")]
    Protocol(String),

    /// Malformed or oversized bitstream data
    #[error("Bitstream error: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Shorthand for a device failure
    pub fn device(device: DeviceKind, operation: &'static str, message: impl Into<String>) -> Self {
        Error::Device {
            device,
            operation,
            message: message.into(),
        }
    }

    /// Shorthand for a completion timeout
    pub fn timeout(device: DeviceKind, operation: &'static str, timeout: Duration) -> Self {
        Error::Timeout {
            device,
            operation,
            timeout,
        }
    }

    /// Whether this is a completion timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Device the error came from, if any
    pub fn device_kind(&self) -> Option<DeviceKind> {
        match self {
            Error::Device { device, .. } | Error::Timeout { device, .. } => Some(*device),
            _ => None,
        }
    }

    /// Convert to FFI error code
    pub fn to_ffi_code(&self) -> i32 {
        match self {
            Error::FileNotFound(_) => 1,
            Error::InvalidConfig(_) => 2,
            Error::CodecNotSupported(_) => 3,
            Error::Device { .. } => 4,
            Error::Timeout { .. } => 5,
            Error::Protocol(_) => 6,
            Error::Parse(_) => 7,
            Error::Io(_) => 1,
            Error::Channel(_) => 99,
            Error::Unknown(_) => 99,
        }
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(e: crossbeam_channel::RecvError) -> Self {
        Error::Channel(e.to_string())
    }
}

impl From<crossbeam_channel::RecvTimeoutError> for Error {
    fn from(e: crossbeam_channel::RecvTimeoutError) -> Self {
        Error::Channel(e.to_string())
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(e: crossbeam_channel::SendError<T>) -> Self {
        Error::Channel(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::FileNotFound(PathBuf::new()).to_ffi_code(), 1);
        assert_eq!(Error::Protocol("x".into()).to_ffi_code(), 6);
        assert_eq!(
            Error::device(DeviceKind::Decoder, "queue", "EINVAL").to_ffi_code(),
            4
        );
    }

    #[test]
    fn test_device_error_message() {
        let err = Error::device(DeviceKind::PostProcessor, "submit input", "EBUSY");
        assert_eq!(err.to_string(), "post-processor submit input failed: EBUSY");
        assert_eq!(err.device_kind(), Some(DeviceKind::PostProcessor));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeout() {
        let err = Error::timeout(DeviceKind::Decoder, "retrieve output", Duration::from_millis(20));
        assert!(err.is_timeout());
        assert_eq!(err.to_ffi_code(), 5);
    }
}
