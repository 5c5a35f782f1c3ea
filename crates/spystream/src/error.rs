//! Error types for spystream operations.

use thiserror::Error;

/// Result type for spystream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes matching libairspy enum values (for cross-compatibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AirspyErrorCode {
    /// Operation successful.
    Success = 0,
    /// True (for boolean returns).
    True = 1,
    /// Parameter invalid.
    InvalidParam = -2,
    /// No Airspy device found.
    NotFound = -5,
    /// Device is busy.
    Busy = -6,
    /// Out of memory.
    NoMem = -11,
    /// Operation not supported.
    Unsupported = -12,
    /// LibUSB error.
    Libusb = -1000,
    /// Thread error.
    Thread = -1001,
    /// Streaming thread error.
    StreamingThreadErr = -1002,
    /// Streaming stopped.
    StreamingStopped = -1003,
    /// Other error.
    Other = -9999,
}

impl AirspyErrorCode {
    /// Get a human-readable name for the error code.
    pub fn name(self) -> &'static str {
        match self {
            AirspyErrorCode::Success => "AIRSPY_SUCCESS",
            AirspyErrorCode::True => "AIRSPY_TRUE",
            AirspyErrorCode::InvalidParam => "AIRSPY_ERROR_INVALID_PARAM",
            AirspyErrorCode::NotFound => "AIRSPY_ERROR_NOT_FOUND",
            AirspyErrorCode::Busy => "AIRSPY_ERROR_BUSY",
            AirspyErrorCode::NoMem => "AIRSPY_ERROR_NO_MEM",
            AirspyErrorCode::Unsupported => "AIRSPY_ERROR_UNSUPPORTED",
            AirspyErrorCode::Libusb => "AIRSPY_ERROR_LIBUSB",
            AirspyErrorCode::Thread => "AIRSPY_ERROR_THREAD",
            AirspyErrorCode::StreamingThreadErr => "AIRSPY_ERROR_STREAMING_THREAD_ERR",
            AirspyErrorCode::StreamingStopped => "AIRSPY_ERROR_STREAMING_STOPPED",
            AirspyErrorCode::Other => "AIRSPY_ERROR_OTHER",
        }
    }
}

/// Errors that can occur during Airspy operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration (unsupported sample type, bad filter kernel, ...).
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// The operation conflicts with the current stream state.
    #[error("Device busy: operation not allowed while streaming")]
    Busy,

    /// Buffer or filter state allocation failed.
    #[error("Out of memory while allocating {0}")]
    NoMemory(&'static str),

    /// USB operation failed.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No Airspy device found.
    #[error("No Airspy device found")]
    DeviceNotFound,

    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    /// Control transfer failed.
    #[error("Control transfer failed: {0}")]
    ControlTransferFailed(String),

    /// Invalid response from device.
    #[error("Invalid device response: {0}")]
    InvalidResponse(String),

    /// Bulk transfer submission or event handling failed.
    #[error("Streaming error: {0}")]
    StreamingError(String),

    /// A streaming thread could not be spawned.
    #[error("Failed to spawn streaming thread: {0}")]
    Thread(#[source] std::io::Error),

    /// A bulk transfer completed with an error and streaming was disabled.
    #[error("Streaming thread error: a bulk transfer failed")]
    StreamingThread,

    /// The stream ended without being asked to stop.
    #[error("Streaming stopped unexpectedly")]
    StreamingStopped,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error onto the libairspy error code space.
    pub fn code(&self) -> AirspyErrorCode {
        match self {
            Error::InvalidParam(_) => AirspyErrorCode::InvalidParam,
            Error::Busy => AirspyErrorCode::Busy,
            Error::NoMemory(_) => AirspyErrorCode::NoMem,
            Error::Usb(_)
            | Error::OpenFailed(_)
            | Error::ControlTransferFailed(_)
            | Error::InvalidResponse(_)
            | Error::StreamingError(_) => AirspyErrorCode::Libusb,
            Error::DeviceNotFound => AirspyErrorCode::NotFound,
            Error::Thread(_) => AirspyErrorCode::Thread,
            Error::StreamingThread => AirspyErrorCode::StreamingThreadErr,
            Error::StreamingStopped => AirspyErrorCode::StreamingStopped,
            Error::Other(_) => AirspyErrorCode::Other,
        }
    }

    /// Create an invalid-parameter error with a custom message
    pub fn invalid_param<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParam(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_code_mapping() {
        assert_eq!(Error::Busy.code(), AirspyErrorCode::Busy);
        assert_eq!(Error::NoMemory("queue").code(), AirspyErrorCode::NoMem);
        assert_eq!(
            Error::Usb(rusb::Error::Pipe).code(),
            AirspyErrorCode::Libusb
        );
        assert_eq!(
            Error::StreamingThread.code(),
            AirspyErrorCode::StreamingThreadErr
        );
        assert_eq!(Error::DeviceNotFound.code(), AirspyErrorCode::NotFound);
    }

    #[test]
    fn test_code_names() {
        assert_eq!(AirspyErrorCode::Busy.name(), "AIRSPY_ERROR_BUSY");
        assert_eq!(
            Error::StreamingStopped.code().name(),
            "AIRSPY_ERROR_STREAMING_STOPPED"
        );
        assert_eq!(AirspyErrorCode::Busy as i32, -6);
    }

    #[test]
    fn test_thread_error_source() {
        let err = Error::Thread(std::io::Error::other("no threads left"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("no threads left"));
    }

    #[test]
    fn test_invalid_param_display() {
        let err = Error::invalid_param("kernel length must be odd");
        assert_eq!(err.to_string(), "Invalid parameter: kernel length must be odd");
    }
}
