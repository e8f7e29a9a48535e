//! Error types for usbhid-core.

use crate::backend::UsbError;
use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// No device or interface matched the open criteria.
    #[error("device not found: {0}")]
    NotFound(String),

    /// OS-level transfer or control-call failure (stall, permission, I/O).
    #[error("USB transport error: {0}")]
    Transport(String),

    /// Device was removed while the session was open.
    #[error("device disconnected")]
    Disconnected,

    /// Operation not available on the current backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Caller passed a buffer or argument the operation cannot use.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Value out of the accepted range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Attach the failing operation's name to a backend status.
    pub(crate) fn usb(op: &str, err: UsbError) -> Self {
        match err {
            UsbError::NoDevice => Self::Disconnected,
            UsbError::NotSupported => Self::Unsupported(op.to_string()),
            other => Self::Transport(format!("{op}: {other}")),
        }
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_device_maps_to_disconnected() {
        assert!(matches!(
            Error::usb("write", UsbError::NoDevice),
            Error::Disconnected
        ));
    }

    #[test]
    fn not_supported_maps_to_unsupported() {
        assert!(matches!(
            Error::usb("detach kernel driver", UsbError::NotSupported),
            Error::Unsupported(_)
        ));
    }

    #[test]
    fn other_statuses_map_to_transport_with_context() {
        let err = Error::usb("claim interface 2", UsbError::Busy);
        match err {
            Error::Transport(msg) => assert!(msg.starts_with("claim interface 2")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
