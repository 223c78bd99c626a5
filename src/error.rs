//! Error types shared by the bus, streaming and host-facing layers.

use std::time::Duration;

/// Convenience alias used throughout the driver.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Failure reported by the USB bus for a single transfer or request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint halted by the device.
    #[error("endpoint stalled")]
    Stall,
    /// Request did not complete within its timeout.
    #[error("transfer timed out")]
    Timeout,
    /// Device is no longer attached.
    #[error("device not present")]
    NoDevice,
    /// Submission refused because the transfer is being killed.
    #[error("submission rejected while transfer is being killed")]
    Rejected,
    /// Transfer was cancelled before it completed.
    #[error("transfer cancelled")]
    Cancelled,
    /// Any other host controller failure.
    #[error("bus i/o error: {0}")]
    Io(String),
}

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Host requested a rate, format or stream type the device cannot do.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Streaming did not confirm its first transfer within the start window.
    #[error("stream failed to start within {0:?}")]
    IoTimeout(Duration),
    /// Bus-level submission or control failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The runtime has panicked (abort or disconnect) and refuses further work.
    #[error("device has been shut down")]
    DeviceShutdown,
    /// No substream is attached to serve the request.
    #[error("no such device or substream")]
    NoDevice,
    /// Registry has no free slot for another device.
    #[error("too many devices registered")]
    TooManyDevices,
    /// Resource is held by another user.
    #[error("resource busy")]
    Busy,
    /// A thread, mapping or buffer could not be allocated.
    #[error("resource allocation failed: {0}")]
    Resource(String),
    /// USB identifiers are not in the device table.
    #[error("unsupported device {vendor:04x}:{product:04x}")]
    UnsupportedDevice {
        /// USB vendor id.
        vendor: u16,
        /// USB product id.
        product: u16,
    },
}

const EINVAL: i32 = 22;
const EIO: i32 = 5;
const EPIPE: i32 = 32;
const ENODEV: i32 = 19;
const EBUSY: i32 = 16;
const ENOMEM: i32 = 12;
const ETIMEDOUT: i32 = 110;

impl DriverError {
    /// Negative errno expected by a host audio framework callback.
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::InvalidArgument(_) => -EINVAL,
            DriverError::IoTimeout(_) => -EIO,
            DriverError::Transport(TransportError::Timeout) => -ETIMEDOUT,
            DriverError::Transport(TransportError::NoDevice) => -ENODEV,
            DriverError::Transport(_) => -EIO,
            DriverError::DeviceShutdown => -EPIPE,
            DriverError::NoDevice | DriverError::UnsupportedDevice { .. } => -ENODEV,
            DriverError::TooManyDevices => -ENODEV,
            DriverError::Busy => -EBUSY,
            DriverError::Resource(_) => -ENOMEM,
        }
    }
}

/// Collapse an operation result into the status code a host callback returns.
pub fn translate_status(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_host_conventions() {
        assert_eq!(translate_status(Ok(())), 0);
        assert_eq!(DriverError::DeviceShutdown.errno(), -32);
        assert_eq!(DriverError::InvalidArgument("rate".into()).errno(), -22);
        assert_eq!(DriverError::IoTimeout(Duration::from_secs(1)).errno(), -5);
        assert_eq!(DriverError::from(TransportError::Stall).errno(), -5);
        assert_eq!(DriverError::from(TransportError::NoDevice).errno(), -19);
        assert_eq!(DriverError::Busy.errno(), -16);
    }

    #[test]
    fn transport_errors_render_through_driver_error() {
        let err = DriverError::from(TransportError::Io("babble".into()));
        assert_eq!(err.to_string(), "bus i/o error: babble");
    }
}
