//! Host collaborator interfaces
//!
//! The core never talks to the operating system directly. Enumeration,
//! access grants and the serial transport are provided by a [`DeviceHost`],
//! which may be libusb on a desktop, a platform USB service, or a scripted
//! mock in tests.

use crate::error::TransportError;
use crate::types::{DriverKind, LineParameters, RawDevice};
use std::sync::Arc;
use std::time::Duration;

/// Single-shot callback resolving a permission request (`true` = granted)
pub type PermissionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Enumeration, permission and connection services of the host
pub trait DeviceHost: Send + Sync {
    /// Currently attached devices; an empty list when nothing is attached
    fn list_devices(&self) -> Vec<RawDevice>;

    /// Built-in signature probing; `None` when no driver matches
    fn classify(&self, device: &RawDevice) -> Option<DriverKind>;

    fn has_permission(&self, device: &RawDevice) -> bool;

    /// Start the host access-grant flow and return immediately
    ///
    /// `on_resolved` is invoked exactly once, possibly from another thread.
    fn request_permission(&self, device: &RawDevice, on_resolved: PermissionCallback);

    /// Open a low-level connection to the device
    fn open_connection(
        &self,
        device: &RawDevice,
        driver: DriverKind,
    ) -> Result<Box<dyn DeviceConnection>, TransportError>;
}

/// An opened device from which a serial port can be acquired
pub trait DeviceConnection: Send {
    /// Acquire the first serial port of the device and open it
    fn open_port(self: Box<Self>) -> Result<Arc<dyn SerialPort>, TransportError>;
}

/// An open serial port
///
/// All methods take `&self`: the I/O worker reads and writes while the
/// connection manager may concurrently reconfigure or close the port.
/// `close` must make any blocked `read` return an error.
pub trait SerialPort: Send + Sync {
    /// Maximum packet size of the read endpoint
    fn max_packet_size(&self) -> usize;

    /// Apply line parameters; rejections use `TransportError::UnsupportedParameter`
    fn set_parameters(&self, params: &LineParameters) -> Result<(), TransportError>;

    /// Read into `buf`; `None` blocks until data arrives or the port closes
    ///
    /// Returns the number of bytes read; zero means nothing arrived in time.
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError>;

    /// Write all of `data`; `None` waits without limit
    fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}
