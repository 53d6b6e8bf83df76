//! libusb host for the connection core
//!
//! Enumeration, access checks, line configuration and bulk transfers for
//! USB serial adapters, plus the hot-plug event loop.

pub mod host;
pub mod line_coding;
pub mod port;
pub mod transfers;

pub use host::{HotplugWatcher, RusbHost, device_path};
pub use port::{UsbConnection, UsbSerialPort};
