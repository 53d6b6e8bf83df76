//! usb-serial-bridge host application
//!
//! Configuration loading, the libusb-backed [`common::DeviceHost`] and the
//! async session helpers used by the `usb-serial-bridge` binary.

pub mod config;
pub mod session;
pub mod usb;

pub use config::BridgeConfig;
pub use usb::{HotplugWatcher, RusbHost};
