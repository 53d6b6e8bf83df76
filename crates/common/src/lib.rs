//! Common types for usb-serial-bridge
//!
//! This crate provides what the connection core and the concrete hosts
//! share: device and line-configuration types, the host collaborator
//! traits, the consumer event bridge, error handling and logging setup.

pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod sync;
pub mod test_utils;
pub mod types;

pub use error::{Error, Result, TransportError};
pub use events::{
    EventReceiver, EventSender, EventSink, NullSink, SerialEvent, create_event_bridge,
};
pub use host::{DeviceConnection, DeviceHost, PermissionCallback, SerialPort};
pub use logging::{hex_preview, setup_logging};
pub use types::{
    DataBits, DeviceDescriptor, DeviceSelector, DriverKind, DriverOverrides, InvalidParameter,
    LineParameters, Parity, RawDevice, STANDARD_BAUD_RATES, StopBits, parse_hex_id,
};
