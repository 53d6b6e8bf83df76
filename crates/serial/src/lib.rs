//! Connection lifecycle and I/O servicing for USB serial devices
//!
//! [`ConnectionManager`] is the entry point: it enumerates devices through a
//! [`common::DeviceHost`], obtains access through the [`PermissionGate`],
//! opens logical ports and runs one [`IoWorker`] thread per open port.
//! Everything observable happens either as a direct `Result` or as a
//! [`common::SerialEvent`] delivered to the configured sink.

pub mod error;
pub mod manager;
pub mod permission;
pub mod registry;
pub mod worker;

pub use error::{Result, SerialError, WorkerStateError};
pub use manager::{ConnectionManager, ManagerConfig, OpenOutcome, PortInfo, PortState};
pub use permission::{PermissionCheck, PermissionContinuation, PermissionGate, PermissionOutcome};
pub use registry::DeviceRegistry;
pub use worker::{
    DEFAULT_WRITE_BUFFER_SIZE, IoWorker, ThreadPriority, WorkerListener, WorkerSettings,
    WorkerState,
};
