//! Connection core error types

use common::{InvalidParameter, TransportError};
use thiserror::Error;

/// Failures surfaced by the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerialError {
    /// No open (or opening) port under this name
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// No attached device matches the selector
    #[error("No device matching {0}")]
    DeviceNotFound(String),

    /// The port name is already open or awaiting permission
    #[error("Port already open: {0}")]
    AlreadyOpen(String),

    /// The host declined access to the device
    #[error("USB permission denied for device {0}")]
    PermissionDenied(String),

    /// The transport or the parameter domain rejected the line parameters
    #[error("Parameters rejected: {0}")]
    ParameterRejected(String),

    /// The pending-write buffer cannot take the bytes
    #[error("Write buffer full: {pending} pending, {requested} requested, capacity {capacity}")]
    WriteBufferFull {
        pending: usize,
        requested: usize,
        capacity: usize,
    },

    /// Low-level transport failure
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The I/O worker could not be started
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerStateError),
}

impl From<TransportError> for SerialError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::UnsupportedParameter(msg) => SerialError::ParameterRejected(msg),
            other => SerialError::Transport(other),
        }
    }
}

impl From<InvalidParameter> for SerialError {
    fn from(e: InvalidParameter) -> Self {
        SerialError::ParameterRejected(e.to_string())
    }
}

/// Illegal worker state transitions and configuration changes
///
/// These are programming errors: retrying cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkerStateError {
    #[error("Worker already started")]
    AlreadyStarted,

    #[error("{0} is only configurable while the worker is stopped")]
    NotStopped(&'static str),

    #[error("Write buffer size {requested} is smaller than {pending} pending bytes")]
    BufferTooSmall { requested: usize, pending: usize },

    #[error("Failed to spawn worker thread")]
    SpawnFailed,
}

pub type Result<T> = std::result::Result<T, SerialError>;
