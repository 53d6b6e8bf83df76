//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by host collaborators (enumeration, permission, transport)
///
/// `UnsupportedParameter` is kept apart from `Io` so callers can tell a
/// rejected line configuration from a broken port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unsupported parameter: {0}")]
    UnsupportedParameter(String),

    #[error("Transfer timed out")]
    Timeout,

    #[error("Port closed")]
    Closed,

    #[error("I/O failure: {0}")]
    Io(String),
}

impl TransportError {
    /// True when the error means the port can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_) | Self::NotFound(_))
    }
}
