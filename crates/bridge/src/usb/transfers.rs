//! Bulk and control transfer helpers
//!
//! Bulk transfers never hand libusb an unbounded timeout. Long or infinite
//! waits are cut into slices so a concurrent close is noticed promptly.

use common::TransportError;
use std::time::{Duration, Instant};

/// Upper bound of one blocking bulk transfer
pub const TRANSFER_SLICE: Duration = Duration::from_millis(100);

/// Timeout of control requests issued while configuring a port
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Length of the modem/line status header FTDI chips prepend to every packet
pub const FTDI_STATUS_LEN: usize = 2;

/// Map a libusb error onto the transport error seen by the core
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            TransportError::NotFound(err.to_string())
        }
        rusb::Error::Access => TransportError::AccessDenied(err.to_string()),
        rusb::Error::InvalidParam | rusb::Error::NotSupported => {
            TransportError::UnsupportedParameter(err.to_string())
        }
        _ => TransportError::Io(err.to_string()),
    }
}

/// Timeout for the next bulk transfer slice; `None` once `deadline` passed
pub fn next_slice(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(now);
            (!remaining.is_zero()).then(|| remaining.min(TRANSFER_SLICE))
        }
        None => Some(TRANSFER_SLICE),
    }
}

/// Remove the FTDI status header from each packet of `buf[..len]` in place
///
/// Returns the number of payload bytes left at the front of `buf`.
pub fn strip_ftdi_status(buf: &mut [u8], len: usize, packet_size: usize) -> usize {
    if packet_size <= FTDI_STATUS_LEN {
        return 0;
    }

    let mut out = 0;
    let mut start = 0;
    while start < len {
        let end = (start + packet_size).min(len);
        let payload = start + FTDI_STATUS_LEN;
        if payload < end {
            buf.copy_within(payload..end, out);
            out += end - payload;
        }
        start = end;
    }
    out
}
