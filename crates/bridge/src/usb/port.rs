//! libusb-backed serial port
//!
//! A [`UsbConnection`] is an opened device whose interfaces are not yet
//! claimed. [`DeviceConnection::open_port`] claims the serial interfaces,
//! locates the bulk endpoints and yields a [`UsbSerialPort`].
//!
//! The port keeps its device handle behind an `RwLock`. Reads, writes and
//! control requests share the read side; `close` takes the write side, so it
//! waits at most one transfer slice for an in-flight read or write to return.
//! Writes go out one packet per transfer, so a timed-out slice has sent
//! nothing and can be retried.

use super::line_coding::{ControlRequest, enable_requests, line_coding_requests};
use super::transfers::{CONTROL_TIMEOUT, map_rusb_error, next_slice, strip_ftdi_status};
use common::{DeviceConnection, DriverKind, LineParameters, SerialPort, TransportError};
use rusb::{ConfigDescriptor, Context, Device, DeviceHandle, TransferType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const USB_CLASS_COMM: u8 = 0x02;
const USB_CLASS_CDC_DATA: u8 = 0x0A;
const ENDPOINT_DIR_IN: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLayout {
    pub address: u8,
    pub bulk: bool,
    pub max_packet_size: u16,
}

impl EndpointLayout {
    fn is_bulk_in(&self) -> bool {
        self.bulk && self.address & ENDPOINT_DIR_IN != 0
    }

    fn is_bulk_out(&self) -> bool {
        self.bulk && self.address & ENDPOINT_DIR_IN == 0
    }
}

/// First alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointLayout>,
}

/// Where the serial function of a device lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialEndpoints {
    /// Target of line-coding requests
    pub control_interface: u8,
    pub data_interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    /// Max packet size of the IN endpoint
    pub max_packet_size: usize,
}

impl SerialEndpoints {
    fn interfaces(&self) -> Vec<u8> {
        if self.control_interface == self.data_interface {
            vec![self.data_interface]
        } else {
            vec![self.control_interface, self.data_interface]
        }
    }
}

/// Pick the serial data interface and its bulk endpoints
///
/// A CDC data interface wins; otherwise the first interface carrying both a
/// bulk IN and a bulk OUT endpoint is used.
pub fn select_endpoints(interfaces: &[InterfaceLayout]) -> Option<SerialEndpoints> {
    let has_bulk_pair = |iface: &&InterfaceLayout| {
        iface.endpoints.iter().any(EndpointLayout::is_bulk_in)
            && iface.endpoints.iter().any(EndpointLayout::is_bulk_out)
    };

    let data = interfaces
        .iter()
        .filter(has_bulk_pair)
        .find(|iface| iface.class_code == USB_CLASS_CDC_DATA)
        .or_else(|| interfaces.iter().find(has_bulk_pair))?;

    let bulk_in = data.endpoints.iter().find(|ep| ep.is_bulk_in())?;
    let bulk_out = data.endpoints.iter().find(|ep| ep.is_bulk_out())?;

    let control_interface = interfaces
        .iter()
        .find(|iface| iface.class_code == USB_CLASS_COMM)
        .map_or(data.number, |iface| iface.number);

    Some(SerialEndpoints {
        control_interface,
        data_interface: data.number,
        bulk_in: bulk_in.address,
        bulk_out: bulk_out.address,
        max_packet_size: bulk_in.max_packet_size as usize,
    })
}

fn interface_layouts(config: &ConfigDescriptor) -> Vec<InterfaceLayout> {
    config
        .interfaces()
        .filter_map(|iface| iface.descriptors().next())
        .map(|desc| InterfaceLayout {
            number: desc.interface_number(),
            class_code: desc.class_code(),
            endpoints: desc
                .endpoint_descriptors()
                .map(|ep| EndpointLayout {
                    address: ep.address(),
                    bulk: ep.transfer_type() == TransferType::Bulk,
                    max_packet_size: ep.max_packet_size(),
                })
                .collect(),
        })
        .collect()
}

/// An opened USB device awaiting `open_port`
pub struct UsbConnection {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    driver: DriverKind,
    path: String,
}

impl UsbConnection {
    pub fn open(
        device: Device<Context>,
        driver: DriverKind,
        path: String,
    ) -> Result<Self, TransportError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", path, e);
            map_rusb_error(e)
        })?;
        debug!("Opened device {} ({})", path, driver);

        Ok(Self {
            device,
            handle,
            driver,
            path,
        })
    }

    /// Detach kernel drivers and claim `interfaces`, undoing on failure
    fn claim(&mut self, interfaces: &[u8]) -> Result<(), TransportError> {
        for (i, &number) in interfaces.iter().enumerate() {
            match self.handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {}", number);
                    if let Err(e) = self.handle.detach_kernel_driver(number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        number, e
                    );
                }
            }

            if let Err(e) = self.handle.claim_interface(number) {
                warn!("Failed to claim interface {} on {}: {}", number, self.path, e);
                release_interfaces(&mut self.handle, &interfaces[..i]);
                return Err(map_rusb_error(e));
            }
            debug!("Claimed interface {} on {}", number, self.path);
        }
        Ok(())
    }
}

impl DeviceConnection for UsbConnection {
    fn open_port(self: Box<Self>) -> Result<Arc<dyn SerialPort>, TransportError> {
        let mut conn = *self;

        let config = conn
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        let endpoints = select_endpoints(&interface_layouts(&config)).ok_or_else(|| {
            TransportError::NotFound(format!("no bulk serial interface on {}", conn.path))
        })?;
        debug!("Serial endpoints on {}: {:?}", conn.path, endpoints);

        let claimed = endpoints.interfaces();
        conn.claim(&claimed)?;

        for request in enable_requests(conn.driver, endpoints.control_interface) {
            if let Err(e) = send_control(&conn.handle, &request) {
                release_interfaces(&mut conn.handle, &claimed);
                return Err(e);
            }
        }

        Ok(Arc::new(UsbSerialPort {
            path: conn.path,
            driver: conn.driver,
            endpoints,
            claimed,
            handle: RwLock::new(Some(conn.handle)),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct UsbSerialPort {
    path: String,
    driver: DriverKind,
    endpoints: SerialEndpoints,
    claimed: Vec<u8>,
    handle: RwLock<Option<DeviceHandle<Context>>>,
    closed: AtomicBool,
}

impl UsbSerialPort {
    /// One bulk read of at most `slice`; `Ok(0)` on timeout
    fn read_slice(&self, buf: &mut [u8], slice: Duration) -> Result<usize, TransportError> {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        match handle.read_bulk(self.endpoints.bulk_in, buf, slice) {
            Ok(n) if self.driver == DriverKind::Ftdi => {
                Ok(strip_ftdi_status(buf, n, self.endpoints.max_packet_size))
            }
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    /// One bulk write of at most `slice`; `Ok(0)` on timeout
    fn write_slice(&self, data: &[u8], slice: Duration) -> Result<usize, TransportError> {
        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        match handle.write_bulk(self.endpoints.bulk_out, data, slice) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(map_rusb_error(e)),
        }
    }
}

impl SerialPort for UsbSerialPort {
    fn max_packet_size(&self) -> usize {
        self.endpoints.max_packet_size
    }

    fn set_parameters(&self, params: &LineParameters) -> Result<(), TransportError> {
        let requests =
            line_coding_requests(self.driver, params, self.endpoints.control_interface)?;

        let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;
        for request in &requests {
            send_control(handle, request)?;
        }
        debug!("Applied {} to {}", params, self.path);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }

            let Some(slice) = next_slice(deadline, Instant::now()) else {
                return Ok(0);
            };

            let n = self.read_slice(buf, slice)?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<(), TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let packet = self.endpoints.max_packet_size.max(1);

        let mut offset = 0;
        while offset < data.len() {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let Some(slice) = next_slice(deadline, Instant::now()) else {
                warn!(
                    "Write to {} timed out after {} of {} bytes",
                    self.path,
                    offset,
                    data.len()
                );
                return Err(TransportError::Timeout);
            };

            let end = (offset + packet).min(data.len());
            offset += self.write_slice(&data[offset..end], slice)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);

        let handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            release_interfaces(&mut handle, &self.claimed);
            debug!("Closed {}", self.path);
        }
        Ok(())
    }
}

fn send_control(
    handle: &DeviceHandle<Context>,
    request: &ControlRequest,
) -> Result<(), TransportError> {
    handle
        .write_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            &request.data,
            CONTROL_TIMEOUT,
        )
        .map(|_| ())
        .map_err(map_rusb_error)
}

/// Release interfaces and hand them back to the kernel
fn release_interfaces(handle: &mut DeviceHandle<Context>, interfaces: &[u8]) {
    for &number in interfaces {
        if let Err(e) = handle.release_interface(number) {
            warn!("Failed to release interface {}: {}", number, e);
        }
        if let Err(e) = handle.attach_kernel_driver(number) {
            debug!(
                "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                number, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(address: u8, max_packet_size: u16) -> EndpointLayout {
        EndpointLayout {
            address,
            bulk: true,
            max_packet_size,
        }
    }

    #[test]
    fn test_select_cdc_acm_endpoints() {
        let interrupt = EndpointLayout {
            address: 0x83,
            bulk: false,
            max_packet_size: 8,
        };
        let layout = vec![
            InterfaceLayout {
                number: 0,
                class_code: USB_CLASS_COMM,
                endpoints: vec![interrupt],
            },
            InterfaceLayout {
                number: 1,
                class_code: USB_CLASS_CDC_DATA,
                endpoints: vec![bulk(0x02, 64), bulk(0x81, 64)],
            },
        ];

        let endpoints = select_endpoints(&layout).unwrap();
        assert_eq!(endpoints.control_interface, 0);
        assert_eq!(endpoints.data_interface, 1);
        assert_eq!(endpoints.bulk_in, 0x81);
        assert_eq!(endpoints.bulk_out, 0x02);
        assert_eq!(endpoints.interfaces(), vec![0, 1]);
    }

    #[test]
    fn test_select_vendor_endpoints() {
        let layout = vec![InterfaceLayout {
            number: 0,
            class_code: 0xFF,
            endpoints: vec![bulk(0x82, 32), bulk(0x02, 32)],
        }];

        let endpoints = select_endpoints(&layout).unwrap();
        assert_eq!(endpoints.control_interface, 0);
        assert_eq!(endpoints.max_packet_size, 32);
        assert_eq!(endpoints.interfaces(), vec![0]);
    }

    #[test]
    fn test_select_requires_bulk_pair() {
        let layout = vec![InterfaceLayout {
            number: 0,
            class_code: 0xFF,
            endpoints: vec![bulk(0x81, 64)],
        }];
        assert!(select_endpoints(&layout).is_none());
        assert!(select_endpoints(&[]).is_none());
    }
}
