//! Test utilities for usb-serial-bridge
//!
//! Provides a scripted [`MockHost`] standing in for the operating system's
//! USB stack and a [`RecordingSink`] that captures consumer notifications.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockHost, mock_raw_device};
//! use common::DeviceHost;
//!
//! let host = MockHost::new();
//! host.add_device(mock_raw_device("/dev/bus/usb/001/004", 0x1a86, 0x7523), None, true);
//! assert_eq!(host.list_devices().len(), 1);
//! ```

use crate::error::TransportError;
use crate::events::{EventSink, SerialEvent};
use crate::host::{DeviceConnection, DeviceHost, PermissionCallback, SerialPort};
use crate::sync::{lock, wait_until};
use crate::types::{DriverKind, LineParameters, RawDevice};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Max packet size reported by mock ports
pub const MOCK_MAX_PACKET_SIZE: usize = 64;

/// Create a mock RawDevice with a vendor-specific interface
pub fn mock_raw_device(path: &str, vendor_id: u16, product_id: u16) -> RawDevice {
    RawDevice {
        path: path.to_string(),
        vendor_id,
        product_id,
        manufacturer: Some(format!("Test Manufacturer {:04x}", vendor_id)),
        product: Some(format!("Test Product {:04x}", product_id)),
        interface_classes: vec![0xFF],
    }
}

/// Create a mock CH340 adapter on bus 1
pub fn mock_ch340(address: u8) -> RawDevice {
    mock_raw_device(&format!("/dev/bus/usb/001/{:03}", address), 0x1A86, 0x7523)
}

/// How the mock host answers permission requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionPolicy {
    /// Hold the request until `resolve_permission` is called
    Manual,
    /// Grant from a separate thread
    AutoGrant,
    /// Deny from a separate thread
    AutoDeny,
}

struct MockDevice {
    raw: RawDevice,
    driver: Option<DriverKind>,
    permission: bool,
}

struct MockHostState {
    devices: Vec<MockDevice>,
    policy: PermissionPolicy,
    permission_requests: Vec<String>,
    pending: HashMap<String, Vec<PermissionCallback>>,
    failing_opens: HashSet<String>,
    rejected_bauds: HashSet<u32>,
    ports: HashMap<String, Arc<MockPort>>,
    open_count: usize,
}

/// Scripted host implementation
pub struct MockHost {
    state: Mutex<MockHostState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockHostState {
                devices: Vec::new(),
                policy: PermissionPolicy::Manual,
                permission_requests: Vec::new(),
                pending: HashMap::new(),
                failing_opens: HashSet::new(),
                rejected_bauds: HashSet::new(),
                ports: HashMap::new(),
                open_count: 0,
            }),
        }
    }

    /// Attach a device; `driver` is what the built-in probe reports
    pub fn add_device(&self, raw: RawDevice, driver: Option<DriverKind>, permission: bool) {
        lock(&self.state).devices.push(MockDevice {
            raw,
            driver,
            permission,
        });
    }

    /// Detach a device; its open port (if any) starts failing reads
    pub fn remove_device(&self, path: &str) {
        let port = {
            let mut state = lock(&self.state);
            state.devices.retain(|d| d.raw.path != path);
            state.ports.get(path).cloned()
        };
        if let Some(port) = port {
            port.push_read_error(TransportError::NotFound(path.to_string()));
        }
    }

    pub fn set_permission_policy(&self, policy: PermissionPolicy) {
        lock(&self.state).policy = policy;
    }

    /// Paths for which `request_permission` was called, in call order
    pub fn permission_requests(&self) -> Vec<String> {
        lock(&self.state).permission_requests.clone()
    }

    pub fn permission_request_count(&self) -> usize {
        lock(&self.state).permission_requests.len()
    }

    /// Resolve held permission requests for `path`
    ///
    /// Callbacks run on a new thread, like a host security prompt would.
    /// Returns false if nothing was pending.
    pub fn resolve_permission(&self, path: &str, granted: bool) -> bool {
        let callbacks = {
            let mut state = lock(&self.state);
            if granted {
                for device in state.devices.iter_mut().filter(|d| d.raw.path == path) {
                    device.permission = true;
                }
            }
            state.pending.remove(path).unwrap_or_default()
        };

        if callbacks.is_empty() {
            return false;
        }

        let handle = std::thread::spawn(move || {
            for callback in callbacks {
                callback(granted);
            }
        });
        let _ = handle.join();
        true
    }

    /// Make `open_connection` fail for `path`
    pub fn fail_open(&self, path: &str) {
        lock(&self.state).failing_opens.insert(path.to_string());
    }

    /// Make every port reject this baud rate
    pub fn reject_baud_rate(&self, baud_rate: u32) {
        lock(&self.state).rejected_bauds.insert(baud_rate);
    }

    /// Most recently opened port for `path`
    pub fn port(&self, path: &str) -> Option<Arc<MockPort>> {
        lock(&self.state).ports.get(path).cloned()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }
}

impl DeviceHost for MockHost {
    fn list_devices(&self) -> Vec<RawDevice> {
        lock(&self.state)
            .devices
            .iter()
            .map(|d| d.raw.clone())
            .collect()
    }

    fn classify(&self, device: &RawDevice) -> Option<DriverKind> {
        lock(&self.state)
            .devices
            .iter()
            .find(|d| d.raw.path == device.path)
            .and_then(|d| d.driver)
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        lock(&self.state)
            .devices
            .iter()
            .any(|d| d.raw.path == device.path && d.permission)
    }

    fn request_permission(&self, device: &RawDevice, on_resolved: PermissionCallback) {
        let policy = {
            let mut state = lock(&self.state);
            state.permission_requests.push(device.path.clone());
            if state.policy == PermissionPolicy::Manual {
                state
                    .pending
                    .entry(device.path.clone())
                    .or_default()
                    .push(on_resolved);
                return;
            }
            if state.policy == PermissionPolicy::AutoGrant {
                for d in state.devices.iter_mut().filter(|d| d.raw.path == device.path) {
                    d.permission = true;
                }
            }
            state.policy
        };

        let granted = policy == PermissionPolicy::AutoGrant;
        std::thread::spawn(move || on_resolved(granted));
    }

    fn open_connection(
        &self,
        device: &RawDevice,
        driver: DriverKind,
    ) -> Result<Box<dyn DeviceConnection>, TransportError> {
        let mut state = lock(&self.state);
        if state.failing_opens.contains(&device.path) {
            return Err(TransportError::Io(format!(
                "Failed to open {}",
                device.path
            )));
        }
        if !state.devices.iter().any(|d| d.raw.path == device.path) {
            return Err(TransportError::NotFound(device.path.clone()));
        }

        let port = Arc::new(MockPort::new(
            driver,
            state.rejected_bauds.iter().copied().collect(),
        ));
        state.ports.insert(device.path.clone(), Arc::clone(&port));
        state.open_count += 1;

        Ok(Box::new(MockConnection { port }))
    }
}

struct MockConnection {
    port: Arc<MockPort>,
}

impl DeviceConnection for MockConnection {
    fn open_port(self: Box<Self>) -> Result<Arc<dyn SerialPort>, TransportError> {
        Ok(self.port)
    }
}

enum ReadScript {
    Data(Vec<u8>),
    Error(TransportError),
}

/// Scripted serial port
pub struct MockPort {
    driver: DriverKind,
    inbound: Mutex<VecDeque<ReadScript>>,
    inbound_cond: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    writes_cond: Condvar,
    write_error: Mutex<Option<TransportError>>,
    rejected_bauds: HashSet<u32>,
    parameters: Mutex<Option<LineParameters>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MockPort {
    fn new(driver: DriverKind, rejected_bauds: HashSet<u32>) -> Self {
        Self {
            driver,
            inbound: Mutex::new(VecDeque::new()),
            inbound_cond: Condvar::new(),
            writes: Mutex::new(Vec::new()),
            writes_cond: Condvar::new(),
            write_error: Mutex::new(None),
            rejected_bauds,
            parameters: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Queue bytes for the next read
    pub fn push_read(&self, data: &[u8]) {
        lock(&self.inbound).push_back(ReadScript::Data(data.to_vec()));
        self.inbound_cond.notify_all();
    }

    /// Queue a failure for the next read
    pub fn push_read_error(&self, error: TransportError) {
        lock(&self.inbound).push_back(ReadScript::Error(error));
        self.inbound_cond.notify_all();
    }

    /// Make every following write fail
    pub fn fail_writes(&self, error: TransportError) {
        *lock(&self.write_error) = Some(error);
    }

    /// Every transport write call, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Concatenation of all written bytes
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.writes).concat()
    }

    /// Wait until at least `len` bytes have been written
    pub fn wait_for_written(&self, len: usize, timeout: Duration) -> bool {
        let guard = lock(&self.writes);
        let (_guard, met) = wait_until(&self.writes_cond, guard, timeout, |writes| {
            writes.iter().map(Vec::len).sum::<usize>() >= len
        });
        met
    }

    pub fn parameters(&self) -> Option<LineParameters> {
        *lock(&self.parameters)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

impl SerialPort for MockPort {
    fn max_packet_size(&self) -> usize {
        MOCK_MAX_PACKET_SIZE
    }

    fn set_parameters(&self, params: &LineParameters) -> Result<(), TransportError> {
        if self.rejected_bauds.contains(&params.baud_rate) {
            return Err(TransportError::UnsupportedParameter(format!(
                "baud rate {}",
                params.baud_rate
            )));
        }
        *lock(&self.parameters) = Some(*params);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let mut inbound = lock(&self.inbound);
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            match inbound.pop_front() {
                Some(ReadScript::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        let rest = data.split_off(n);
                        inbound.push_front(ReadScript::Data(rest));
                    }
                    return Ok(n);
                }
                Some(ReadScript::Error(e)) => return Err(e),
                None => {}
            }

            match timeout {
                None => {
                    inbound = self
                        .inbound_cond
                        .wait(inbound)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                Some(t) => {
                    let (guard, met) = wait_until(&self.inbound_cond, inbound, t, |q| {
                        !q.is_empty() || self.closed.load(Ordering::SeqCst)
                    });
                    inbound = guard;
                    if !met {
                        return Ok(0);
                    }
                }
            }
        }
    }

    fn write(&self, data: &[u8], _timeout: Option<Duration>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Some(e) = lock(&self.write_error).clone() {
            return Err(e);
        }
        lock(&self.writes).push(data.to_vec());
        self.writes_cond.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        // Take the lock so a reader between its closed check and wait sees the wakeup
        let _inbound = lock(&self.inbound);
        self.closed.store(true, Ordering::SeqCst);
        self.inbound_cond.notify_all();
        Ok(())
    }
}

/// Event sink that records every notification
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SerialEvent>>,
    cond: Condvar,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SerialEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// Error messages, in order
    pub fn errors(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                SerialEvent::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Connected-state notifications for `port`, in order
    pub fn connection_changes(&self, port: &str) -> Vec<bool> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                SerialEvent::ConnectedStateChanged {
                    port: p,
                    connected,
                } if p == port => Some(*connected),
                _ => None,
            })
            .collect()
    }

    /// All bytes received on `port`, concatenated
    pub fn received(&self, port: &str) -> Vec<u8> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                SerialEvent::DataReceived { port: p, data } if p == port => Some(data.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    /// Wait until `pred` holds over the recorded events
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[SerialEvent]) -> bool,
    {
        let guard = lock(&self.events);
        let (_guard, met) = wait_until(&self.cond, guard, timeout, |events| pred(events));
        met
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SerialEvent) {
        lock(&self.events).push(event);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_port_read_write() {
        let host = MockHost::new();
        let raw = mock_ch340(4);
        host.add_device(raw.clone(), Some(DriverKind::Ch34x), true);

        let port = host
            .open_connection(&raw, DriverKind::Ch34x)
            .unwrap()
            .open_port()
            .unwrap();
        let mock = host.port(&raw.path).unwrap();

        mock.push_read(b"hello");
        let mut buf = [0u8; 3];
        assert_eq!(port.read(&mut buf, None).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(port.read(&mut buf, None).unwrap(), 2);
        assert_eq!(
            port.read(&mut buf, Some(Duration::from_millis(10))).unwrap(),
            0
        );

        port.write(b"abc", None).unwrap();
        assert_eq!(mock.writes(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_mock_port_close_unblocks_read() {
        let host = MockHost::new();
        let raw = mock_ch340(5);
        host.add_device(raw.clone(), None, true);
        let port = host
            .open_connection(&raw, DriverKind::CdcAcm)
            .unwrap()
            .open_port()
            .unwrap();

        let reader = Arc::clone(&port);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf, None)
        });

        std::thread::sleep(Duration::from_millis(20));
        port.close().unwrap();
        assert_eq!(handle.join().unwrap(), Err(TransportError::Closed));
    }

    #[test]
    fn test_manual_permission_resolution() {
        let host = MockHost::new();
        let raw = mock_ch340(6);
        host.add_device(raw.clone(), None, false);

        let (tx, rx) = std::sync::mpsc::channel();
        host.request_permission(&raw, Box::new(move |granted| tx.send(granted).unwrap()));
        assert!(rx.try_recv().is_err());

        assert!(host.resolve_permission(&raw.path, true));
        assert!(rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap());
        assert!(host.has_permission(&raw));
        assert!(!host.resolve_permission(&raw.path, true));
    }
}
