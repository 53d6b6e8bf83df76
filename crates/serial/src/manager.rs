//! Connection manager
//!
//! Owns the mapping from logical port names to open connections. Each name
//! moves through `Closed -> (Opening | AwaitingPermission) -> Open -> Closed`.
//! Opening a name that is already taken fails without touching the existing
//! connection.
//!
//! When the device lacks permission the open sequence is parked in the
//! permission gate and resumed from the host's callback thread. Every slot
//! carries a generation id, so a resumed open, or a worker reporting a
//! transport error, only acts on the slot it was created for. A port closed
//! or replaced in the meantime is left alone.
//!
//! A transport error tears the connection down on its own; a later `close`
//! of that name reports `PortNotFound`.

use crate::error::{Result, SerialError};
use crate::permission::{PermissionCheck, PermissionGate, PermissionOutcome};
use crate::registry::DeviceRegistry;
use crate::worker::{IoWorker, WorkerListener, WorkerSettings, WorkerState};
use common::sync::lock;
use common::{
    DeviceDescriptor, DeviceHost, DeviceSelector, DriverKind, DriverOverrides, EventSink,
    LineParameters, RawDevice, SerialEvent, SerialPort, TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak, mpsc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Manager-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Settings every new I/O worker starts with
    pub worker: WorkerSettings,
    /// Ask for permission as soon as a device is attached
    pub auto_request_permission: bool,
}

/// How an accepted `open` proceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The port is open and its worker is running
    Connected,
    /// Waiting on the host; the result arrives as an event
    AwaitingPermission,
}

/// Lifecycle position of a port name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Opening,
    AwaitingPermission,
    Open(WorkerState),
}

/// Snapshot of one open port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub device_path: String,
    pub driver: DriverKind,
    pub parameters: LineParameters,
    pub worker_state: WorkerState,
}

/// Live state of one open connection
struct PortHandle {
    id: u64,
    name: String,
    device: DeviceDescriptor,
    port: Arc<dyn SerialPort>,
    worker: IoWorker,
    parameters: Mutex<LineParameters>,
    /// Set once the worker runs; from then on closers report the disconnect
    announced: AtomicBool,
}

enum PortSlot {
    Pending {
        id: u64,
        device_path: String,
        awaiting_permission: bool,
    },
    Open(Arc<PortHandle>),
}

impl PortSlot {
    fn id(&self) -> u64 {
        match self {
            PortSlot::Pending { id, .. } => *id,
            PortSlot::Open(handle) => handle.id,
        }
    }

    fn device_path(&self) -> &str {
        match self {
            PortSlot::Pending { device_path, .. } => device_path,
            PortSlot::Open(handle) => handle.device.path(),
        }
    }
}

struct Inner {
    host: Arc<dyn DeviceHost>,
    registry: DeviceRegistry,
    gate: PermissionGate,
    sink: Arc<dyn EventSink>,
    config: ManagerConfig,
    ports: Mutex<HashMap<String, PortSlot>>,
    next_id: AtomicU64,
}

/// Entry point of the connection core
///
/// Cheap to clone; all clones share one port registry. Dropping the last
/// clone does not close ports, call [`shutdown`](Self::shutdown) for that.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        host: Arc<dyn DeviceHost>,
        overrides: DriverOverrides,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_config(host, overrides, sink, ManagerConfig::default())
    }

    pub fn with_config(
        host: Arc<dyn DeviceHost>,
        overrides: DriverOverrides,
        sink: Arc<dyn EventSink>,
        config: ManagerConfig,
    ) -> Self {
        info!(
            "Connection manager created ({} driver overrides, auto permission: {})",
            overrides.len(),
            config.auto_request_permission
        );
        Self {
            inner: Arc::new(Inner {
                registry: DeviceRegistry::new(Arc::clone(&host), overrides),
                gate: PermissionGate::new(Arc::clone(&host)),
                host,
                sink,
                config,
                ports: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn host(&self) -> &Arc<dyn DeviceHost> {
        &self.inner.host
    }

    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        self.inner.registry.enumerate()
    }

    /// Open `name` on the first device accepted by `selector`
    ///
    /// Without permission the host is asked and `AwaitingPermission` is
    /// returned at once; the outcome is then reported through the sink.
    /// Failures other than `AlreadyOpen` are also reported as error events.
    pub fn open(
        &self,
        name: &str,
        selector: &DeviceSelector,
        parameters: LineParameters,
    ) -> Result<OpenOutcome> {
        let inner = &self.inner;

        if inner.is_taken(name) {
            warn!("{}: open refused, name already in use", name);
            return Err(SerialError::AlreadyOpen(name.to_string()));
        }

        if let Err(e) = parameters.validate() {
            return Err(inner.report_failure(name, e.into()));
        }

        let Some(descriptor) = inner.registry.find(selector) else {
            let e = SerialError::DeviceNotFound(selector.to_string());
            return Err(inner.report_failure(name, e));
        };

        let awaiting_permission = !descriptor.permission_granted;
        let id = inner.reserve(name, descriptor.path(), awaiting_permission)?;
        info!(
            "Opening {} on {} at {}",
            name,
            descriptor.display_name(),
            parameters
        );

        if !awaiting_permission {
            return inner
                .connect(name, id, descriptor, parameters)
                .map(|()| OpenOutcome::Connected);
        }

        let weak = Arc::downgrade(inner);
        let port_name = name.to_string();
        let device = descriptor.device.clone();
        let (tx, rx) = mpsc::channel();
        let check = inner.gate.await_permission(
            &device,
            Box::new(move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    let result = inner.resume_open(&port_name, id, descriptor, parameters, outcome);
                    let _ = tx.send(result);
                }
            }),
        );

        match check {
            // Granted between enumeration and the request; already resumed
            PermissionCheck::AlreadyGranted => rx
                .try_recv()
                .unwrap_or(Ok(()))
                .map(|()| OpenOutcome::Connected),
            PermissionCheck::Requested | PermissionCheck::AlreadyPending => {
                Ok(OpenOutcome::AwaitingPermission)
            }
        }
    }

    /// Apply line parameters to an open port without restarting its worker
    pub fn set_parameters(&self, name: &str, parameters: LineParameters) -> Result<()> {
        parameters.validate()?;
        let handle = self.inner.open_handle(name)?;

        if let Err(e) = handle.port.set_parameters(&parameters) {
            warn!("{}: parameters {} rejected: {}", name, parameters, e);
            return Err(e.into());
        }

        *lock(&handle.parameters) = parameters;
        info!("{}: parameters set to {}", name, parameters);
        Ok(())
    }

    /// Close `name`
    ///
    /// An absent name fails with `PortNotFound` and emits nothing. A port
    /// still waiting for permission is cancelled without a notification.
    pub fn close(&self, name: &str) -> Result<()> {
        let slot = lock(&self.inner.ports).remove(name);
        match slot {
            None => {
                debug!("Close of unknown port {}", name);
                Err(SerialError::PortNotFound(name.to_string()))
            }
            Some(PortSlot::Pending { device_path, .. }) => {
                info!("{}: pending open on {} cancelled", name, device_path);
                Ok(())
            }
            Some(PortSlot::Open(handle)) => {
                self.inner.teardown(&handle);
                self.inner.emit_closed(&handle, None);
                info!("{}: closed", name);
                Ok(())
            }
        }
    }

    /// Queue bytes on an open port
    ///
    /// Success means the bytes were accepted into the pending-write buffer.
    /// `timeout` bounds the wait for buffer space; `None` fails at once.
    pub fn write(&self, name: &str, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let handle = self.inner.open_handle(name)?;
        handle.worker.write_async_timeout(data, timeout)
    }

    pub fn is_open(&self, name: &str) -> bool {
        matches!(lock(&self.inner.ports).get(name), Some(PortSlot::Open(_)))
    }

    pub fn port_state(&self, name: &str) -> Option<PortState> {
        lock(&self.inner.ports).get(name).map(|slot| match slot {
            PortSlot::Pending {
                awaiting_permission: true,
                ..
            } => PortState::AwaitingPermission,
            PortSlot::Pending { .. } => PortState::Opening,
            PortSlot::Open(handle) => PortState::Open(handle.worker.state()),
        })
    }

    pub fn port_info(&self, name: &str) -> Option<PortInfo> {
        let handle = self.inner.open_handle(name).ok()?;
        let parameters = *lock(&handle.parameters);
        Some(PortInfo {
            name: handle.name.clone(),
            device_path: handle.device.path().to_string(),
            driver: handle.device.driver,
            parameters,
            worker_state: handle.worker.state(),
        })
    }

    /// Names of open ports, sorted
    pub fn open_ports(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.ports)
            .iter()
            .filter(|(_, slot)| matches!(slot, PortSlot::Open(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Host notification: a device was plugged in
    pub fn device_attached(&self, device: RawDevice) {
        info!("Device attached: {}", device.path);
        self.inner.sink.emit(SerialEvent::DeviceAttached(true));
        if self.inner.config.auto_request_permission {
            self.inner.gate.request(&device);
        }
    }

    /// Host notification: a device was unplugged
    ///
    /// Open ports on the device are torn down and reported; opens still
    /// waiting for permission on it are dropped.
    pub fn device_detached(&self, path: &str) {
        info!("Device detached: {}", path);
        self.inner.sink.emit(SerialEvent::DeviceAttached(false));

        let removed: Vec<(String, PortSlot)> = {
            let mut ports = lock(&self.inner.ports);
            let names: Vec<String> = ports
                .iter()
                .filter(|(_, slot)| slot.device_path() == path)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| ports.remove(&name).map(|slot| (name, slot)))
                .collect()
        };

        for (name, slot) in removed {
            match slot {
                PortSlot::Pending { .. } => info!("{}: pending open dropped, device gone", name),
                PortSlot::Open(handle) => {
                    self.inner.teardown(&handle);
                    self.inner.emit_closed(&handle, Some("device detached"));
                }
            }
        }
    }

    /// Close every port and drop every pending open
    pub fn shutdown(&self) {
        let cancelled = self.inner.gate.cancel_all();
        let slots: Vec<(String, PortSlot)> = lock(&self.inner.ports).drain().collect();
        info!(
            "Shutting down: {} ports, {} pending permission continuations",
            slots.len(),
            cancelled
        );

        for (_, slot) in slots {
            if let PortSlot::Open(handle) = slot {
                self.inner.teardown(&handle);
                self.inner.emit_closed(&handle, None);
            }
        }
    }
}

impl Inner {
    fn is_taken(&self, name: &str) -> bool {
        lock(&self.ports).contains_key(name)
    }

    /// Claim `name` for an open in progress
    fn reserve(&self, name: &str, device_path: &str, awaiting_permission: bool) -> Result<u64> {
        let mut ports = lock(&self.ports);
        if ports.contains_key(name) {
            warn!("{}: open refused, name already in use", name);
            return Err(SerialError::AlreadyOpen(name.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ports.insert(
            name.to_string(),
            PortSlot::Pending {
                id,
                device_path: device_path.to_string(),
                awaiting_permission,
            },
        );
        Ok(id)
    }

    fn is_reserved(ports: &HashMap<String, PortSlot>, name: &str, id: u64) -> bool {
        matches!(ports.get(name), Some(slot @ PortSlot::Pending { .. }) if slot.id() == id)
    }

    /// Drop the reservation `id` of `name`, if it is still there
    fn release(&self, name: &str, id: u64) -> bool {
        let mut ports = lock(&self.ports);
        if !Self::is_reserved(&ports, name, id) {
            return false;
        }
        ports.remove(name);
        true
    }

    fn open_handle(&self, name: &str) -> Result<Arc<PortHandle>> {
        match lock(&self.ports).get(name) {
            Some(PortSlot::Open(handle)) => Ok(Arc::clone(handle)),
            _ => Err(SerialError::PortNotFound(name.to_string())),
        }
    }

    /// Continuation of an open parked on a permission request
    fn resume_open(
        self: &Arc<Self>,
        name: &str,
        id: u64,
        mut descriptor: DeviceDescriptor,
        parameters: LineParameters,
        outcome: PermissionOutcome,
    ) -> Result<()> {
        match outcome {
            PermissionOutcome::Granted => {
                descriptor.permission_granted = true;
                self.connect(name, id, descriptor, parameters)
            }
            PermissionOutcome::Denied => {
                let e = SerialError::PermissionDenied(descriptor.path().to_string());
                if self.release(name, id) {
                    self.emit_error(Some(name), e.to_string());
                } else {
                    debug!("{}: denial for a cancelled open", name);
                }
                Err(e)
            }
        }
    }

    /// Acquire the port, configure it and start its worker
    fn connect(
        self: &Arc<Self>,
        name: &str,
        id: u64,
        descriptor: DeviceDescriptor,
        parameters: LineParameters,
    ) -> Result<()> {
        match self.install(name, id, descriptor, parameters) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.release(name, id) {
                    error!("{}: open failed: {}", name, e);
                    self.emit_error(Some(name), e.to_string());
                }
                Err(e)
            }
        }
    }

    fn install(
        self: &Arc<Self>,
        name: &str,
        id: u64,
        descriptor: DeviceDescriptor,
        parameters: LineParameters,
    ) -> Result<()> {
        if !Self::is_reserved(&lock(&self.ports), name, id) {
            info!("{}: open cancelled before connecting", name);
            return Ok(());
        }

        let connection = self
            .host
            .open_connection(&descriptor.device, descriptor.driver)?;
        let port = connection.open_port()?;

        if let Err(e) = port.set_parameters(&parameters) {
            warn!("{}: parameters {} rejected: {}", name, parameters, e);
            close_port(name, port.as_ref());
            return Err(e.into());
        }

        let worker = IoWorker::with_settings(name, Arc::clone(&port), &self.config.worker);
        worker.set_listener(Arc::new(PortListener {
            inner: Arc::downgrade(self),
            name: name.to_string(),
            id,
        }));

        let handle = Arc::new(PortHandle {
            id,
            name: name.to_string(),
            device: descriptor,
            port,
            worker,
            parameters: Mutex::new(parameters),
            announced: AtomicBool::new(false),
        });

        {
            let mut ports = lock(&self.ports);
            if !Self::is_reserved(&ports, name, id) {
                drop(ports);
                info!("{}: open cancelled before completion", name);
                close_port(name, handle.port.as_ref());
                return Ok(());
            }
            ports.insert(name.to_string(), PortSlot::Open(Arc::clone(&handle)));
        }

        // The sink may call back into the manager, so it runs unlocked. The
        // worker starts afterwards; none of its errors can precede this event.
        self.emit_connected(name, true);

        let started = {
            let ports = lock(&self.ports);
            if !Self::is_current(&ports, name, id) {
                None
            } else {
                let started = handle.worker.start();
                if started.is_ok() {
                    handle.announced.store(true, Ordering::Release);
                }
                Some(started)
            }
        };

        match started {
            None => {
                // Torn down while the event was delivered; the closer saw no announcement
                info!("{}: closed before the worker started", name);
                self.emit_connected(name, false);
                return Ok(());
            }
            Some(Err(e)) => {
                let e = SerialError::from(e);
                if self.remove_current(name, id) {
                    close_port(name, handle.port.as_ref());
                    error!("{}: open failed: {}", name, e);
                    self.emit_error(Some(name), e.to_string());
                    self.emit_connected(name, false);
                }
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        info!(
            "{}: connected to {} ({})",
            name,
            handle.device.display_name(),
            parameters
        );
        Ok(())
    }

    /// Stop the worker, release the port and wait for the thread
    fn teardown(&self, handle: &PortHandle) {
        handle.worker.stop();
        close_port(&handle.name, handle.port.as_ref());
        handle.worker.join();
    }

    fn is_current(ports: &HashMap<String, PortSlot>, name: &str, id: u64) -> bool {
        matches!(ports.get(name), Some(PortSlot::Open(handle)) if handle.id == id)
    }

    /// Remove the open slot `id` of `name`, if it is still there
    fn remove_current(&self, name: &str, id: u64) -> bool {
        let mut ports = lock(&self.ports);
        if !Self::is_current(&ports, name, id) {
            return false;
        }
        ports.remove(name);
        true
    }

    /// Report a torn-down port as disconnected
    ///
    /// A port removed before its worker started is reported by the opener.
    fn emit_closed(&self, handle: &PortHandle, error: Option<&str>) {
        if !handle.announced.load(Ordering::Acquire) {
            return;
        }
        if let Some(message) = error {
            self.emit_error(Some(&handle.name), message.to_string());
        }
        self.emit_connected(&handle.name, false);
    }

    /// Worker callback: the loop ended on a transport error
    fn handle_run_error(&self, name: &str, id: u64, e: &TransportError) {
        let handle = {
            let mut ports = lock(&self.ports);
            match ports.get(name) {
                Some(PortSlot::Open(handle)) if handle.id == id => {
                    let handle = Arc::clone(handle);
                    ports.remove(name);
                    Some(handle)
                }
                _ => None,
            }
        };

        let Some(handle) = handle else {
            debug!("{}: run error after teardown: {}", name, e);
            return;
        };

        error!("{}: transport failure, closing: {}", name, e);
        close_port(name, handle.port.as_ref());
        self.emit_error(Some(name), format!("I/O error on {}: {}", name, e));
        self.emit_connected(name, false);
    }

    fn report_failure(&self, name: &str, e: SerialError) -> SerialError {
        warn!("{}: open failed: {}", name, e);
        self.emit_error(Some(name), e.to_string());
        e
    }

    fn emit_connected(&self, name: &str, connected: bool) {
        self.sink.emit(SerialEvent::ConnectedStateChanged {
            port: name.to_string(),
            connected,
        });
    }

    fn emit_error(&self, name: Option<&str>, message: String) {
        self.sink.emit(SerialEvent::Error {
            port: name.map(str::to_string),
            message,
        });
    }
}

fn close_port(name: &str, port: &dyn SerialPort) {
    if let Err(e) = port.close() {
        warn!("{}: error closing port: {}", name, e);
    }
}

/// Routes worker output of one port generation to the sink
struct PortListener {
    inner: Weak<Inner>,
    name: String,
    id: u64,
}

impl WorkerListener for PortListener {
    fn on_new_data(&self, data: Vec<u8>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.sink.emit(SerialEvent::DataReceived {
                port: self.name.clone(),
                data,
            });
        }
    }

    fn on_run_error(&self, error: &TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_run_error(&self.name, self.id, error);
        }
    }
}
