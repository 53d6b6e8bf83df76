//! libusb device host
//!
//! [`RusbHost`] answers the core's enumeration, permission and connection
//! calls from a libusb context. [`HotplugWatcher`] runs the libusb event
//! loop on its own thread and feeds arrivals and removals to the manager.

use super::port::UsbConnection;
use super::transfers::map_rusb_error;
use common::{
    DeviceConnection, DeviceHost, DriverKind, PermissionCallback, RawDevice, TransportError,
};
use common::sync::lock;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, UsbContext};
use serial::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Root hubs are VID 0x1d6b (Linux Foundation) with device class 9 (Hub)
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const USB_CLASS_HUB: u8 = 0x09;

const EVENT_POLL: Duration = Duration::from_millis(100);

/// Device path in the form `/dev/bus/usb/BBB/DDD`
pub fn device_path(bus: u8, address: u8) -> String {
    format!("/dev/bus/usb/{:03}/{:03}", bus, address)
}

/// Build a `RawDevice` from a libusb device; `None` for root hubs
///
/// String descriptors need an open handle, so they are only read when
/// `read_strings` is set.
fn describe<T: UsbContext>(device: &Device<T>, read_strings: bool) -> Option<RawDevice> {
    let desc = match device.device_descriptor() {
        Ok(desc) => desc,
        Err(e) => {
            debug!("Skipping device without descriptor: {}", e);
            return None;
        }
    };

    if desc.vendor_id() == ROOT_HUB_VENDOR && desc.class_code() == USB_CLASS_HUB {
        return None;
    }

    let interface_classes = device
        .active_config_descriptor()
        .map(|config| {
            config
                .interfaces()
                .filter_map(|iface| iface.descriptors().next())
                .map(|d| d.class_code())
                .collect()
        })
        .unwrap_or_default();

    let (manufacturer, product) = if read_strings {
        device
            .open()
            .map(|handle| {
                (
                    read_string(&handle, desc.manufacturer_string_index()),
                    read_string(&handle, desc.product_string_index()),
                )
            })
            .unwrap_or((None, None))
    } else {
        (None, None)
    };

    Some(RawDevice {
        path: device_path(device.bus_number(), device.address()),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        manufacturer,
        product,
        interface_classes,
    })
}

fn read_string<T: UsbContext>(handle: &DeviceHandle<T>, index: Option<u8>) -> Option<String> {
    index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
}

fn find_device(context: &Context, path: &str) -> Result<Device<Context>, TransportError> {
    let devices = context.devices().map_err(map_rusb_error)?;
    devices
        .iter()
        .find(|d| device_path(d.bus_number(), d.address()) == path)
        .ok_or_else(|| TransportError::NotFound(path.to_string()))
}

/// Access is held when this process can open the device node
fn can_open(context: &Context, path: &str) -> bool {
    find_device(context, path)
        .and_then(|device| device.open().map_err(map_rusb_error))
        .is_ok()
}

pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        debug!("libusb context created");
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl DeviceHost for RusbHost {
    fn list_devices(&self) -> Vec<RawDevice> {
        match self.context.devices() {
            Ok(devices) => devices.iter().filter_map(|d| describe(&d, true)).collect(),
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                Vec::new()
            }
        }
    }

    fn classify(&self, device: &RawDevice) -> Option<DriverKind> {
        DriverKind::probe(device.vendor_id, device.product_id, &device.interface_classes)
    }

    fn has_permission(&self, device: &RawDevice) -> bool {
        can_open(&self.context, &device.path)
    }

    fn request_permission(&self, device: &RawDevice, on_resolved: PermissionCallback) {
        // There is no prompt on a desktop; access is re-checked off the caller's thread
        let callback = Arc::new(Mutex::new(Some(on_resolved)));
        let context = self.context.clone();
        let path = device.path.clone();

        let thread_callback = Arc::clone(&callback);
        let spawned = thread::Builder::new()
            .name("usb-permission".to_string())
            .spawn(move || {
                let granted = can_open(&context, &path);
                if !granted {
                    info!(
                        "No access to {}; check udev rules or group membership",
                        path
                    );
                }
                if let Some(cb) = lock(&thread_callback).take() {
                    cb(granted);
                }
            });

        if let Err(e) = spawned {
            error!("Failed to spawn permission thread: {}", e);
            if let Some(cb) = lock(&callback).take() {
                cb(false);
            }
        }
    }

    fn open_connection(
        &self,
        device: &RawDevice,
        driver: DriverKind,
    ) -> Result<Box<dyn DeviceConnection>, TransportError> {
        let usb_device = find_device(&self.context, &device.path)?;
        let connection = UsbConnection::open(usb_device, driver, device.path.clone())?;
        Ok(Box::new(connection))
    }
}

enum HotplugEvent {
    Arrived(Device<Context>),
    Left(String),
}

/// Queues hotplug notifications for the event thread
///
/// libusb forbids opening devices inside the callback, so the work is done
/// after `handle_events` returns.
struct HotplugForwarder {
    tx: mpsc::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self
            .tx
            .send(HotplugEvent::Left(device_path(device.bus_number(), device.address())));
    }
}

/// Runs the libusb event loop and reports attach and detach to the manager
pub struct HotplugWatcher {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    pub fn start(context: Context, manager: ConnectionManager) -> Result<Self, rusb::Error> {
        if !rusb::has_hotplug() {
            return Err(rusb::Error::NotSupported);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run_event_loop(context, manager, thread_running, ready_tx))
            .map_err(|e| {
                error!("Failed to spawn hotplug thread: {}", e);
                rusb::Error::Other
            })?;

        // Registration happens on the event thread; wait for its outcome
        let registered = ready_rx.recv().unwrap_or(Err(rusb::Error::Other));
        if let Err(e) = registered {
            let _ = thread.join();
            return Err(e);
        }

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Hotplug thread panicked");
            }
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_event_loop(
    context: Context,
    manager: ConnectionManager,
    running: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), rusb::Error>>,
) {
    let (tx, rx) = mpsc::channel();
    let registration = HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(HotplugForwarder { tx }));

    let _registration = match registration {
        Ok(registration) => {
            let _ = ready.send(Ok(()));
            registration
        }
        Err(e) => {
            warn!("Failed to register hot-plug callback: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    info!("Hot-plug watcher started");
    while running.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                thread::sleep(EVENT_POLL);
            }
        }

        for event in rx.try_iter() {
            match event {
                HotplugEvent::Arrived(device) => {
                    if let Some(raw) = describe(&device, true) {
                        info!(
                            "Device attached: {} ({:04x}:{:04x})",
                            raw.path, raw.vendor_id, raw.product_id
                        );
                        manager.device_attached(raw);
                    }
                }
                HotplugEvent::Left(path) => {
                    info!("Device detached: {}", path);
                    manager.device_detached(&path);
                }
            }
        }
    }
    info!("Hot-plug watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_format() {
        assert_eq!(device_path(1, 4), "/dev/bus/usb/001/004");
        assert_eq!(device_path(12, 127), "/dev/bus/usb/012/127");
    }
}
