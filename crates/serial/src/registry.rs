//! Device registry
//!
//! Enumerates attached devices through the host and classifies each one.
//! A caller-supplied override table wins over the host's signature probing;
//! devices matching neither are still listed, as `DriverKind::Unknown`.

use common::{DeviceDescriptor, DeviceHost, DeviceSelector, DriverKind, DriverOverrides, RawDevice};
use std::sync::Arc;
use tracing::{debug, trace};

pub struct DeviceRegistry {
    host: Arc<dyn DeviceHost>,
    overrides: DriverOverrides,
}

impl DeviceRegistry {
    pub fn new(host: Arc<dyn DeviceHost>, overrides: DriverOverrides) -> Self {
        Self { host, overrides }
    }

    /// Snapshot every attached device
    ///
    /// Never blocks on user interaction; absence of devices is an empty list.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        let descriptors: Vec<DeviceDescriptor> = self
            .host
            .list_devices()
            .into_iter()
            .map(|device| self.describe(device))
            .collect();

        debug!("Enumerated {} devices", descriptors.len());
        descriptors
    }

    /// Build the descriptor for one raw device
    pub fn describe(&self, device: RawDevice) -> DeviceDescriptor {
        let driver = self.classify(&device);
        let permission_granted = self.host.has_permission(&device);

        trace!(
            "Device {}: vid={:#06x}, pid={:#06x}, driver={}, permission={}",
            device.path, device.vendor_id, device.product_id, driver, permission_granted
        );

        DeviceDescriptor {
            device,
            driver,
            permission_granted,
        }
    }

    pub fn classify(&self, device: &RawDevice) -> DriverKind {
        self.overrides
            .lookup(device.vendor_id, device.product_id)
            .or_else(|| self.host.classify(device))
            .unwrap_or(DriverKind::Unknown)
    }

    /// First device, in enumeration order, accepted by `selector`
    pub fn find(&self, selector: &DeviceSelector) -> Option<DeviceDescriptor> {
        self.enumerate().into_iter().find(|d| selector.matches(d))
    }

    pub fn overrides(&self) -> &DriverOverrides {
        &self.overrides
    }
}
