//! Permission gate
//!
//! Mediates host access grants. A request for a device without permission
//! goes to the host once; continuations registered while it is outstanding
//! wait in a pending table keyed by device path and are resumed exactly once
//! when the host resolves, on whatever thread the host calls back from.

use common::sync::lock;
use common::{DeviceHost, RawDevice};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

impl From<bool> for PermissionOutcome {
    fn from(granted: bool) -> Self {
        if granted {
            PermissionOutcome::Granted
        } else {
            PermissionOutcome::Denied
        }
    }
}

/// What `await_permission` did with the continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheck {
    /// Permission was held; the continuation already ran with `Granted`
    AlreadyGranted,
    /// A host request went out; the continuation runs on resolution
    Requested,
    /// A host request was already outstanding; the continuation joined it
    AlreadyPending,
}

/// Resumes an operation suspended on a permission request
pub type PermissionContinuation = Box<dyn FnOnce(PermissionOutcome) + Send + 'static>;

type PendingTable = HashMap<String, Vec<PermissionContinuation>>;

#[derive(Clone)]
pub struct PermissionGate {
    host: Arc<dyn DeviceHost>,
    pending: Arc<Mutex<PendingTable>>,
}

impl PermissionGate {
    pub fn new(host: Arc<dyn DeviceHost>) -> Self {
        Self {
            host,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ask the host for access without waiting for the answer
    ///
    /// No-op when permission is held or a request is already outstanding.
    pub fn request(&self, device: &RawDevice) {
        if self.host.has_permission(device) {
            debug!("Permission already held for {}", device.path);
            return;
        }
        self.enqueue(device, None);
    }

    /// Run `continuation` once access to `device` is decided
    pub fn await_permission(
        &self,
        device: &RawDevice,
        continuation: PermissionContinuation,
    ) -> PermissionCheck {
        if self.host.has_permission(device) {
            continuation(PermissionOutcome::Granted);
            return PermissionCheck::AlreadyGranted;
        }
        self.enqueue(device, Some(continuation))
    }

    fn enqueue(
        &self,
        device: &RawDevice,
        continuation: Option<PermissionContinuation>,
    ) -> PermissionCheck {
        let first = {
            let mut pending = lock(&self.pending);
            let first = !pending.contains_key(&device.path);
            let waiters = pending.entry(device.path.clone()).or_default();
            if let Some(c) = continuation {
                waiters.push(c);
            }
            first
        };

        if !first {
            debug!("Permission request for {} already pending", device.path);
            return PermissionCheck::AlreadyPending;
        }

        info!("Requesting permission for {}", device.path);
        let pending = Arc::clone(&self.pending);
        let path = device.path.clone();
        // Called outside the lock: a host may resolve synchronously
        self.host.request_permission(
            device,
            Box::new(move |granted| resolve(&pending, &path, granted)),
        );
        PermissionCheck::Requested
    }

    /// Deliver a host decision for `path`
    pub fn on_resolved(&self, path: &str, granted: bool) {
        resolve(&self.pending, path, granted);
    }

    pub fn is_pending(&self, path: &str) -> bool {
        lock(&self.pending).contains_key(path)
    }

    /// Drop every waiting continuation; a later host decision is ignored
    pub fn cancel_all(&self) -> usize {
        let mut pending = lock(&self.pending);
        let dropped = pending.values().map(Vec::len).sum();
        pending.clear();
        dropped
    }
}

fn resolve(pending: &Mutex<PendingTable>, path: &str, granted: bool) {
    let waiters = lock(pending).remove(path);
    let Some(waiters) = waiters else {
        debug!("Ignoring permission result for {} with no pending request", path);
        return;
    };

    let outcome = PermissionOutcome::from(granted);
    if granted {
        info!("USB permission granted for {}", path);
    } else {
        warn!("USB permission denied for {}", path);
    }

    // Continuations run without the table lock held
    for continuation in waiters {
        continuation(outcome);
    }
}
