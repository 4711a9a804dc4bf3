//! Waiting for a device to re-enumerate after a reset.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::backend::RegistryEvent;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};

/// Identity markers a re-enumerated device must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplugMatch {
    pub kind: DeviceKind,
    /// Vendor/product style id; `None` accepts any device of `kind`.
    pub physical_id: Option<String>,
}

impl ReplugMatch {
    pub fn for_device(device: &Device) -> Self {
        Self {
            kind: device.kind(),
            physical_id: device.physical_id().map(str::to_string),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        device.kind() == self.kind
            && match &self.physical_id {
                Some(id) => device.physical_id() == Some(id.as_str()),
                None => true,
            }
    }
}

/// Something a session can block on until its device comes back.
pub trait ReplugSource: Send + Sync {
    /// Start collecting arrivals. Called before the command that makes the
    /// device disappear, so a fast replug is not missed.
    fn arm(&self);

    /// Block up to `timeout` for an arrival matching `want`.
    fn wait_for(&self, want: &ReplugMatch, timeout: Duration) -> Result<Device>;
}

#[derive(Debug, Default)]
struct Arrivals {
    armed: bool,
    devices: Vec<Device>,
}

/// Collects device arrivals from a registry and hands them to a waiting
/// session, possibly on another thread.
#[derive(Debug, Clone, Default)]
pub struct ReplugMonitor {
    inner: Arc<(Mutex<Arrivals>, Condvar)>,
}

impl ReplugMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback for [`BackendRegistry::subscribe`](crate::backend::BackendRegistry::subscribe).
    pub fn subscriber(&self) -> impl FnMut(&RegistryEvent) + Send + 'static {
        let monitor = self.clone();
        move |event| {
            if let RegistryEvent::Added(device) = event {
                monitor.device_added(device.clone());
            }
        }
    }

    /// Report an arrival. Ignored unless armed.
    pub fn device_added(&self, device: Device) {
        let (lock, cvar) = &*self.inner;
        let mut arrivals = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !arrivals.armed {
            return;
        }
        debug!(backend_id = device.backend_id(), "Arrival while armed");
        arrivals.devices.push(device);
        cvar.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).armed
    }
}

impl ReplugSource for ReplugMonitor {
    fn arm(&self) {
        let (lock, _) = &*self.inner;
        let mut arrivals = lock.lock().unwrap_or_else(PoisonError::into_inner);
        arrivals.armed = true;
        arrivals.devices.clear();
    }

    #[instrument(level = "debug", skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    fn wait_for(&self, want: &ReplugMatch, timeout: Duration) -> Result<Device> {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut arrivals = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(pos) = arrivals.devices.iter().position(|d| want.matches(d)) {
                let device = arrivals.devices.remove(pos);
                arrivals.armed = false;
                arrivals.devices.clear();
                return Ok(device);
            }
            let now = Instant::now();
            if now >= deadline {
                arrivals.armed = false;
                arrivals.devices.clear();
                return Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                    message: format!("no {} device re-enumerated", want.kind),
                });
            }
            arrivals = cvar
                .wait_timeout(arrivals, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
