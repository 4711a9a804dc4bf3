//! Backend capability interface.
//!
//! Defines the `BackendCapability` trait for one discovery domain,
//! allowing different implementations (USB via nusb, emulated, etc.).

use bitflags::bitflags;

use crate::config::Context;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};

bitflags! {
    /// Options passed to a backend probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetupFlags: u32 {
        /// Keep watching for hotplug events after coldplug.
        const USE_HOTPLUG = 1 << 0;
        /// Do not touch live hardware; only emulation is wanted.
        const EMULATION_ONLY = 1 << 1;
    }
}

/// Receiver for devices found during enumeration.
pub trait DeviceSink {
    fn device_added(&mut self, device: Device) -> Result<()>;
    fn device_removed(&mut self, backend_id: &str) -> Result<Option<Device>>;
    fn device_changed(&mut self, device: Device) -> Result<()>;
}

/// Abstract discovery domain.
///
/// This trait enables:
/// - Live implementations for a bus type
/// - An emulated implementation for replay and testing
pub trait BackendCapability {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Family of every device this backend produces.
    fn kind(&self) -> DeviceKind;

    /// Top-level key of this backend's records in an emulation document;
    /// `None` if the backend does not support emulation.
    fn emulation_tag(&self) -> Option<&str> {
        None
    }

    /// Open the bus, check permissions, start watchers.
    fn probe(&mut self, ctx: &Context, flags: SetupFlags) -> Result<()>;

    /// Report every present device through `sink`.
    fn enumerate(&mut self, ctx: &Context, sink: &mut dyn DeviceSink) -> Result<()>;

    /// Build a device for a known backend id, e.g. from a hotplug event.
    fn create_device_for_id(&mut self, backend_id: &str) -> Result<Device> {
        Err(Error::NotSupported(format!(
            "{} cannot create devices by id ({backend_id})",
            self.name()
        )))
    }

    /// Convert a generic transient device into this backend's concrete
    /// type. Unknown declared types are `InvalidData`.
    fn create_device_for_donor(&self, donor: Device) -> Result<Device> {
        Ok(donor)
    }

    /// Drop cached probe state so the next setup re-probes.
    fn invalidate(&mut self) {}
}
