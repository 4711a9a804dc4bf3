//! In-memory backend for replay and testing.

use tracing::debug;

use super::traits::{BackendCapability, DeviceSink, SetupFlags};
use crate::config::Context;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, ErrorKind, Result};

/// Backend whose "hardware" is a list of devices held in memory.
///
/// Counts probe, enumerate and invalidate calls so tests can check the
/// registry's lifecycle rules.
#[derive(Debug, Clone)]
pub struct EmulatedBackend {
    name: String,
    kind: DeviceKind,
    tag: Option<String>,
    device_types: Vec<String>,
    present: Vec<Device>,
    probe_fault: Option<ErrorKind>,
    probe_count: usize,
    enumerate_count: usize,
    invalidate_count: usize,
}

impl EmulatedBackend {
    /// Backend `name` producing devices of `kind`.
    ///
    /// The emulation tag defaults to the capitalised name plus `Devices`
    /// (`usb` becomes `UsbDevices`) and the accepted record type to the
    /// capitalised name plus `Device`.
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        let name = name.into();
        let stem = capitalise(&name);
        Self {
            tag: Some(format!("{stem}Devices")),
            device_types: vec![format!("{stem}Device")],
            name,
            kind,
            present: Vec::new(),
            probe_fault: None,
            probe_count: 0,
            enumerate_count: 0,
            invalidate_count: 0,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn without_emulation(mut self) -> Self {
        self.tag = None;
        self
    }

    /// Also accept records declaring `type_name`.
    pub fn with_device_type(mut self, type_name: impl Into<String>) -> Self {
        self.device_types.push(type_name.into());
        self
    }

    /// Device reported by the next enumerations.
    pub fn add_present(&mut self, device: Device) {
        self.present.push(device);
    }

    pub fn clear_present(&mut self) {
        self.present.clear();
    }

    /// Make every probe fail with `kind` until cleared.
    pub fn fail_probe(&mut self, kind: ErrorKind) {
        self.probe_fault = Some(kind);
    }

    pub fn clear_probe_fault(&mut self) {
        self.probe_fault = None;
    }

    pub fn probe_count(&self) -> usize {
        self.probe_count
    }

    pub fn enumerate_count(&self) -> usize {
        self.enumerate_count
    }

    pub fn invalidate_count(&self) -> usize {
        self.invalidate_count
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl BackendCapability for EmulatedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn emulation_tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn probe(&mut self, _ctx: &Context, flags: SetupFlags) -> Result<()> {
        self.probe_count += 1;
        debug!(backend = %self.name, ?flags, "Probe");
        match self.probe_fault {
            Some(kind) => Err(Error::from_kind(kind, format!("{} probe failed", self.name))),
            None => Ok(()),
        }
    }

    fn enumerate(&mut self, _ctx: &Context, sink: &mut dyn DeviceSink) -> Result<()> {
        self.enumerate_count += 1;
        for device in &self.present {
            sink.device_added(device.clone())?;
        }
        Ok(())
    }

    fn create_device_for_id(&mut self, backend_id: &str) -> Result<Device> {
        self.present
            .iter()
            .find(|d| d.backend_id() == backend_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no {} device {backend_id}", self.name)))
    }

    fn create_device_for_donor(&self, donor: Device) -> Result<Device> {
        if !self.device_types.iter().any(|t| t == donor.type_name()) {
            return Err(Error::InvalidData(format!(
                "unknown device type '{}' for {} backend",
                donor.type_name(),
                self.name
            )));
        }
        Ok(donor)
    }

    fn invalidate(&mut self) {
        self.invalidate_count += 1;
    }
}
