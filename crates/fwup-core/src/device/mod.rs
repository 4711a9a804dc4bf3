//! Device identity and the per-family capability interface.

pub mod mock;
pub mod traits;

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emulation::EventLog;
use crate::error::{Error, Result};

pub use crate::checksum::ChecksumAlgorithm;
pub use mock::MockDevice;
pub use traits::{DeviceCapability, ErrorClass, TransferParams, VerifyStrategy};

/// Device family, one per discovery domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Usb,
    I2c,
    Hid,
    Mtd,
    Pci,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Usb => "usb",
            DeviceKind::I2c => "i2c",
            DeviceKind::Hid => "hid",
            DeviceKind::Mtd => "mtd",
            DeviceKind::Pci => "pci",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Capability and behaviour markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Created from an emulation log, not live hardware.
        const EMULATED = 1 << 0;
        /// Currently in bootloader/programmable mode.
        const IS_BOOTLOADER = 1 << 1;
        /// Expected to disappear and re-enumerate.
        const WAIT_FOR_REPLUG = 1 << 2;
        /// Can receive firmware.
        const UPDATABLE = 1 << 3;
    }
}

const FLAG_NAMES: &[(&str, DeviceFlags)] = &[
    ("emulated", DeviceFlags::EMULATED),
    ("is-bootloader", DeviceFlags::IS_BOOTLOADER),
    ("wait-for-replug", DeviceFlags::WAIT_FOR_REPLUG),
    ("updatable", DeviceFlags::UPDATABLE),
];

impl DeviceFlags {
    /// Parse kebab-case flag names, rejecting unknown ones.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut flags = DeviceFlags::empty();
        for name in names {
            let name = name.as_ref();
            let (_, flag) = FLAG_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| Error::InvalidData(format!("unknown device flag '{name}'")))?;
            flags |= *flag;
        }
        Ok(flags)
    }

    pub fn to_names(self) -> Vec<String> {
        FLAG_NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| (*n).to_string())
            .collect()
    }
}

/// A physical (or emulated) device tracked by a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    backend_id: String,
    created_at: DateTime<Utc>,
    kind: DeviceKind,
    type_name: String,
    flags: DeviceFlags,
    physical_id: Option<String>,
    version: Option<String>,
    remove_delay: Option<Duration>,
    events: EventLog,
}

impl Device {
    pub fn new(backend_id: impl Into<String>, kind: DeviceKind) -> Self {
        let created_at = Utc::now();
        Self {
            backend_id: backend_id.into(),
            created_at,
            kind,
            type_name: String::new(),
            flags: DeviceFlags::empty(),
            physical_id: None,
            version: None,
            remove_delay: None,
            events: EventLog::new(created_at),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        if self.events.is_empty() {
            self.events = EventLog::new(created_at);
        }
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_physical_id(mut self, physical_id: impl Into<String>) -> Self {
        self.physical_id = Some(physical_id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set_type_name(&mut self, type_name: impl Into<String>) {
        self.type_name = type_name.into();
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: DeviceFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn add_flag(&mut self, flag: DeviceFlags) {
        self.flags.insert(flag);
    }

    pub fn remove_flag(&mut self, flag: DeviceFlags) {
        self.flags.remove(flag);
    }

    pub fn physical_id(&self) -> Option<&str> {
        self.physical_id.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = Some(version.into());
    }

    /// Driver-declared replug timeout, if any.
    pub fn remove_delay(&self) -> Option<Duration> {
        self.remove_delay
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventLog {
        &mut self.events
    }

    /// Install a new event log, discarding the old one.
    pub fn replace_events(&mut self, events: EventLog) -> EventLog {
        std::mem::replace(&mut self.events, events)
    }

    pub fn take_events(&mut self) -> EventLog {
        let created_at = self.events.created_at();
        self.replace_events(EventLog::new(created_at))
    }

    /// Take over the identity of the device that re-enumerated in our place.
    pub fn adopt_identity(&mut self, replugged: &Device) {
        self.backend_id = replugged.backend_id.clone();
        self.created_at = replugged.created_at;
        self.flags = replugged.flags;
        if replugged.physical_id.is_some() {
            self.physical_id = replugged.physical_id.clone();
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.backend_id, self.kind)?;
        if let Some(version) = &self.version {
            write!(f, " v{version}")?;
        }
        let flags = self.flags.to_names();
        if !flags.is_empty() {
            write!(f, " ({})", flags.join(","))?;
        }
        Ok(())
    }
}
