//! Live USB discovery using nusb.

use nusb::{DeviceInfo, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{BackendCapability, DeviceSink, SetupFlags};
use crate::config::Context;
use crate::device::{Device, DeviceFlags, DeviceKind};
use crate::error::{Error, Result};

/// Emulation tag for USB devices.
pub const USB_EMULATION_TAG: &str = "UsbDevices";
/// Record type of a plain USB device.
pub const USB_DEVICE_TYPE: &str = "UsbDevice";

/// Backend enumerating the host's USB devices.
#[derive(Debug, Default)]
pub struct UsbBackend {
    /// Only report devices with these vendor ids; empty means all.
    vendor_filter: Vec<u16>,
    emulation_only: bool,
}

impl UsbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vendor_filter(mut self, vendor_ids: &[u16]) -> Self {
        self.vendor_filter = vendor_ids.to_vec();
        self
    }

    fn wanted(&self, info: &DeviceInfo) -> bool {
        self.vendor_filter.is_empty() || self.vendor_filter.contains(&info.vendor_id())
    }
}

/// `usb:<bus>-<address>`, stable for one physical attachment.
pub fn backend_id_for(bus: &str, address: u8) -> String {
    format!("usb:{bus}-{address:03}")
}

/// Keeps the I/O kind so permission problems surface as such.
fn usb_error(e: nusb::Error) -> Error {
    Error::Io(std::io::Error::from(e))
}

/// Render a BCD device release as `major.minor`.
fn bcd_version(bcd: u16) -> String {
    format!("{:x}.{:02x}", bcd >> 8, bcd & 0xFF)
}

fn device_from_info(info: &DeviceInfo) -> Device {
    let mut device = Device::new(
        backend_id_for(info.bus_id(), info.device_address()),
        DeviceKind::Usb,
    )
    .with_type_name(USB_DEVICE_TYPE)
    .with_physical_id(format!(
        "{:04x}:{:04x}",
        info.vendor_id(),
        info.product_id()
    ))
    .with_version(bcd_version(info.device_version()));
    if info.class() == 0xFE {
        // application-specific class: DFU runtime or bootloader
        device.add_flag(DeviceFlags::IS_BOOTLOADER);
    }
    device
}

impl BackendCapability for UsbBackend {
    fn name(&self) -> &str {
        "usb"
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Usb
    }

    fn emulation_tag(&self) -> Option<&str> {
        Some(USB_EMULATION_TAG)
    }

    #[instrument(level = "debug", skip(self, _ctx))]
    fn probe(&mut self, _ctx: &Context, flags: SetupFlags) -> Result<()> {
        self.emulation_only = flags.contains(SetupFlags::EMULATION_ONLY);
        if self.emulation_only {
            debug!("Emulation only, not touching the bus");
            return Ok(());
        }
        if flags.contains(SetupFlags::USE_HOTPLUG) {
            warn!("USB has no hotplug watcher, arrivals must be fed to device_hotplugged");
        }
        // fails early on hosts without usbfs access
        let found = list_devices().wait().map_err(usb_error)?.count();
        debug!(devices = found, "USB bus reachable");
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    fn enumerate(&mut self, _ctx: &Context, sink: &mut dyn DeviceSink) -> Result<()> {
        if self.emulation_only {
            return Ok(());
        }
        let mut count = 0;
        for info in list_devices().wait().map_err(usb_error)? {
            if !self.wanted(&info) {
                continue;
            }
            sink.device_added(device_from_info(&info))?;
            count += 1;
        }
        info!(devices = count, "USB enumeration complete");
        Ok(())
    }

    fn create_device_for_id(&mut self, backend_id: &str) -> Result<Device> {
        list_devices()
            .wait()
            .map_err(usb_error)?
            .find(|info| backend_id_for(info.bus_id(), info.device_address()) == backend_id)
            .map(|info| device_from_info(&info))
            .ok_or_else(|| Error::NotFound(format!("no USB device {backend_id}")))
    }

    fn create_device_for_donor(&self, donor: Device) -> Result<Device> {
        if donor.type_name() != USB_DEVICE_TYPE {
            return Err(Error::InvalidData(format!(
                "unknown USB device type '{}'",
                donor.type_name()
            )));
        }
        Ok(donor)
    }

    fn invalidate(&mut self) {
        self.emulation_only = false;
    }
}
