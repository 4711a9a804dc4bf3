//! Device discovery: backends and the registry that tracks their devices.

pub mod emulated;
pub mod registry;
pub mod traits;
pub mod usb;

pub use emulated::EmulatedBackend;
pub use registry::{BackendRegistry, DeviceTable, RegistryEvent, RegistryState};
pub use traits::{BackendCapability, DeviceSink, SetupFlags};
pub use usb::UsbBackend;
