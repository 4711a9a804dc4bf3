//! Device table for one discovery domain.
//!
//! The registry owns every tracked [`Device`], keyed by `backend_id`, and
//! tells subscribers about each change synchronously and in order. It may
//! only be mutated from the thread that created it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{debug, info, instrument, warn};

use super::traits::{BackendCapability, DeviceSink, SetupFlags};
use crate::config::Context;
use crate::device::{Device, DeviceFlags};
use crate::emulation::{DeviceRecord, EmulationDocument, EventLog};
use crate::error::{Error, Result};
use crate::progress::{Progress, ProgressSink};

/// Lifecycle of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    SetUp,
    Coldplugged,
}

/// Change notifications, carrying a snapshot of the device.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(Device),
    Removed(Device),
    Changed(Device),
}

impl RegistryEvent {
    pub fn device(&self) -> &Device {
        match self {
            RegistryEvent::Added(d) | RegistryEvent::Removed(d) | RegistryEvent::Changed(d) => d,
        }
    }
}

type Subscriber = Box<dyn FnMut(&RegistryEvent) + Send>;

/// Tracked devices plus the subscribers that watch them.
pub struct DeviceTable {
    devices: BTreeMap<String, Device>,
    subscribers: Vec<Subscriber>,
    owner: ThreadId,
}

impl DeviceTable {
    fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            subscribers: Vec::new(),
            owner: thread::current().id(),
        }
    }

    fn check_owner(&self, op: &str) -> Result<()> {
        if thread::current().id() == self.owner {
            return Ok(());
        }
        debug_assert!(false, "{op} called off the registry's owning thread");
        Err(Error::Internal(format!(
            "{op} called off the registry's owning thread"
        )))
    }

    fn emit(&mut self, event: RegistryEvent) {
        for subscriber in &mut self.subscribers {
            subscriber(&event);
        }
    }

    fn replace_events(&mut self, backend_id: &str, events: EventLog) -> Result<()> {
        let device = self
            .devices
            .get_mut(backend_id)
            .ok_or_else(|| Error::NotFound(backend_id.to_string()))?;
        device.replace_events(events);
        let snapshot = device.clone();
        self.emit(RegistryEvent::Changed(snapshot));
        Ok(())
    }
}

impl DeviceSink for DeviceTable {
    fn device_added(&mut self, device: Device) -> Result<()> {
        self.check_owner("device_added")?;
        let id = device.backend_id().to_string();
        if self.devices.contains_key(&id) {
            warn!(backend_id = %id, "Device already tracked, replacing");
        } else {
            debug!(backend_id = %id, "Device added");
        }
        self.devices.insert(id, device.clone());
        self.emit(RegistryEvent::Added(device));
        Ok(())
    }

    fn device_removed(&mut self, backend_id: &str) -> Result<Option<Device>> {
        self.check_owner("device_removed")?;
        let Some(device) = self.devices.remove(backend_id) else {
            debug!(backend_id, "Removal of untracked device ignored");
            return Ok(None);
        };
        debug!(backend_id, "Device removed");
        self.emit(RegistryEvent::Removed(device.clone()));
        Ok(Some(device))
    }

    fn device_changed(&mut self, device: Device) -> Result<()> {
        self.check_owner("device_changed")?;
        let id = device.backend_id().to_string();
        let Some(slot) = self.devices.get_mut(&id) else {
            return Err(Error::NotFound(format!("cannot change untracked device {id}")));
        };
        *slot = device.clone();
        debug!(backend_id = %id, "Device changed");
        self.emit(RegistryEvent::Changed(device));
        Ok(())
    }
}

/// Registry of devices for one backend.
pub struct BackendRegistry<B> {
    backend: B,
    ctx: Arc<Context>,
    table: DeviceTable,
    state: RegistryState,
    enabled: bool,
    can_invalidate: bool,
}

impl<B: BackendCapability> BackendRegistry<B> {
    pub fn new(backend: B, ctx: Arc<Context>) -> Self {
        Self {
            backend,
            ctx,
            table: DeviceTable::new(),
            state: RegistryState::Uninitialized,
            enabled: true,
            can_invalidate: false,
        }
    }

    /// Allow [`BackendRegistry::invalidate`]. Registries shared between
    /// consumers must not be re-probed and leave this off.
    pub fn with_invalidate(mut self, can_invalidate: bool) -> Self {
        self.can_invalidate = can_invalidate;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn is_set_up(&self) -> bool {
        self.state != RegistryState::Uninitialized
    }

    pub fn can_invalidate(&self) -> bool {
        self.can_invalidate
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Register a callback for every add, remove and change.
    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: FnMut(&RegistryEvent) + Send + 'static,
    {
        self.table.subscribers.push(Box::new(subscriber));
    }

    /// Probe the backend once. Later calls are no-ops until invalidated.
    #[instrument(level = "debug", skip(self), fields(backend = self.backend.name()))]
    pub fn set_up(&mut self, flags: SetupFlags) -> Result<()> {
        if self.is_set_up() {
            debug!("Already set up");
            return Ok(());
        }
        if let Err(e) = self.backend.probe(&self.ctx, flags) {
            warn!(error = %e, "Probe failed, disabling backend");
            self.enabled = false;
            return Err(e);
        }
        self.state = RegistryState::SetUp;
        info!("Backend set up");
        Ok(())
    }

    /// Forget the setup so the next [`BackendRegistry::set_up`] probes
    /// again. Calling this on a registry built without invalidation
    /// support is a contract violation.
    pub fn invalidate(&mut self) -> Result<()> {
        if !self.can_invalidate {
            debug_assert!(false, "invalidate on a registry that cannot invalidate");
            return Err(Error::Internal(format!(
                "{} registry cannot be invalidated",
                self.backend.name()
            )));
        }
        self.table.check_owner("invalidate")?;
        self.state = RegistryState::Uninitialized;
        self.backend.invalidate();
        debug!(backend = self.backend.name(), "Backend invalidated");
        Ok(())
    }

    /// Set up if needed, then enumerate present devices.
    #[instrument(level = "debug", skip_all, fields(backend = self.backend.name()))]
    pub fn coldplug(&mut self, progress: &mut dyn ProgressSink) -> Result<()> {
        if !self.enabled {
            return Err(Error::NotSupported(format!(
                "{} backend is disabled",
                self.backend.name()
            )));
        }
        let mut steps = Progress::new().with_step("setup", 10).with_step("enumerate", 90);
        self.set_up(SetupFlags::empty())?;
        if let Some(pct) = steps.step_done() {
            progress.on_progress(pct);
        }

        self.table.check_owner("coldplug")?;
        self.backend.enumerate(&self.ctx, &mut self.table)?;
        self.state = RegistryState::Coldplugged;
        if let Some(pct) = steps.step_done() {
            progress.on_progress(pct);
        }
        info!(devices = self.table.devices.len(), "Coldplug complete");
        Ok(())
    }

    pub fn device_added(&mut self, device: Device) -> Result<()> {
        self.table.device_added(device)
    }

    /// Build the device for `backend_id` through the backend and track
    /// it, e.g. when a watcher reports a new arrival.
    #[instrument(level = "debug", skip(self), fields(backend = self.backend.name()))]
    pub fn device_hotplugged(&mut self, backend_id: &str) -> Result<()> {
        if !self.enabled {
            return Err(Error::NotSupported(format!(
                "{} backend is disabled",
                self.backend.name()
            )));
        }
        self.table.check_owner("device_hotplugged")?;
        let device = self.backend.create_device_for_id(backend_id)?;
        debug!("Hotplugged device created");
        self.table.device_added(device)
    }

    pub fn device_removed(&mut self, device: &Device) -> Result<Option<Device>> {
        self.table.device_removed(device.backend_id())
    }

    pub fn device_changed(&mut self, device: Device) -> Result<()> {
        self.table.device_changed(device)
    }

    pub fn lookup_by_id(&self, backend_id: &str) -> Option<&Device> {
        self.table.devices.get(backend_id)
    }

    /// Tracked devices sorted by `backend_id`.
    pub fn get_devices(&self) -> Vec<&Device> {
        self.table.devices.values().collect()
    }

    pub fn len(&self) -> usize {
        self.table.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.devices.is_empty()
    }

    /// Replay the devices recorded for this backend in `doc`.
    ///
    /// Every record is parsed and converted before the table is touched,
    /// so a malformed log leaves the registry unchanged. Devices whose
    /// `backend_id` and creation time both match keep their identity and
    /// only get the new event log. Unmatched emulated devices are removed,
    /// then unmatched records are added. Records naming a live device's
    /// `backend_id` are skipped.
    #[instrument(level = "debug", skip_all, fields(backend = self.backend.name()))]
    pub fn load_from_log(&mut self, doc: &EmulationDocument) -> Result<()> {
        let Some(tag) = self.backend.emulation_tag() else {
            debug!("Backend has no emulation support, nothing to replay");
            return Ok(());
        };
        let Some(records) = doc.records(tag)? else {
            debug!(tag, "No records in emulation, nothing to replay");
            return Ok(());
        };
        self.table.check_owner("load_from_log")?;

        let mut candidates: BTreeSet<String> = self.table.devices.keys().cloned().collect();
        let mut changes: Vec<(String, EventLog)> = Vec::new();
        let mut additions: Vec<Device> = Vec::new();

        for record in &records {
            let mut donor = record.to_device(self.backend.kind())?;
            donor.add_flag(DeviceFlags::EMULATED);
            let mut device = self.backend.create_device_for_donor(donor)?;
            device.add_flag(DeviceFlags::EMULATED);

            let existing = self.table.devices.get(&record.backend_id);
            if existing.is_some_and(|d| !d.has_flag(DeviceFlags::EMULATED)) {
                warn!(
                    backend_id = %record.backend_id,
                    "Live device holds this id, skipping emulated record"
                );
                continue;
            }
            if existing.is_some_and(|d| d.created_at() == record.created) {
                debug!(backend_id = %record.backend_id, "Identity matches, replacing event log");
                candidates.remove(&record.backend_id);
                changes.push((record.backend_id.clone(), device.take_events()));
            } else {
                debug!(backend_id = %record.backend_id, "Staging emulated device");
                additions.push(device);
            }
        }

        for (backend_id, events) in changes {
            self.table.replace_events(&backend_id, events)?;
        }
        for backend_id in candidates {
            let emulated = self
                .table
                .devices
                .get(&backend_id)
                .is_some_and(|d| d.has_flag(DeviceFlags::EMULATED));
            if emulated {
                self.table.device_removed(&backend_id)?;
            }
        }
        for device in additions {
            self.table.device_added(device)?;
        }
        info!(records = records.len(), devices = self.len(), "Emulation replayed");
        Ok(())
    }

    /// Record every tracked device under this backend's tag in `doc`.
    pub fn save_to_log(&self, doc: &mut EmulationDocument) -> Result<()> {
        let Some(tag) = self.backend.emulation_tag() else {
            return Err(Error::NotSupported(format!(
                "{} backend does not support emulation",
                self.backend.name()
            )));
        };
        let records: Vec<DeviceRecord> = self
            .get_devices()
            .into_iter()
            .map(DeviceRecord::from_device)
            .collect();
        debug!(tag, devices = records.len(), "Saving emulation");
        doc.set_records(tag, &records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::backend::emulated::EmulatedBackend;
    use crate::device::DeviceKind;
    use crate::error::ErrorKind;

    fn registry() -> BackendRegistry<EmulatedBackend> {
        BackendRegistry::new(
            EmulatedBackend::new("usb", DeviceKind::Usb),
            Arc::new(Context::default()),
        )
    }

    fn recorder(reg: &mut BackendRegistry<EmulatedBackend>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reg.subscribe(move |ev| {
            let tag = match ev {
                RegistryEvent::Added(_) => "added",
                RegistryEvent::Removed(_) => "removed",
                RegistryEvent::Changed(_) => "changed",
            };
            sink.lock()
                .unwrap()
                .push(format!("{tag} {}", ev.device().backend_id()));
        });
        seen
    }

    #[test]
    fn test_set_up_is_idempotent() {
        let mut reg = registry();
        reg.set_up(SetupFlags::empty()).unwrap();
        reg.set_up(SetupFlags::empty()).unwrap();
        assert_eq!(reg.backend().probe_count(), 1);
        assert_eq!(reg.state(), RegistryState::SetUp);
    }

    #[test]
    fn test_invalidate_then_set_up_probes_again() {
        let mut reg = registry().with_invalidate(true);
        reg.set_up(SetupFlags::empty()).unwrap();
        reg.invalidate().unwrap();
        assert_eq!(reg.backend().invalidate_count(), 1);
        reg.set_up(SetupFlags::empty()).unwrap();
        assert_eq!(reg.backend().probe_count(), 2);
    }

    #[test]
    fn test_invalidate_without_capability_is_rejected() {
        let mut reg = registry();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| reg.invalidate()));
        match outcome {
            Err(_) => assert!(cfg!(debug_assertions)),
            Ok(result) => assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal),
        }
    }

    #[test]
    fn test_failed_probe_disables() {
        let mut reg = registry();
        reg.backend_mut().fail_probe(ErrorKind::PermissionDenied);

        let err = reg.set_up(SetupFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!reg.is_enabled());
        assert!(reg.coldplug(&mut |_: u8| {}).is_err());
        assert_eq!(reg.backend().enumerate_count(), 0);

        reg.set_enabled(true);
        assert!(reg.is_enabled());
    }

    #[test]
    fn test_coldplug_sets_up_and_sorts() {
        let mut reg = registry();
        reg.backend_mut()
            .add_present(Device::new("usb:002-001", DeviceKind::Usb));
        reg.backend_mut()
            .add_present(Device::new("usb:001-009", DeviceKind::Usb));
        let seen = recorder(&mut reg);
        let mut pcts = Vec::new();

        reg.coldplug(&mut |p: u8| pcts.push(p)).unwrap();

        assert_eq!(reg.state(), RegistryState::Coldplugged);
        assert_eq!(reg.backend().probe_count(), 1);
        let ids: Vec<_> = reg.get_devices().iter().map(|d| d.backend_id()).collect();
        assert_eq!(ids, vec!["usb:001-009", "usb:002-001"]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["added usb:002-001", "added usb:001-009"]
        );
        assert_eq!(pcts, vec![10, 100]);
    }

    #[test]
    fn test_hotplug_creates_device_through_backend() {
        let mut reg = registry();
        reg.backend_mut()
            .add_present(Device::new("usb:004-002", DeviceKind::Usb).with_version("2.1"));
        let seen = recorder(&mut reg);

        reg.device_hotplugged("usb:004-002").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["added usb:004-002"]);
        assert_eq!(reg.lookup_by_id("usb:004-002").unwrap().version(), Some("2.1"));

        let err = reg.device_hotplugged("usb:009-009").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(reg.len(), 1);

        reg.set_enabled(false);
        let err = reg.device_hotplugged("usb:004-002").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_add_replaces() {
        let mut reg = registry();
        reg.device_added(Device::new("a", DeviceKind::Usb).with_version("1"))
            .unwrap();
        reg.device_added(Device::new("a", DeviceKind::Usb).with_version("2"))
            .unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup_by_id("a").unwrap().version(), Some("2"));
    }

    #[test]
    fn test_change_untracked_is_not_found() {
        let mut reg = registry();
        let err = reg
            .device_changed(Device::new("ghost", DeviceKind::Usb))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cross_thread_mutation_is_rejected() {
        let mut reg = registry();
        let outcome = std::thread::spawn(move || {
            reg.device_added(Device::new("x", DeviceKind::Usb))
                .map_err(|e| e.kind())
        })
        .join();
        match outcome {
            Err(_) => assert!(cfg!(debug_assertions)),
            Ok(result) => assert_eq!(result, Err(ErrorKind::Internal)),
        }
    }

    #[test]
    fn test_backend_without_emulation_replays_nothing() {
        let mut reg = BackendRegistry::new(
            EmulatedBackend::new("pci", DeviceKind::Pci).without_emulation(),
            Arc::new(Context::default()),
        );
        let doc = EmulationDocument::parse(r#"{"PciDevices": "garbage"}"#).unwrap();
        reg.load_from_log(&doc).unwrap();
        assert!(reg.is_empty());
        assert!(reg.save_to_log(&mut EmulationDocument::new()).is_err());
    }
}
