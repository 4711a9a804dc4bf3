//! End-to-end update sessions against the mock device.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fwup_core::device::mock::{MockCall, MockDevice};
use fwup_core::{
    BackendRegistry, CancelToken, Context, Device, DeviceFlags, DeviceKind, EmulatedBackend,
    EngineConfig, Error, ErrorKind, ReplugMonitor, SessionState, TransferParams, UpdateEvent,
    UpdateObserver, UpdatePhase, UpdateSession, Verification, VerifyStrategy,
};

const BASE: u64 = 0x0800_0000;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<UpdateEvent>>,
}

impl Recorder {
    fn progress(&self) -> Vec<u8> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::Progress { percentage, .. } => Some(*percentage),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&UpdateEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl UpdateObserver for Recorder {
    fn on_event(&self, event: &UpdateEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Cancels the session as soon as it starts writing.
struct CancelOnWrite(CancelToken);

impl UpdateObserver for CancelOnWrite {
    fn on_event(&self, event: &UpdateEvent) {
        if let UpdateEvent::StateChanged {
            to: SessionState::Writing,
            ..
        } = event
        {
            self.0.cancel();
        }
    }
}

fn ctx() -> Context {
    Context::new(EngineConfig {
        retry_delay_ms: 0,
        ..EngineConfig::default()
    })
}

fn payload() -> Vec<u8> {
    (0..256u32).map(|i| (i * 7 + 3) as u8).collect()
}

fn mock() -> MockDevice {
    MockDevice::new().with_params(TransferParams {
        start_address: Some(BASE),
        max_chunk_size: 64,
        ..TransferParams::default()
    })
}

fn target() -> Device {
    Device::new("usb:001-004", DeviceKind::Usb)
        .with_physical_id("273f:1001")
        .with_version("1.0.0")
}

#[test]
fn test_clean_update_visits_every_state() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock();
    let recorder = Arc::new(Recorder::default());

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_observer(recorder.clone())
        .run()
        .unwrap();

    assert_eq!(
        report.states,
        vec![
            SessionState::Prepared,
            SessionState::Detached,
            SessionState::Writing,
            SessionState::Verifying,
            SessionState::Attached,
            SessionState::Reloaded,
            SessionState::Complete,
        ]
    );
    assert!(report.is_success());
    assert_eq!(report.retries.total(), 0);
    assert_eq!(
        report.verification,
        Some(Verification::Verified(VerifyStrategy::ReadBack))
    );
    assert_eq!(report.transfer.unwrap().chunks, 4);
    assert_eq!(dev.memory(BASE, 256), data);

    let progress = recorder.progress();
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        recorder.count(|e| matches!(e, UpdateEvent::ChunkWritten { .. })),
        4
    );
    assert_eq!(recorder.count(|e| matches!(e, UpdateEvent::Complete)), 1);
}

#[test]
fn test_third_chunk_busy_twice_then_succeeds() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock();
    dev.fail_chunk(2, 2, ErrorKind::Busy);
    let recorder = Arc::new(Recorder::default());

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_observer(recorder.clone())
        .run()
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.retries.for_chunk(2), 2);
    assert_eq!(report.retries.chunks().collect::<Vec<_>>(), vec![(2, 2)]);
    assert_eq!(report.retries.total(), 2);
    assert_eq!(dev.write_attempts(2), 3);
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            UpdateEvent::Retry {
                phase: UpdatePhase::Write,
                chunk: Some(2),
                ..
            }
        )),
        2
    );
    assert_eq!(recorder.progress().last(), Some(&100));
}

#[test]
fn test_exhausted_chunk_fails_write_phase() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock();
    dev.fail_chunk(1, 10, ErrorKind::Busy);

    let err = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(err.phase(), Some(UpdatePhase::Write));
    let message = err.to_string();
    assert!(message.contains("chunk 1 at 0x8000040"), "{message}");
    assert!(message.contains("failed after 3 attempts"), "{message}");
    assert!(!err.report.needs_manual_replug());
    assert!(err.report.failure().unwrap().retries_exhausted);
    assert_eq!(dev.write_attempts(2), 0);
}

#[test]
fn test_corrupted_readback_names_offset() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock();
    dev.corrupt(BASE + 77, 0x01);

    let err = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidData);
    assert_eq!(err.phase(), Some(UpdatePhase::Verify));
    assert!(!err.report.failure().unwrap().retries_exhausted);
    assert!(matches!(err.source.root(), Error::Mismatch { offset: 77, .. }));
    assert!(!dev.calls().contains(&MockCall::Attach));
}

#[test]
fn test_write_only_device_is_unverified() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock().with_verify(VerifyStrategy::None);

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .run()
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.verification, Some(Verification::Unverified));
}

#[test]
fn test_cancel_waits_for_state_boundary() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let mut dev = mock();
    let cancel = CancelToken::new();

    let err = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_observer(Arc::new(CancelOnWrite(cancel.clone())))
        .with_cancel(cancel)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.phase(), Some(UpdatePhase::Verify));
    // the write phase already running was not interrupted
    for index in 0..4 {
        assert_eq!(dev.write_attempts(index), 1);
    }
    assert_eq!(dev.memory(BASE, 256), data);
}

#[test]
fn test_replug_after_attach_adopts_new_identity() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let monitor = ReplugMonitor::new();
    let feeder = monitor.clone();
    let mut dev = mock().with_replug_after_attach(Duration::from_secs(5), move || {
        feeder.device_added(
            Device::new("usb:001-009", DeviceKind::Usb).with_physical_id("273f:1001"),
        );
    });
    let recorder = Arc::new(Recorder::default());

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_observer(recorder.clone())
        .with_replug(&monitor)
        .run()
        .unwrap();

    assert_eq!(
        &report.states[4..],
        &[
            SessionState::Attached,
            SessionState::AwaitingReplug,
            SessionState::Reloaded,
            SessionState::Complete,
        ]
    );
    assert_eq!(report.backend_id, "usb:001-009");
    assert_eq!(device.backend_id(), "usb:001-009");
    assert!(!device.has_flag(DeviceFlags::WAIT_FOR_REPLUG));
    assert_eq!(
        recorder.count(|e| matches!(e, UpdateEvent::WaitingForReplug { timeout_ms: 5000 })),
        1
    );
}

#[test]
fn test_replug_after_detach_precedes_write() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let monitor = ReplugMonitor::new();
    let feeder = monitor.clone();
    let mut dev = mock().with_replug_after_detach(Duration::from_secs(5), move || {
        feeder.device_added(
            Device::new("usb:001-005", DeviceKind::Usb)
                .with_physical_id("273f:1001")
                .with_flags(DeviceFlags::IS_BOOTLOADER),
        );
    });

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_replug(&monitor)
        .run()
        .unwrap();

    assert_eq!(
        &report.states[..4],
        &[
            SessionState::Prepared,
            SessionState::Detached,
            SessionState::AwaitingReplug,
            SessionState::Writing,
        ]
    );
    assert!(device.has_flag(DeviceFlags::IS_BOOTLOADER));
}

#[test]
fn test_replug_through_registry_on_other_thread() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let monitor = ReplugMonitor::new();
    let (tx, rx) = mpsc::channel::<Device>();

    let watcher = monitor.clone();
    let registry_thread = thread::spawn(move || {
        let mut registry = BackendRegistry::new(
            EmulatedBackend::new("usb", DeviceKind::Usb),
            Arc::new(Context::default()),
        );
        registry.subscribe(watcher.subscriber());
        for device in rx {
            registry.device_added(device).unwrap();
        }
        registry.len()
    });

    let mut dev = mock().with_replug_after_attach(Duration::from_secs(5), move || {
        tx.send(Device::new("usb:002-001", DeviceKind::Usb).with_physical_id("273f:1001"))
            .unwrap();
    });

    let report = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_replug(&monitor)
        .run()
        .unwrap();
    drop(dev);

    assert_eq!(report.backend_id, "usb:002-001");
    assert_eq!(registry_thread.join().unwrap(), 1);
}

#[test]
fn test_replug_timeout_needs_manual_intervention() {
    let ctx = ctx();
    let data = payload();
    let mut device = target();
    let monitor = ReplugMonitor::new();
    let mut dev = mock().with_replug_after_attach(Duration::from_millis(30), || {});
    let recorder = Arc::new(Recorder::default());

    let err = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_observer(recorder.clone())
        .with_replug(&monitor)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.phase(), Some(UpdatePhase::AwaitReplug));
    assert!(err.report.needs_manual_replug());
    assert!(!device.has_flag(DeviceFlags::WAIT_FOR_REPLUG));
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            UpdateEvent::Failed {
                needs_manual_replug: true,
                ..
            }
        )),
        1
    );
}

#[test]
fn test_remove_delay_quirk_wins() {
    let mut config = EngineConfig {
        retry_delay_ms: 0,
        ..EngineConfig::default()
    };
    config.quirks.insert(
        "usb".into(),
        fwup_core::Quirk {
            remove_delay_ms: Some(20),
            max_chunk_size: Some(32),
        },
    );
    let ctx = Context::new(config);
    let data = payload();
    let mut device = target();
    let monitor = ReplugMonitor::new();
    let mut dev = mock().with_replug_after_attach(Duration::from_secs(60), || {});

    let err = UpdateSession::new(&ctx, &mut device, &mut dev, &data)
        .with_replug(&monitor)
        .run()
        .unwrap_err();

    assert!(matches!(err.source.root(), Error::Timeout { timeout_ms: 20, .. }));
    assert_eq!(err.report.transfer.unwrap().chunks, 8);
}
