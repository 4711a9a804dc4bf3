//! fwup-core: device registry and firmware update engine.
//!
//! This crate tracks the devices of a discovery domain and drives
//! firmware updates through them. Live hardware and recorded emulation
//! logs go through the same code paths.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Device**: identity, flags and the `DeviceCapability` trait each
//!   hardware family implements (plus a mock)
//! - **Backend**: discovery domains and the `BackendRegistry` that owns
//!   their devices, with emulation replay
//! - **Emulation**: recorded request/response logs and the JSON document
//! - **Transfer**: lazy chunking and the per-chunk send loop
//! - **Verify**: readback and device checksum verification
//! - **State**: the session state machine
//! - **Session**: high-level orchestrator for one update
//! - **Events**: observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use fwup_core::{Context, Device, DeviceKind, MockDevice, UpdateSession};
//!
//! let ctx = Context::default();
//! let mut device = Device::new("usb:001-004", DeviceKind::Usb);
//! let mut capability = MockDevice::new();
//! let payload = std::fs::read("firmware.bin").expect("read firmware");
//!
//! let report = UpdateSession::new(&ctx, &mut device, &mut capability, &payload)
//!     .run()
//!     .expect("update failed");
//! assert!(report.is_success());
//! ```

pub mod backend;
pub mod checksum;
pub mod config;
pub mod device;
pub mod emulation;
pub mod error;
pub mod events;
pub mod progress;
pub mod replug;
pub mod retry;
pub mod session;
pub mod state;
pub mod transfer;
pub mod verify;

// Re-exports for convenience
pub use backend::{
    BackendCapability, BackendRegistry, DeviceSink, EmulatedBackend, RegistryEvent,
    RegistryState, SetupFlags, UsbBackend,
};
pub use checksum::ChecksumAlgorithm;
pub use config::{Context, EngineConfig, Quirk};
pub use device::{
    Device, DeviceCapability, DeviceFlags, DeviceKind, ErrorClass, MockDevice, TransferParams,
    VerifyStrategy,
};
pub use emulation::{DeviceEvent, DeviceRecord, EmulationDocument, EventLog};
pub use error::{Error, ErrorKind, Result};
pub use events::{NullObserver, TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
pub use progress::{Progress, ProgressSink};
pub use replug::{ReplugMatch, ReplugMonitor, ReplugSource};
pub use retry::{Backoff, RetryLedger, RetryPolicy};
pub use session::{CancelToken, SessionError, SessionReport, UpdateSession};
pub use state::{FailureReason, SessionState};
pub use transfer::{Chunk, ChunkLayout, ChunkTransfer, Chunks, TransferStats};
pub use verify::{Verification, Verifier};
