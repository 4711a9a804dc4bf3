//! Event system for UI decoupling.
//!
//! Sessions report phase changes, progress and retries through an
//! [`UpdateObserver`] so front ends never reach into the core.

use std::fmt;

use crate::error::ErrorKind;
use crate::state::SessionState;

/// Update phases; each one drives the session from one state to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdatePhase {
    /// Device-specific pre-conditions.
    Prepare,
    /// Leave runtime mode for bootloader mode.
    Detach,
    /// Chunked payload transfer.
    Write,
    /// Readback or device checksum.
    Verify,
    /// Leave bootloader mode.
    Attach,
    /// Waiting for the device to re-enumerate.
    AwaitReplug,
    /// Re-run property discovery.
    Reload,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Prepare => write!(f, "Prepare"),
            UpdatePhase::Detach => write!(f, "Detach"),
            UpdatePhase::Write => write!(f, "Write"),
            UpdatePhase::Verify => write!(f, "Verify"),
            UpdatePhase::Attach => write!(f, "Attach"),
            UpdatePhase::AwaitReplug => write!(f, "Await Replug"),
            UpdatePhase::Reload => write!(f, "Reload"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Session moved between states.
    StateChanged { from: SessionState, to: SessionState },
    /// Overall progress, 0-100, never regressing.
    Progress { phase: UpdatePhase, percentage: u8 },
    /// A chunk reached the device.
    ChunkWritten {
        index: usize,
        address: u64,
        length: usize,
    },
    /// A transient failure is being retried.
    Retry {
        phase: UpdatePhase,
        chunk: Option<usize>,
        attempt: u32,
        max_attempts: u32,
        message: String,
    },
    /// Waiting for the device to come back.
    WaitingForReplug { timeout_ms: u64 },
    /// The device re-enumerated.
    DeviceReplugged { backend_id: String },
    /// The session reached its failed state.
    Failed {
        phase: UpdatePhase,
        kind: ErrorKind,
        message: String,
        needs_manual_replug: bool,
    },
    /// All phases completed.
    Complete,
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            UpdateEvent::Progress { phase, percentage } => {
                tracing::debug!(phase = %phase, progress = %format!("{}%", percentage), "Progress");
            }
            UpdateEvent::ChunkWritten {
                index,
                address,
                length,
            } => {
                tracing::trace!(
                    index = index,
                    address = %format!("0x{:08X}", address),
                    len = length,
                    "Chunk written"
                );
            }
            UpdateEvent::Retry {
                phase,
                chunk,
                attempt,
                max_attempts,
                message,
            } => {
                tracing::warn!(
                    phase = %phase,
                    chunk = ?chunk,
                    "Retry {}/{}: {}",
                    attempt,
                    max_attempts,
                    message
                );
            }
            UpdateEvent::WaitingForReplug { timeout_ms } => {
                tracing::info!(timeout_ms = timeout_ms, "Waiting for replug");
            }
            UpdateEvent::DeviceReplugged { backend_id } => {
                tracing::info!(backend_id = %backend_id, "Device replugged");
            }
            UpdateEvent::Failed {
                phase,
                kind,
                message,
                needs_manual_replug,
            } => {
                if *needs_manual_replug {
                    tracing::error!(
                        phase = %phase,
                        kind = %kind,
                        "Device did not come back, power-cycle required: {}",
                        message
                    );
                } else {
                    tracing::error!(phase = %phase, kind = %kind, "Update failed: {}", message);
                }
            }
            UpdateEvent::Complete => {
                tracing::info!("Update complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn every_event() -> Vec<UpdateEvent> {
        vec![
            UpdateEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Prepared,
            },
            UpdateEvent::Progress {
                phase: UpdatePhase::Write,
                percentage: 40,
            },
            UpdateEvent::ChunkWritten {
                index: 3,
                address: 0x0800_00C0,
                length: 64,
            },
            UpdateEvent::Retry {
                phase: UpdatePhase::Write,
                chunk: Some(3),
                attempt: 1,
                max_attempts: 3,
                message: "busy".into(),
            },
            UpdateEvent::WaitingForReplug { timeout_ms: 5000 },
            UpdateEvent::DeviceReplugged {
                backend_id: "usb:001-005".into(),
            },
            UpdateEvent::Failed {
                phase: UpdatePhase::AwaitReplug,
                kind: ErrorKind::Timeout,
                message: "gone".into(),
                needs_manual_replug: true,
            },
            UpdateEvent::Complete,
        ]
    }

    struct Collect(Mutex<Vec<String>>);

    impl UpdateObserver for Collect {
        fn on_event(&self, event: &UpdateEvent) {
            self.0.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[test]
    fn test_observers_accept_every_event() {
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let observers: [Arc<dyn UpdateObserver>; 3] =
            [Arc::new(TracingObserver), Arc::new(NullObserver), collect.clone()];
        for event in every_event() {
            for observer in &observers {
                observer.on_event(&event);
            }
        }
        assert_eq!(collect.0.lock().unwrap().len(), every_event().len());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(UpdatePhase::AwaitReplug.to_string(), "Await Replug");
        assert_eq!(UpdatePhase::Verify.to_string(), "Verify");
    }
}
