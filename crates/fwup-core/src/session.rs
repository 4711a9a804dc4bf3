//! Update session - orchestrates one firmware update of one device.
//!
//! A session walks prepare, detach, write, verify, attach, an optional
//! replug wait and reload, driving the device through its
//! [`DeviceCapability`]. It runs to completion on the calling thread and
//! is consumed by [`UpdateSession::run`]; a second update needs a new
//! session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::Context;
use crate::device::{Device, DeviceCapability, DeviceFlags};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{TracingObserver, UpdateEvent, UpdateObserver, UpdatePhase};
use crate::progress::Progress;
use crate::replug::{ReplugMatch, ReplugSource};
use crate::retry::{self, RetryLedger};
use crate::state::{FailureReason, SessionState, StateMachineContext};
use crate::transfer::{ChunkLayout, ChunkTransfer, Chunks, TransferEvent, TransferStats};
use crate::verify::{Verification, Verifier};

/// Cooperative cancellation flag, checked between states.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished session did.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Identity of the device at the end of the session.
    pub backend_id: String,
    /// States entered, in order, not including `Idle`.
    pub states: Vec<SessionState>,
    pub final_state: SessionState,
    pub retries: RetryLedger,
    pub transfer: Option<TransferStats>,
    pub verification: Option<Verification>,
    /// Device version after reload.
    pub version: Option<String>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.final_state == SessionState::Complete
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.final_state {
            SessionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// The device is likely stuck in bootloader mode and must be power
    /// cycled by hand.
    pub fn needs_manual_replug(&self) -> bool {
        self.failure().is_some_and(|r| r.needs_manual_replug)
    }
}

/// A failed session: the error and the report up to the failure.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct SessionError {
    pub report: SessionReport,
    pub source: Error,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn phase(&self) -> Option<UpdatePhase> {
        self.report.failure().map(|r| r.phase)
    }
}

/// Relative share of overall progress per phase.
const PHASE_WEIGHTS: [(UpdatePhase, u32); 5] = [
    (UpdatePhase::Detach, 5),
    (UpdatePhase::Write, 60),
    (UpdatePhase::Verify, 25),
    (UpdatePhase::Attach, 5),
    (UpdatePhase::Reload, 5),
];

/// One update attempt against one device.
pub struct UpdateSession<'a, D: ?Sized> {
    ctx: &'a Context,
    device: &'a mut Device,
    capability: &'a mut D,
    payload: &'a [u8],
    observer: Arc<dyn UpdateObserver>,
    replug: Option<&'a dyn ReplugSource>,
    cancel: CancelToken,
    machine: StateMachineContext,
    ledger: RetryLedger,
    progress: Progress<UpdatePhase>,
    transfer: Option<TransferStats>,
    verification: Option<Verification>,
}

impl<'a, D: DeviceCapability + ?Sized> UpdateSession<'a, D> {
    pub fn new(
        ctx: &'a Context,
        device: &'a mut Device,
        capability: &'a mut D,
        payload: &'a [u8],
    ) -> Self {
        let progress = PHASE_WEIGHTS
            .iter()
            .fold(Progress::new(), |p, &(phase, weight)| p.with_step(phase, weight));
        Self {
            ctx,
            device,
            capability,
            payload,
            observer: Arc::new(TracingObserver),
            replug: None,
            cancel: CancelToken::new(),
            machine: StateMachineContext::new(),
            ledger: RetryLedger::new(),
            progress,
            transfer: None,
            verification: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Where to wait for the device after a reset.
    pub fn with_replug(mut self, source: &'a dyn ReplugSource) -> Self {
        self.replug = Some(source);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.machine.state
    }

    /// Run every phase to a terminal state.
    #[instrument(skip(self), fields(device = %self.device.backend_id(), bytes = self.payload.len()))]
    pub fn run(mut self) -> std::result::Result<SessionReport, SessionError> {
        match self.drive() {
            Ok(()) => {
                info!(retries = self.ledger.total(), "Update session complete");
                Ok(self.report())
            }
            Err(e) => {
                let phase = e.phase().unwrap_or(UpdatePhase::Prepare);
                self.fail(phase, &e);
                Err(SessionError {
                    report: self.report(),
                    source: e,
                })
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        let detach_replug = self.capability.replug_after_detach();
        let attach_replug = self.capability.wait_for_replug_required();

        self.check_cancel(UpdatePhase::Prepare)?;
        self.prepare(detach_replug || attach_replug)
            .map_err(|e| e.in_phase(UpdatePhase::Prepare))?;
        self.enter(SessionState::Prepared)?;

        self.check_cancel(UpdatePhase::Detach)?;
        if detach_replug {
            self.arm_replug();
        }
        self.retry_phase(UpdatePhase::Detach, |cap, _| cap.detach())?;
        self.enter(SessionState::Detached)?;
        self.step_done();
        if detach_replug {
            self.await_replug()?;
        }

        self.check_cancel(UpdatePhase::Write)?;
        self.enter(SessionState::Writing)?;
        let layout = self.layout();
        self.write(layout)
            .map_err(|e| e.in_phase(UpdatePhase::Write))?;
        self.step_done();

        self.check_cancel(UpdatePhase::Verify)?;
        self.enter(SessionState::Verifying)?;
        self.verify(layout)
            .map_err(|e| e.in_phase(UpdatePhase::Verify))?;
        self.step_done();

        self.check_cancel(UpdatePhase::Attach)?;
        if attach_replug {
            self.arm_replug();
        }
        self.retry_phase(UpdatePhase::Attach, |cap, _| cap.attach())?;
        self.enter(SessionState::Attached)?;
        self.step_done();
        if attach_replug {
            self.await_replug()?;
        }

        self.check_cancel(UpdatePhase::Reload)?;
        self.retry_phase(UpdatePhase::Reload, |cap, device| cap.reload(device))?;
        self.enter(SessionState::Reloaded)?;
        self.step_done();

        self.enter(SessionState::Complete)?;
        self.observer.on_event(&UpdateEvent::Complete);
        Ok(())
    }

    /// Never retried: after a failed prepare the device state is unknown.
    fn prepare(&mut self, needs_replug: bool) -> Result<()> {
        if self.payload.is_empty() {
            return Err(Error::InvalidData("firmware payload is empty".into()));
        }
        if needs_replug && self.replug.is_none() {
            return Err(Error::NotSupported(
                "device re-enumerates during update but no replug source is set".into(),
            ));
        }
        self.capability.prepare(self.payload)
    }

    fn layout(&self) -> ChunkLayout {
        let params = self.capability.transfer_params();
        let max = self
            .ctx
            .max_chunk_size_for(self.device.kind(), params.max_chunk_size);
        let layout = ChunkLayout::new(params.start_address, max);
        match params.page_size {
            Some(page) => layout.with_page_size(page),
            None => layout,
        }
    }

    fn write(&mut self, layout: ChunkLayout) -> Result<()> {
        let params = self.capability.transfer_params();
        let chunks = Chunks::new(self.payload, layout)?;
        let engine = ChunkTransfer::new(self.ctx.chunk_retry_policy(), self.ctx.chunk_timeout())
            .with_zlp(params.zlp_packet_size);

        let observer = &self.observer;
        let progress = &mut self.progress;
        let stats = engine.run(&mut *self.capability, chunks, &mut self.ledger, |ev| match ev {
            TransferEvent::ChunkWritten {
                index,
                address,
                length,
                done,
                total,
            } => {
                observer.on_event(&UpdateEvent::ChunkWritten {
                    index,
                    address,
                    length,
                });
                if let Some(percentage) = progress.set_child(done, total) {
                    observer.on_event(&UpdateEvent::Progress {
                        phase: UpdatePhase::Write,
                        percentage,
                    });
                }
            }
            TransferEvent::Retry {
                index,
                attempt,
                max_attempts,
                message,
            } => observer.on_event(&UpdateEvent::Retry {
                phase: UpdatePhase::Write,
                chunk: Some(index),
                attempt,
                max_attempts,
                message,
            }),
        })?;
        self.transfer = Some(stats);
        Ok(())
    }

    fn verify(&mut self, layout: ChunkLayout) -> Result<()> {
        let strategy = self.capability.verify_strategy();
        let verifier = Verifier::new(self.ctx.chunk_retry_policy(), self.ctx.chunk_timeout());

        let observer = &self.observer;
        let progress = &mut self.progress;
        let outcome = verifier.run(
            &mut *self.capability,
            strategy,
            self.payload,
            layout,
            &mut self.ledger,
            |done, total| {
                if let Some(percentage) = progress.set_child(done, total) {
                    observer.on_event(&UpdateEvent::Progress {
                        phase: UpdatePhase::Verify,
                        percentage,
                    });
                }
            },
        )?;
        self.verification = Some(outcome);
        Ok(())
    }

    /// Run a device step under the phase retry policy.
    fn retry_phase<T, F>(&mut self, phase: UpdatePhase, mut op: F) -> Result<T>
    where
        F: FnMut(&mut D, &mut Device) -> Result<T>,
    {
        let policy = self.ctx.phase_retry_policy();
        let max_attempts = policy.attempts;
        let device = &mut *self.device;
        let ledger = &mut self.ledger;
        let observer = &self.observer;
        retry::run(
            &policy,
            &mut *self.capability,
            |cap| op(cap, &mut *device),
            |attempt, err| {
                ledger.record_phase(phase);
                observer.on_event(&UpdateEvent::Retry {
                    phase,
                    chunk: None,
                    attempt,
                    max_attempts,
                    message: err.to_string(),
                });
            },
        )
        .map(|(value, _)| value)
        .map_err(|e| e.in_phase(phase))
    }

    fn arm_replug(&self) {
        if let Some(source) = self.replug {
            source.arm();
        }
    }

    fn remove_delay(&self) -> Duration {
        let declared = match self.capability.declared_remove_delay() {
            d if !d.is_zero() => d,
            _ => self.device.remove_delay().unwrap_or(Duration::ZERO),
        };
        self.ctx.remove_delay_for(self.device.kind(), declared)
    }

    fn await_replug(&mut self) -> Result<()> {
        let phase = UpdatePhase::AwaitReplug;
        self.enter(SessionState::AwaitingReplug)?;
        let Some(source) = self.replug else {
            return Err(Error::Internal("no replug source".into()).in_phase(phase));
        };
        let timeout = self.remove_delay();
        self.observer.on_event(&UpdateEvent::WaitingForReplug {
            timeout_ms: timeout.as_millis() as u64,
        });

        let want = ReplugMatch::for_device(&*self.device);
        self.device.add_flag(DeviceFlags::WAIT_FOR_REPLUG);
        let result = source.wait_for(&want, timeout);
        self.device.remove_flag(DeviceFlags::WAIT_FOR_REPLUG);

        let replugged = result.map_err(|e| e.in_phase(phase))?;
        self.device.adopt_identity(&replugged);
        self.observer.on_event(&UpdateEvent::DeviceReplugged {
            backend_id: replugged.backend_id().to_string(),
        });
        Ok(())
    }

    fn check_cancel(&self, next: UpdatePhase) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(phase = %next, "Session cancelled");
            return Err(Error::Cancelled.in_phase(next));
        }
        Ok(())
    }

    fn enter(&mut self, to: SessionState) -> Result<()> {
        let from = self.machine.goto_state(to)?;
        self.observer
            .on_event(&UpdateEvent::StateChanged { from, to });
        Ok(())
    }

    fn step_done(&mut self) {
        let phase = self.progress.current();
        if let (Some(phase), Some(percentage)) = (phase, self.progress.step_done()) {
            self.observer
                .on_event(&UpdateEvent::Progress { phase, percentage });
        }
    }

    fn fail(&mut self, phase: UpdatePhase, err: &Error) {
        let kind = err.kind();
        let needs_manual_replug = phase == UpdatePhase::AwaitReplug && kind == ErrorKind::Timeout;
        let reason = FailureReason {
            phase,
            kind,
            retries_exhausted: err.is_retries_exhausted(),
            needs_manual_replug,
        };
        if let Err(e) = self.enter(SessionState::Failed(reason)) {
            warn!(error = %e, "Could not record failure");
        }
        self.observer.on_event(&UpdateEvent::Failed {
            phase,
            kind,
            message: err.to_string(),
            needs_manual_replug,
        });
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            backend_id: self.device.backend_id().to_string(),
            states: self.machine.history.clone(),
            final_state: self.machine.state,
            retries: self.ledger.clone(),
            transfer: self.transfer,
            verification: self.verification,
            version: self.device.version().map(str::to_string),
        }
    }
}
