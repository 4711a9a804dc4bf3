//! Post-write verification.
//!
//! Readback compares every byte against the source buffer; device checksum
//! asks the device for a running sum per chunk in its own algorithm, seeded
//! by the sum of all previous chunks. A device declaring neither is reported as
//! unverified, never as verified.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::device::{DeviceCapability, VerifyStrategy};
use crate::error::{Error, Result};
use crate::events::UpdatePhase;
use crate::retry::{self, RetryLedger, RetryPolicy};
use crate::transfer::{ChunkLayout, Chunks};

/// Outcome of the verify phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Every chunk matched using the given strategy.
    Verified(VerifyStrategy),
    /// The device is write-only; nothing was checked.
    Unverified,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified(_))
    }
}

pub struct Verifier {
    policy: RetryPolicy,
    timeout: Duration,
}

impl Verifier {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self { policy, timeout }
    }

    /// Verify `payload` as laid out by `layout`. `on_progress` receives
    /// `(chunks_done, total)` after each chunk.
    #[instrument(level = "debug", skip_all, fields(strategy = ?strategy, bytes = payload.len()))]
    pub fn run<D, F>(
        &self,
        device: &mut D,
        strategy: VerifyStrategy,
        payload: &[u8],
        layout: ChunkLayout,
        ledger: &mut RetryLedger,
        on_progress: F,
    ) -> Result<Verification>
    where
        D: DeviceCapability + ?Sized,
        F: FnMut(usize, usize),
    {
        let chunks = Chunks::new(payload, layout)?;
        match strategy {
            VerifyStrategy::ReadBack => self.read_back(device, chunks, ledger, on_progress)?,
            VerifyStrategy::DeviceChecksum => {
                self.device_checksum(device, chunks, ledger, on_progress)?
            }
            VerifyStrategy::None => {
                warn!("Device is write-only, firmware was not verified");
                return Ok(Verification::Unverified);
            }
        }
        info!(strategy = ?strategy, "Verification passed");
        Ok(Verification::Verified(strategy))
    }

    fn read_back<D, F>(
        &self,
        device: &mut D,
        chunks: Chunks<'_>,
        ledger: &mut RetryLedger,
        mut on_progress: F,
    ) -> Result<()>
    where
        D: DeviceCapability + ?Sized,
        F: FnMut(usize, usize),
    {
        let total = chunks.total();
        let timeout = self.timeout;
        for chunk in chunks {
            let (actual, _) = retry::run(
                &self.policy,
                device,
                |dev| dev.read_back(chunk.address, chunk.len(), timeout),
                |_, _| ledger.record_phase(UpdatePhase::Verify),
            )
            .map_err(|e| e.in_chunk(chunk.index, chunk.address))?;

            if actual.len() != chunk.len() {
                return Err(Error::InvalidData(format!(
                    "readback at 0x{:X} returned {} bytes, expected {}",
                    chunk.address,
                    actual.len(),
                    chunk.len()
                )));
            }
            if let Some(i) = chunk.data.iter().zip(&actual).position(|(a, b)| a != b) {
                return Err(Error::Mismatch {
                    offset: chunk.offset + i,
                    address: chunk.address + i as u64,
                    expected: chunk.data[i],
                    actual: actual[i],
                });
            }
            debug!(index = chunk.index, "Readback matched");
            on_progress(chunk.index + 1, total);
        }
        Ok(())
    }

    fn device_checksum<D, F>(
        &self,
        device: &mut D,
        chunks: Chunks<'_>,
        ledger: &mut RetryLedger,
        mut on_progress: F,
    ) -> Result<()>
    where
        D: DeviceCapability + ?Sized,
        F: FnMut(usize, usize),
    {
        let total = chunks.total();
        let timeout = self.timeout;
        let algorithm = device.checksum_algorithm();
        let mut seed = 0u16;
        for chunk in chunks {
            let expected = algorithm
                .compute(seed, chunk.data)
                .map_err(|e| e.in_chunk(chunk.index, chunk.address))?;
            let (actual, _) = retry::run(
                &self.policy,
                device,
                |dev| dev.compute_checksum(chunk.address, chunk.len(), seed, timeout),
                |_, _| ledger.record_phase(UpdatePhase::Verify),
            )
            .map_err(|e| e.in_chunk(chunk.index, chunk.address))?;

            if actual != expected {
                return Err(Error::ChecksumMismatch {
                    address: chunk.address,
                    expected,
                    actual,
                });
            }
            seed = expected;
            on_progress(chunk.index + 1, total);
        }
        Ok(())
    }
}
