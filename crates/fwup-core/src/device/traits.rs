//! Device capability interface.
//!
//! Defines the `DeviceCapability` trait every hardware family implements,
//! allowing one session engine to drive all of them (and the mock).

use std::time::Duration;

use super::Device;
use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, ErrorKind, Result};
use crate::transfer::Chunk;

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// How a device proves that a write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStrategy {
    /// Re-read the written range and compare byte for byte.
    ReadBack,
    /// Ask the device for a running sum per chunk, computed with its
    /// [`DeviceCapability::checksum_algorithm`].
    DeviceChecksum,
    /// Write-only device; the session reports the update as unverified.
    None,
}

/// Transfer geometry declared by a device or its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    /// First address written, or `None` for unaddressed protocols.
    pub start_address: Option<u64>,
    /// Largest chunk a single transport operation accepts.
    pub max_chunk_size: usize,
    /// Hardware page size; chunks never straddle a page.
    pub page_size: Option<u64>,
    /// Max packet size of the transport if it needs a trailing
    /// zero-length packet after an exact multiple.
    pub zlp_packet_size: Option<usize>,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            start_address: None,
            max_chunk_size: 64,
            page_size: None,
            zlp_packet_size: None,
        }
    }
}

/// Device-specific steps of an update.
///
/// Shared-bus exclusion (two devices on one I2C bus) is the
/// implementation's job: take the bus lock inside these methods.
pub trait DeviceCapability {
    /// Pre-conditions such as disabling write protection.
    fn prepare(&mut self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Leave runtime mode and enter bootloader mode.
    fn detach(&mut self) -> Result<()>;

    /// Send one chunk. Must return within `timeout`.
    fn write_chunk(&mut self, chunk: &Chunk<'_>, timeout: Duration) -> Result<()>;

    /// Send a zero-length packet to terminate a transfer.
    fn write_zlp(&mut self, _timeout: Duration) -> Result<()> {
        Err(Error::NotSupported("zero-length packets".into()))
    }

    fn verify_strategy(&self) -> VerifyStrategy {
        VerifyStrategy::None
    }

    fn read_back(&mut self, _address: u64, _len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        Err(Error::NotSupported("readback".into()))
    }

    /// Sum used by [`DeviceCapability::compute_checksum`].
    fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Sum16
    }

    /// Device-computed sum over `len` bytes at `address`, starting from
    /// `seed`.
    fn compute_checksum(
        &mut self,
        _address: u64,
        _len: usize,
        _seed: u16,
        _timeout: Duration,
    ) -> Result<u16> {
        Err(Error::NotSupported("device checksum".into()))
    }

    /// Leave bootloader mode and resume runtime operation.
    fn attach(&mut self) -> Result<()>;

    /// Re-run property discovery so `device` reflects the new firmware.
    fn reload(&mut self, _device: &mut Device) -> Result<()> {
        Ok(())
    }

    /// Decide whether `err` is worth another attempt. Only busy status is
    /// transient unless the driver knows better.
    fn classify_error(&self, err: &Error) -> ErrorClass {
        match err.kind() {
            ErrorKind::Busy => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Called between retry attempts, e.g. to resynchronise a transport.
    fn recover(&mut self, _err: &Error) -> Result<()> {
        Ok(())
    }

    /// Replug timeout; zero means "not declared".
    fn declared_remove_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// The device vanishes and re-enumerates after attach.
    fn wait_for_replug_required(&self) -> bool {
        false
    }

    /// The device already re-enumerates after detach.
    fn replug_after_detach(&self) -> bool {
        false
    }

    fn transfer_params(&self) -> TransferParams;
}
