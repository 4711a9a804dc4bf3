//! Mock device capability for testing session logic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::traits::{DeviceCapability, TransferParams, VerifyStrategy};
use super::Device;
use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, ErrorKind, Result};
use crate::transfer::Chunk;

/// Value of unwritten memory.
const ERASED: u8 = 0xFF;

/// Steps a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Prepare,
    Detach,
    Attach,
    Reload,
    ReadBack,
    Zlp,
}

/// Recorded call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Prepare { len: usize },
    Detach,
    WriteChunk { index: usize, address: u64, len: usize },
    Zlp,
    ReadBack { address: u64, len: usize },
    Checksum { address: u64, len: usize, seed: u16 },
    Attach,
    Reload,
    Recover,
}

type Hook = Box<dyn FnMut() + Send>;

/// In-memory flash with fault injection.
pub struct MockDevice {
    memory: BTreeMap<u64, u8>,
    corruption: BTreeMap<u64, u8>,
    params: TransferParams,
    strategy: VerifyStrategy,
    algorithm: ChecksumAlgorithm,
    readback_supported: bool,
    chunk_faults: HashMap<usize, VecDeque<ErrorKind>>,
    op_faults: HashMap<MockOp, VecDeque<ErrorKind>>,
    write_attempts: HashMap<usize, u32>,
    checksum_seeds: Vec<u16>,
    calls: Vec<MockCall>,
    remove_delay: Duration,
    replug_after_attach: bool,
    replug_after_detach: bool,
    on_detach: Option<Hook>,
    on_attach: Option<Hook>,
    reload_version: Option<String>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            corruption: BTreeMap::new(),
            params: TransferParams::default(),
            strategy: VerifyStrategy::ReadBack,
            algorithm: ChecksumAlgorithm::default(),
            readback_supported: true,
            chunk_faults: HashMap::new(),
            op_faults: HashMap::new(),
            write_attempts: HashMap::new(),
            checksum_seeds: Vec::new(),
            calls: Vec::new(),
            remove_delay: Duration::ZERO,
            replug_after_attach: false,
            replug_after_detach: false,
            on_detach: None,
            on_attach: None,
            reload_version: None,
        }
    }

    pub fn with_params(mut self, params: TransferParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_verify(mut self, strategy: VerifyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Keep declaring readback but fail it as unsupported.
    pub fn without_readback(mut self) -> Self {
        self.readback_supported = false;
        self
    }

    /// Version reported by the next reload.
    pub fn with_reload_version(mut self, version: impl Into<String>) -> Self {
        self.reload_version = Some(version.into());
        self
    }

    /// Device re-enumerates after attach; `hook` runs inside `attach()`.
    pub fn with_replug_after_attach(
        mut self,
        remove_delay: Duration,
        hook: impl FnMut() + Send + 'static,
    ) -> Self {
        self.replug_after_attach = true;
        self.remove_delay = remove_delay;
        self.on_attach = Some(Box::new(hook));
        self
    }

    /// Device re-enumerates after detach; `hook` runs inside `detach()`.
    pub fn with_replug_after_detach(
        mut self,
        remove_delay: Duration,
        hook: impl FnMut() + Send + 'static,
    ) -> Self {
        self.replug_after_detach = true;
        self.remove_delay = remove_delay;
        self.on_detach = Some(Box::new(hook));
        self
    }

    /// Fail the next `times` writes of chunk `index` with `kind`.
    pub fn fail_chunk(&mut self, index: usize, times: usize, kind: ErrorKind) {
        self.chunk_faults
            .entry(index)
            .or_default()
            .extend(std::iter::repeat_n(kind, times));
    }

    /// Fail the next `times` calls of `op` with `kind`.
    pub fn fail_op(&mut self, op: MockOp, times: usize, kind: ErrorKind) {
        self.op_faults
            .entry(op)
            .or_default()
            .extend(std::iter::repeat_n(kind, times));
    }

    /// XOR the byte at `address` with `mask` whenever it is read.
    pub fn corrupt(&mut self, address: u64, mask: u8) {
        self.corruption.insert(address, mask);
    }

    pub fn load_memory(&mut self, base: u64, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(base + i as u64, b);
        }
    }

    /// Raw memory contents, ignoring read corruption.
    pub fn memory(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(ERASED))
            .collect()
    }

    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    /// Number of times chunk `index` was attempted.
    pub fn write_attempts(&self, index: usize) -> u32 {
        self.write_attempts.get(&index).copied().unwrap_or(0)
    }

    /// Seeds passed to `compute_checksum`, in call order.
    pub fn checksum_seeds(&self) -> &[u16] {
        &self.checksum_seeds
    }

    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let mut data = self.memory(address, len);
        for (i, b) in data.iter_mut().enumerate() {
            if let Some(mask) = self.corruption.get(&(address + i as u64)) {
                *b ^= mask;
            }
        }
        data
    }

    fn injected(&mut self, op: MockOp) -> Result<()> {
        match self.op_faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(kind) => Err(Error::from_kind(kind, format!("injected {op:?} fault"))),
            None => Ok(()),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCapability for MockDevice {
    fn prepare(&mut self, payload: &[u8]) -> Result<()> {
        self.calls.push(MockCall::Prepare { len: payload.len() });
        self.injected(MockOp::Prepare)
    }

    fn detach(&mut self) -> Result<()> {
        self.calls.push(MockCall::Detach);
        self.injected(MockOp::Detach)?;
        if let Some(hook) = self.on_detach.as_mut() {
            hook();
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &Chunk<'_>, _timeout: Duration) -> Result<()> {
        *self.write_attempts.entry(chunk.index).or_default() += 1;
        self.calls.push(MockCall::WriteChunk {
            index: chunk.index,
            address: chunk.address,
            len: chunk.len(),
        });
        if let Some(kind) = self
            .chunk_faults
            .get_mut(&chunk.index)
            .and_then(VecDeque::pop_front)
        {
            return Err(Error::from_kind(
                kind,
                format!("injected fault on chunk {}", chunk.index),
            ));
        }
        self.load_memory(chunk.address, chunk.data);
        Ok(())
    }

    fn write_zlp(&mut self, _timeout: Duration) -> Result<()> {
        self.calls.push(MockCall::Zlp);
        self.injected(MockOp::Zlp)
    }

    fn verify_strategy(&self) -> VerifyStrategy {
        self.strategy
    }

    fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    fn read_back(&mut self, address: u64, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        self.calls.push(MockCall::ReadBack { address, len });
        if !self.readback_supported {
            return Err(Error::NotSupported("mock readback disabled".into()));
        }
        self.injected(MockOp::ReadBack)?;
        Ok(self.read(address, len))
    }

    fn compute_checksum(
        &mut self,
        address: u64,
        len: usize,
        seed: u16,
        _timeout: Duration,
    ) -> Result<u16> {
        self.calls.push(MockCall::Checksum { address, len, seed });
        self.checksum_seeds.push(seed);
        self.algorithm.compute(seed, &self.read(address, len))
    }

    fn attach(&mut self) -> Result<()> {
        self.calls.push(MockCall::Attach);
        self.injected(MockOp::Attach)?;
        if let Some(hook) = self.on_attach.as_mut() {
            hook();
        }
        Ok(())
    }

    fn reload(&mut self, device: &mut Device) -> Result<()> {
        self.calls.push(MockCall::Reload);
        self.injected(MockOp::Reload)?;
        if let Some(version) = &self.reload_version {
            device.set_version(version.clone());
        }
        Ok(())
    }

    fn recover(&mut self, _err: &Error) -> Result<()> {
        self.calls.push(MockCall::Recover);
        Ok(())
    }

    fn declared_remove_delay(&self) -> Duration {
        self.remove_delay
    }

    fn wait_for_replug_required(&self) -> bool {
        self.replug_after_attach
    }

    fn replug_after_detach(&self) -> bool {
        self.replug_after_detach
    }

    fn transfer_params(&self) -> TransferParams {
        self.params
    }
}
