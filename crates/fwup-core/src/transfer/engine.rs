//! Per-chunk send loop with bounded retry.

use std::time::Duration;

use tracing::{debug, info, instrument};

use super::chunk::Chunks;
use crate::device::DeviceCapability;
use crate::error::Result;
use crate::retry::{self, RetryLedger, RetryPolicy};

/// Notifications from a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A chunk was accepted by the device.
    ChunkWritten {
        index: usize,
        address: u64,
        length: usize,
        done: usize,
        total: usize,
    },
    /// A chunk failed transiently and will be re-sent.
    Retry {
        index: usize,
        attempt: u32,
        max_attempts: u32,
        message: String,
    },
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks: usize,
    pub bytes: usize,
    pub retries: u32,
    pub zlp_sent: bool,
}

/// Drives a chunk sequence into a device.
pub struct ChunkTransfer {
    policy: RetryPolicy,
    timeout: Duration,
    zlp_packet_size: Option<usize>,
}

impl ChunkTransfer {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            policy,
            timeout,
            zlp_packet_size: None,
        }
    }

    /// Terminate with a zero-length packet when the payload is an exact
    /// multiple of `packet_size`.
    pub fn with_zlp(mut self, packet_size: Option<usize>) -> Self {
        self.zlp_packet_size = packet_size.filter(|&n| n > 0);
        self
    }

    fn needs_zlp(&self, total_bytes: usize) -> bool {
        match self.zlp_packet_size {
            Some(packet) => total_bytes > 0 && total_bytes % packet == 0,
            None => false,
        }
    }

    /// Send every chunk in order. Each chunk is retried on its own; a chunk
    /// that exhausts its attempts fails the whole transfer with the chunk
    /// index and address attached. A trailing ZLP is accounted as chunk
    /// `total` at the address just past the payload.
    #[instrument(level = "debug", skip_all, fields(chunks = chunks.total(), bytes = chunks.total_bytes()))]
    pub fn run<D, F>(
        &self,
        device: &mut D,
        chunks: Chunks<'_>,
        ledger: &mut RetryLedger,
        mut on_event: F,
    ) -> Result<TransferStats>
    where
        D: DeviceCapability + ?Sized,
        F: FnMut(TransferEvent),
    {
        let total = chunks.total();
        let total_bytes = chunks.total_bytes();
        let end = chunks.layout().start_address.unwrap_or(0) + total_bytes as u64;
        let mut stats = TransferStats::default();
        let timeout = self.timeout;
        let max_attempts = self.policy.attempts;

        for chunk in chunks {
            let (_, retries) = retry::run(
                &self.policy,
                device,
                |dev| dev.write_chunk(&chunk, timeout),
                |attempt, err| {
                    ledger.record_chunk(chunk.index);
                    on_event(TransferEvent::Retry {
                        index: chunk.index,
                        attempt,
                        max_attempts,
                        message: err.to_string(),
                    });
                },
            )
            .map_err(|e| e.in_chunk(chunk.index, chunk.address))?;

            stats.chunks += 1;
            stats.bytes += chunk.len();
            stats.retries += retries;
            debug!(
                index = chunk.index,
                address = %format!("0x{:08X}", chunk.address),
                len = chunk.len(),
                "Chunk written"
            );
            on_event(TransferEvent::ChunkWritten {
                index: chunk.index,
                address: chunk.address,
                length: chunk.len(),
                done: stats.chunks,
                total,
            });
        }

        if self.needs_zlp(total_bytes) {
            debug!("Payload is a multiple of the packet size, sending ZLP");
            let (_, retries) = retry::run(
                &self.policy,
                device,
                |dev| dev.write_zlp(timeout),
                |attempt, err| {
                    ledger.record_chunk(total);
                    on_event(TransferEvent::Retry {
                        index: total,
                        attempt,
                        max_attempts,
                        message: err.to_string(),
                    });
                },
            )
            .map_err(|e| e.in_chunk(total, end))?;
            stats.retries += retries;
            stats.zlp_sent = true;
        }

        info!(
            chunks = stats.chunks,
            bytes = stats.bytes,
            retries = stats.retries,
            "Transfer complete"
        );
        Ok(stats)
    }
}
