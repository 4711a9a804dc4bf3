//! Bounded retry with driver-specific error classification.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{DeviceCapability, ErrorClass};
use crate::error::{Error, Result};
use crate::events::UpdatePhase;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay doubles after every failed attempt.
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; always at least 1.
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
            backoff,
        }
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Backoff::Fixed)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1 << shift).min(MAX_BACKOFF)
            }
        }
    }
}

/// Retries consumed during a session, by phase and by chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryLedger {
    phases: BTreeMap<UpdatePhase, u32>,
    chunks: BTreeMap<usize, u32>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_phase(&mut self, phase: UpdatePhase) {
        *self.phases.entry(phase).or_default() += 1;
    }

    pub fn record_chunk(&mut self, index: usize) {
        *self.chunks.entry(index).or_default() += 1;
    }

    pub fn for_phase(&self, phase: UpdatePhase) -> u32 {
        self.phases.get(&phase).copied().unwrap_or(0)
    }

    pub fn for_chunk(&self, index: usize) -> u32 {
        self.chunks.get(&index).copied().unwrap_or(0)
    }

    /// Chunks that needed at least one retry, with their counts.
    pub fn chunks(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.chunks.iter().map(|(&i, &n)| (i, n))
    }

    pub fn total(&self) -> u32 {
        self.phases.values().sum::<u32>() + self.chunks.values().sum::<u32>()
    }
}

/// Run `op` against `device` until it succeeds, fails permanently, or the
/// policy runs out of attempts.
///
/// Errors are classified by the device. `on_retry` is called with the
/// failed attempt number before the device's `recover` hook and the delay.
/// Returns the value together with the number of retries consumed.
pub fn run<D, T, F, R>(
    policy: &RetryPolicy,
    device: &mut D,
    mut op: F,
    mut on_retry: R,
) -> Result<(T, u32)>
where
    D: DeviceCapability + ?Sized,
    F: FnMut(&mut D) -> Result<T>,
    R: FnMut(u32, &Error),
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op(device) {
            Ok(value) => return Ok((value, attempt - 1)),
            Err(e) => e,
        };

        if device.classify_error(&err) == ErrorClass::Permanent {
            return Err(err);
        }
        if attempt >= attempts {
            return Err(Error::RetriesExhausted {
                attempts,
                source: Box::new(err),
            });
        }

        debug!("failed on try {} of {}: {}", attempt, attempts, err);
        on_retry(attempt, &err);
        device.recover(&err)?;

        let delay = policy.delay_after(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        attempt += 1;
    }
}
