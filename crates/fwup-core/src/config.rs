//! Engine configuration and the explicit process-wide context.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::device::DeviceKind;
use crate::error::Result;
use crate::retry::{Backoff, RetryPolicy};

/// Time to wait for a device that resets itself and re-enumerates.
pub const REMOVE_DELAY_RE_ENUMERATE_MS: u64 = 10_000;
/// Time to wait for a user to physically replug a device.
pub const REMOVE_DELAY_USER_REPLUG_MS: u64 = 40_000;

/// Per-device-kind overrides.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quirk {
    /// Replaces the driver-declared replug timeout.
    pub remove_delay_ms: Option<u64>,
    /// Caps the driver-declared chunk size.
    pub max_chunk_size: Option<usize>,
}

/// Configuration for the update engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per chunk, including the first.
    pub chunk_retry_attempts: u32,
    /// Attempts per retriable phase (detach, attach, reload).
    pub phase_retry_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    /// Timeout for a single chunk send or receive.
    pub chunk_timeout_ms: u64,
    /// Replug timeout for drivers that do not declare one.
    pub default_remove_delay_ms: u64,
    /// Overrides keyed by device kind name (`usb`, `i2c`, ...).
    pub quirks: BTreeMap<String, Quirk>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_retry_attempts: 3,
            phase_retry_attempts: 3,
            retry_delay_ms: 50,
            backoff: Backoff::Fixed,
            chunk_timeout_ms: 1500,
            default_remove_delay_ms: REMOVE_DELAY_RE_ENUMERATE_MS,
            quirks: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Shared context handed by reference to backends and sessions.
#[derive(Debug, Clone, Default)]
pub struct Context {
    config: EngineConfig,
}

impl Context {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn quirk(&self, kind: DeviceKind) -> Option<&Quirk> {
        self.config.quirks.get(kind.as_str())
    }

    pub fn chunk_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.chunk_retry_attempts,
            Duration::from_millis(self.config.retry_delay_ms),
            self.config.backoff,
        )
    }

    pub fn phase_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.phase_retry_attempts,
            Duration::from_millis(self.config.retry_delay_ms),
            self.config.backoff,
        )
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.config.chunk_timeout_ms)
    }

    /// Replug timeout: quirk, then driver declaration, then the default.
    pub fn remove_delay_for(&self, kind: DeviceKind, declared: Duration) -> Duration {
        if let Some(ms) = self.quirk(kind).and_then(|q| q.remove_delay_ms) {
            return Duration::from_millis(ms);
        }
        if !declared.is_zero() {
            return declared;
        }
        warn!(
            kind = %kind,
            "driver did not specify a remove delay, guessing {}ms",
            self.config.default_remove_delay_ms
        );
        Duration::from_millis(self.config.default_remove_delay_ms)
    }

    /// Chunk size capped by any quirk for this kind.
    pub fn max_chunk_size_for(&self, kind: DeviceKind, declared: usize) -> usize {
        match self.quirk(kind).and_then(|q| q.max_chunk_size) {
            Some(cap) if cap > 0 => declared.min(cap),
            _ => declared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fwup.toml");

        let mut config = EngineConfig::default();
        config.backoff = Backoff::Exponential;
        config.quirks.insert(
            "i2c".into(),
            Quirk {
                remove_delay_ms: Some(2000),
                max_chunk_size: Some(32),
            },
        );
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("chunk_retry_attempts = 7\n").unwrap();
        assert_eq!(config.chunk_retry_attempts, 7);
        assert_eq!(config.phase_retry_attempts, 3);
        assert_eq!(config.default_remove_delay_ms, REMOVE_DELAY_RE_ENUMERATE_MS);
    }

    #[test]
    fn test_remove_delay_resolution() {
        let mut config = EngineConfig::default();
        config.quirks.insert(
            "hid".into(),
            Quirk {
                remove_delay_ms: Some(REMOVE_DELAY_USER_REPLUG_MS),
                ..Default::default()
            },
        );
        let ctx = Context::new(config);

        let declared = Duration::from_secs(3);
        assert_eq!(
            ctx.remove_delay_for(DeviceKind::Hid, declared),
            Duration::from_millis(REMOVE_DELAY_USER_REPLUG_MS)
        );
        assert_eq!(ctx.remove_delay_for(DeviceKind::Usb, declared), declared);
        assert_eq!(
            ctx.remove_delay_for(DeviceKind::Usb, Duration::ZERO),
            Duration::from_millis(REMOVE_DELAY_RE_ENUMERATE_MS)
        );
    }

    #[test]
    fn test_chunk_size_quirk_caps() {
        let mut config = EngineConfig::default();
        config.quirks.insert(
            "i2c".into(),
            Quirk {
                max_chunk_size: Some(32),
                ..Default::default()
            },
        );
        let ctx = Context::new(config);
        assert_eq!(ctx.max_chunk_size_for(DeviceKind::I2c, 256), 32);
        assert_eq!(ctx.max_chunk_size_for(DeviceKind::I2c, 16), 16);
        assert_eq!(ctx.max_chunk_size_for(DeviceKind::Usb, 256), 256);
    }
}
