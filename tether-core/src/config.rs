//! Engine configuration.
//!
//! Loaded from a JSON file; every field has a default so an empty object is
//! a valid configuration.

use crate::arch::TargetArch;
use crate::error::{Error, Result};
use crate::memory::DEFAULT_CHUNK_SIZE;
use crate::wire::MAX_TRANSFER;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Widest rendering of one number in a reply payload: `, 0xff`.
const REPLY_BYTES_PER_ITEM: usize = 6;
/// Room for the status keyword, a state token and a hint clause.
const REPLY_OVERHEAD: usize = 128;
/// Widest register reply: 32 registers rendered as `, 0xffffffffffffffff`.
const REGISTER_REPLY_BYTES: usize = 32 * 20;

/// Engine settings: where the controller is, how to talk to it and what
/// kind of core sits behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address of the target core controller.
    pub controller: String,
    /// Longest wait for reply data, in milliseconds.
    pub read_timeout_ms: u64,
    /// Bytes per memory transfer request.
    pub chunk_size: usize,
    /// Receive buffer size; one reply record must fit.
    pub buffer_capacity: usize,
    /// Architecture family of the target core.
    pub arch: TargetArch,
    /// Target memory the x86 step-over strategy may overwrite.
    pub scratch_address: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller: "127.0.0.1:5555".to_string(),
            read_timeout_ms: 10_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_capacity: 4096,
            arch: TargetArch::X86,
            scratch_address: 0xf000,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Smallest receive buffer that holds every reply this configuration
    /// can provoke.
    pub fn min_buffer_capacity(&self) -> usize {
        (self.chunk_size * REPLY_BYTES_PER_ITEM).max(REGISTER_REPLY_BYTES) + REPLY_OVERHEAD
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_TRANSFER {
            return Err(Error::Config(format!("chunk_size must be between 1 and {MAX_TRANSFER:#x}")));
        }
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be non-zero".into()));
        }
        let needed = self.min_buffer_capacity();
        if self.buffer_capacity < needed {
            return Err(Error::Config(format!(
                "buffer_capacity {} cannot hold a {}-byte chunk reply (need {needed})",
                self.buffer_capacity, self.chunk_size
            )));
        }
        Ok(())
    }

    /// The subset handed to a [`Session`](crate::Session).
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            address: self.controller.clone(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            chunk_size: self.chunk_size,
            buffer_capacity: self.buffer_capacity,
        }
    }
}

/// The part of the configuration a [`Session`](crate::Session) needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Controller address, `host:port`.
    pub address: String,
    /// Longest wait for reply data.
    pub read_timeout: Duration,
    /// Bytes per memory transfer request.
    pub chunk_size: usize,
    /// Receive buffer size.
    pub buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        EngineConfig::default().session_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "arch": "arm7", "chunk_size": 128 }"#).unwrap();
        assert_eq!(config.arch, TargetArch::Arm7);
        assert_eq!(config.chunk_size, 128);
        assert_eq!(config.session_config().read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_rejects_small_buffer() {
        let config = EngineConfig { chunk_size: 1024, ..EngineConfig::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = EngineConfig { chunk_size: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
        let config = EngineConfig {
            chunk_size: MAX_TRANSFER + 1,
            buffer_capacity: usize::MAX / 2,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_reports_path() {
        let err = EngineConfig::load("/nonexistent/tether.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tether.json"));
    }
}
