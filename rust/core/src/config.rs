//! Transport configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::descriptor::Addressing;
use crate::{Result, TransportError, DEFAULT_SLOT_COUNT};

/// Longest name prefix that keeps derived semaphore names within 31 bytes
pub const MAX_PREFIX_LEN: usize = 12;

/// Transport configuration shared by producer and consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Slots per ring buffer
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,

    /// How consumers locate payloads
    #[serde(default = "default_addressing")]
    pub addressing: Addressing,

    /// Upper bound on any single semaphore wait, in milliseconds.
    /// Zero waits as long as the peer is alive.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Interval between liveness checks while waiting, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long the producer waits at shutdown for the consumer to release
    /// in-flight slots, in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Accumulation buffer size of the frame packer, in frames
    #[serde(default = "default_packer_capacity_frames")]
    pub packer_capacity_frames: u32,

    /// Prefix for segment and semaphore names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_slot_count() -> u32 {
    DEFAULT_SLOT_COUNT
}

fn default_addressing() -> Addressing {
    Addressing::Offset
}

fn default_wait_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_drain_timeout_ms() -> u64 {
    1_000
}

fn default_packer_capacity_frames() -> u32 {
    4
}

fn default_name_prefix() -> String {
    "sf".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            slot_count: default_slot_count(),
            addressing: default_addressing(),
            wait_timeout_ms: default_wait_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            packer_capacity_frames: default_packer_capacity_frames(),
            name_prefix: default_name_prefix(),
        }
    }
}

impl TransportConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        info!("Loaded transport configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(TransportError::Configuration("slot_count must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(TransportError::Configuration(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.packer_capacity_frames < 2 {
            return Err(TransportError::Configuration(
                "packer_capacity_frames must be at least 2".to_string(),
            ));
        }
        if self.name_prefix.is_empty()
            || self.name_prefix.len() > MAX_PREFIX_LEN
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TransportError::Configuration(format!(
                "name_prefix {:?} must be 1..={} ASCII alphanumerics, '-' or '_'",
                self.name_prefix, MAX_PREFIX_LEN
            )));
        }
        Ok(())
    }

    /// Overall deadline for one wait, `None` when unbounded
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_ms > 0).then(|| Duration::from_millis(self.wait_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
