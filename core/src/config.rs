//! Engine and radio configuration
//!
//! Everything tunable about the protocol engine and the BLE coordinator.
//! Defaults match the wire protocol; hosts usually only change the nickname
//! and the BLE timings.

use crate::dedup::{DEFAULT_CAPACITY, DEFAULT_FALSE_POSITIVE_RATE};
use crate::protocol::packet::MAX_PAYLOAD_LEN;
use crate::protocol::{
    FragmentHeader, FRAGMENT_CHUNK_SIZE, FRAGMENT_THRESHOLD, MAX_TTL, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid message TTL: must be 0-{max}, got {0}", max = MAX_TTL)]
    InvalidTtl(u8),

    #[error("Invalid fragmentation: chunk size {chunk} must be 1..={threshold}")]
    InvalidFragmentation { chunk: usize, threshold: usize },

    #[error("Invalid fragmentation: {field} yields {size}-byte packet payloads (max {max})", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge { field: &'static str, size: usize },

    #[error("Invalid bloom filter: {0}")]
    InvalidBloom(String),

    #[error("Invalid interval: {0} must be > 0")]
    ZeroInterval(&'static str),

    #[error("Invalid stale multiplier: must be >= 1, got {0}")]
    InvalidStaleMultiplier(u32),

    #[error("Invalid max concurrent connects: must be >= 1")]
    InvalidConcurrency,

    #[error("Nickname too long: {0} bytes (max 255)")]
    NicknameTooLong(usize),
}

// ============================================================================
// BLE CONFIG
// ============================================================================

/// BLE coordinator timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Bound on connect + service discovery + subscribe (milliseconds)
    pub connect_timeout_ms: u64,
    /// Length of one scan cycle (milliseconds)
    pub scan_timeout_ms: u64,
    /// Pause between scan cycles (milliseconds)
    pub rescan_interval_ms: u64,
    /// Simultaneous outbound connect attempts; the radio is shared
    pub max_concurrent_connects: usize,
}

impl BleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    /// Validate BLE timings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("connect_timeout_ms"));
        }
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("scan_timeout_ms"));
        }
        if self.max_concurrent_connects == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            scan_timeout_ms: 10_000,
            rescan_interval_ms: 5_000,
            max_concurrent_connects: 1,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Protocol engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display name carried in ANNOUNCE
    pub nickname: String,
    /// Version carried in ANNOUNCE
    pub protocol_version: u8,
    /// Periodic ANNOUNCE broadcast interval (milliseconds)
    pub announce_interval_ms: u64,
    /// Peers silent for `announce_interval * stale_multiplier` are swept
    pub stale_multiplier: u32,
    /// Payloads above this many bytes are fragmented
    pub fragment_threshold: usize,
    /// Fragment chunk size in bytes (excluding the fragment header)
    pub fragment_chunk_size: usize,
    /// Pause between consecutive fragments (milliseconds)
    pub fragment_delay_ms: u64,
    /// Idle time before an incomplete reassembly is dropped (milliseconds)
    pub reassembly_timeout_ms: u64,
    /// TTL stamped on outbound messages
    pub message_ttl: u8,
    /// Dedup filter capacity before rotation
    pub bloom_capacity: usize,
    /// Dedup filter design false-positive rate
    pub bloom_false_positive_rate: f64,
    /// Dedup filter rotation interval (seconds)
    pub bloom_rotation_secs: u64,
    /// Acknowledge received messages and report delivery to the sender
    pub delivery_acks: bool,
    /// Radio settings
    pub ble: BleConfig,
}

impl EngineConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// Silence after which a peer is swept
    pub fn stale_threshold(&self) -> Duration {
        self.announce_interval() * self.stale_multiplier
    }

    pub fn fragment_delay(&self) -> Duration {
        Duration::from_millis(self.fragment_delay_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn bloom_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.bloom_rotation_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_ttl > MAX_TTL {
            return Err(ConfigError::InvalidTtl(self.message_ttl));
        }

        if self.fragment_chunk_size == 0 || self.fragment_chunk_size > self.fragment_threshold {
            return Err(ConfigError::InvalidFragmentation {
                chunk: self.fragment_chunk_size,
                threshold: self.fragment_threshold,
            });
        }
        if self.fragment_threshold > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLarge {
                field: "fragment_threshold",
                size: self.fragment_threshold,
            });
        }
        let fragment_payload = self.fragment_chunk_size + FragmentHeader::HEADER_SIZE;
        if fragment_payload > MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLarge {
                field: "fragment_chunk_size",
                size: fragment_payload,
            });
        }

        if self.bloom_capacity == 0 {
            return Err(ConfigError::InvalidBloom("capacity must be > 0".to_string()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(ConfigError::InvalidBloom(format!(
                "false positive rate must be in (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }

        if self.announce_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("announce_interval_ms"));
        }
        if self.reassembly_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("reassembly_timeout_ms"));
        }
        if self.bloom_rotation_secs == 0 {
            return Err(ConfigError::ZeroInterval("bloom_rotation_secs"));
        }
        if self.stale_multiplier == 0 {
            return Err(ConfigError::InvalidStaleMultiplier(self.stale_multiplier));
        }

        if self.nickname.len() > 255 {
            return Err(ConfigError::NicknameTooLong(self.nickname.len()));
        }

        self.ble.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nickname: String::new(),
            protocol_version: PROTOCOL_VERSION,
            announce_interval_ms: 10_000,
            stale_multiplier: 2,
            fragment_threshold: FRAGMENT_THRESHOLD,
            fragment_chunk_size: FRAGMENT_CHUNK_SIZE,
            fragment_delay_ms: 20,
            reassembly_timeout_ms: 30_000,
            message_ttl: MAX_TTL,
            bloom_capacity: DEFAULT_CAPACITY,
            bloom_false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            bloom_rotation_secs: 300,
            delivery_acks: false,
            ble: BleConfig::default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
