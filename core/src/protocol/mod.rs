//! Wire protocol - fixed-layout signed packets for the BLE mesh
//!
//! This module provides:
//! - Packet: 152-byte fixed header + payload, big-endian, Ed25519-signed
//! - Announce: TLV identity payload carried by the handshake packet
//! - Fragmentation: splitting oversized payloads and reassembling them
//! - Receipts: ACK / NACK payloads
//!
//! Format progression:
//! 1. Application bytes (≤ 500) become a single `Message` packet
//! 2. Larger payloads are cut into `FragmentStart/Continue/End` packets
//! 3. Every packet is signed over its signable bytes before hitting the radio

pub mod announce;
pub mod fragment;
pub mod packet;
pub mod receipt;

pub use announce::AnnouncePayload;
pub use fragment::{
    ExpiredFragmentSession, FragmentAssembler, FragmentHeader, FRAGMENT_CHUNK_SIZE,
    FRAGMENT_THRESHOLD,
};
pub use packet::{Packet, PacketType, HEADER_SIZE, MAX_TTL};
pub use receipt::{AckPayload, NackPayload, NackReason};

use std::fmt;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed, undersized or inconsistent inbound bytes
    #[error("Format error: {0}")]
    Format(String),

    /// Invalid key, ttl or size supplied at construction time
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Operation not permitted in the current state (e.g. ttl already 0)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Current protocol version carried in ANNOUNCE payloads
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of an Ed25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// A peer's Ed25519 public key, the canonical peer identity on the wire.
///
/// The all-zero key is reserved as the broadcast recipient.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerKey(pub [u8; PUBLIC_KEY_LEN]);

impl PeerKey {
    /// Recipient value meaning "every connected peer"
    pub const BROADCAST: PeerKey = PeerKey([0u8; PUBLIC_KEY_LEN]);

    /// Build a key from a slice, rejecting anything that is not 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::Argument(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ProtocolError::Argument(format!("invalid hex public key: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// Peer id: lowercase hex of the public key
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_LEN]
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.short())
    }
}

impl From<[u8; PUBLIC_KEY_LEN]> for PeerKey {
    fn from(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

/// Seconds since the Unix epoch, truncated to the 4-byte wire field
pub fn unix_timestamp() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
