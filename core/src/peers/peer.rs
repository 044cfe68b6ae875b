//! Peer records as exposed to the engine and host

use crate::protocol::PeerKey;
use crate::transport::LinkAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Lifecycle of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Seen in a scan, no link yet
    Discovered,
    /// Link is up, identity handshake (ANNOUNCE) still pending
    Connecting,
    /// Identified and reachable
    Connected,
    /// Identified but no link remains
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "discovered"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Where a peer can currently be reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddresses {
    /// Platform BLE device id
    pub ble_device_id: Option<String>,
    /// Address on a non-BLE transport
    pub alt_address: Option<LinkAddress>,
}

impl PeerAddresses {
    pub fn is_empty(&self) -> bool {
        self.ble_device_id.is_none() && self.alt_address.is_none()
    }

    /// Preferred address: BLE first, then the alternate transport
    pub fn primary(&self) -> Option<LinkAddress> {
        self.ble_device_id
            .as_ref()
            .map(LinkAddress::ble)
            .or_else(|| self.alt_address.clone())
    }
}

/// Snapshot of an identified peer
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub public_key: PeerKey,
    pub nickname: String,
    pub connection_state: ConnectionState,
    pub addresses: PeerAddresses,
    /// Last scan RSSI; informational only
    pub rssi: Option<i16>,
    pub protocol_version: u8,
    pub last_seen: Instant,
    /// Persistent peers survive stale sweeps (demoted instead of removed)
    pub persistent: bool,
}

impl Peer {
    /// Peer id: hex of the public key
    pub fn id(&self) -> String {
        self.public_key.to_hex()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Display name, falling back to the short key
    pub fn display_name(&self) -> String {
        if self.nickname.is_empty() {
            self.public_key.short()
        } else {
            self.nickname.clone()
        }
    }
}

/// Result of applying an ANNOUNCE to the directory
#[derive(Debug, Clone, PartialEq)]
pub enum AnnounceOutcome {
    /// First time this public key is seen
    New(Peer),
    /// Known key, previously not connected
    Reconnected(Peer),
    /// Connected key whose nickname, version or address changed
    Updated(Peer),
    /// Periodic re-announce with nothing new
    Refreshed(Peer),
}

impl AnnounceOutcome {
    pub fn peer(&self) -> &Peer {
        match self {
            AnnounceOutcome::New(peer)
            | AnnounceOutcome::Reconnected(peer)
            | AnnounceOutcome::Updated(peer)
            | AnnounceOutcome::Refreshed(peer) => peer,
        }
    }
}

/// A peer affected by `sweep_stale`
#[derive(Debug, Clone, PartialEq)]
pub struct SweptPeer {
    pub peer: Peer,
    /// Record deleted (false: persistent peer demoted to Disconnected)
    pub removed: bool,
    /// Peer was Connected before the sweep
    pub was_connected: bool,
}
