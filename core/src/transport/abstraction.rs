//! Transport abstraction layer for Meshwire
//!
//! Defines the channel trait every link layer implements and the typed
//! events a channel reports back to the protocol engine.

use crate::protocol::PeerKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the transport → engine event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Sending half handed to a channel on `start`
pub type TransportEventSender = mpsc::Sender<TransportEvent>;

/// Represents different transport types available to the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportType {
    /// Bluetooth Low Energy
    BLE,
    /// Host-supplied network transport (Wi-Fi, internet relay, ...)
    Internet,
    /// Local transport for testing
    Local,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::BLE => write!(f, "BLE"),
            TransportType::Internet => write!(f, "Internet"),
            TransportType::Local => write!(f, "Local"),
        }
    }
}

/// Link-level address of a remote device, known before its identity is
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkAddress {
    pub transport: TransportType,
    /// Platform device id (BLE) or host-defined address string
    pub id: String,
}

impl LinkAddress {
    pub fn new(transport: TransportType, id: impl Into<String>) -> Self {
        Self {
            transport,
            id: id.into(),
        }
    }

    pub fn ble(id: impl Into<String>) -> Self {
        Self::new(TransportType::BLE, id)
    }

    pub fn is_ble(&self) -> bool {
        self.transport == TransportType::BLE
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.id)
    }
}

/// What a channel advertises about the local device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAdvertisement {
    pub public_key: PeerKey,
    pub service_uuid: Uuid,
    pub nickname: String,
}

/// Events from a transport channel to the protocol engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device was seen (scan result); identity unknown
    Discovered {
        address: LinkAddress,
        rssi: Option<i16>,
    },
    /// A link to the device is ready for data
    Connected { address: LinkAddress },
    /// The last link to the device is gone
    Disconnected { address: LinkAddress },
    /// Raw bytes arrived from the device
    DataReceived { address: LinkAddress, data: Vec<u8> },
    /// Transport encountered an error
    Error {
        transport: TransportType,
        error: String,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Discovered { address, rssi } => {
                write!(f, "Discovered {{ address: {}, rssi: {:?} }}", address, rssi)
            }
            TransportEvent::Connected { address } => {
                write!(f, "Connected {{ address: {} }}", address)
            }
            TransportEvent::Disconnected { address } => {
                write!(f, "Disconnected {{ address: {} }}", address)
            }
            TransportEvent::DataReceived { address, data } => write!(
                f,
                "DataReceived {{ address: {}, data_len: {} }}",
                address,
                data.len()
            ),
            TransportEvent::Error { transport, error } => {
                write!(f, "Error {{ transport: {}, error: {} }}", transport, error)
            }
        }
    }
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect timed out: {0}")]
    ConnectTimeout(String),

    #[error("GATT mismatch: {0}")]
    GattMismatch(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Radio error: {0}")]
    Radio(String),

    #[error("Transport not available: {0}")]
    TransportNotAvailable(String),
}

/// A link layer able to move opaque byte frames between devices.
///
/// Channels report everything they observe through the event sender handed
/// to `start`. Before an ANNOUNCE has identified a device, the engine can
/// only reach it by `LinkAddress`; afterwards `associate` lets the channel
/// route by public key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Begin discovery/advertising and start reporting events
    async fn start(
        &self,
        advertisement: &LocalAdvertisement,
        events: TransportEventSender,
    ) -> Result<(), TransportError>;

    /// Stop discovery/advertising and drop all links
    async fn stop(&self);

    /// Send a frame to an identified peer
    async fn send(&self, peer: &PeerKey, data: &[u8]) -> Result<(), TransportError>;

    /// Send a frame to a device whose identity may not be known yet
    async fn send_to_address(
        &self,
        address: &LinkAddress,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Send a frame on every live link; returns the number of links written
    async fn broadcast(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// True if `send` to this peer could currently succeed
    fn is_reachable(&self, peer: &PeerKey) -> bool;

    /// Bind a link address to the identity it announced
    fn associate(&self, address: &LinkAddress, peer: PeerKey);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_type_display() {
        assert_eq!(TransportType::BLE.to_string(), "BLE");
        assert_eq!(TransportType::Internet.to_string(), "Internet");
        assert_eq!(TransportType::Local.to_string(), "Local");
    }

    #[test]
    fn test_link_address_display_and_kind() {
        let addr = LinkAddress::ble("AA:BB");
        assert_eq!(addr.to_string(), "BLE:AA:BB");
        assert!(addr.is_ble());
        assert!(!LinkAddress::new(TransportType::Internet, "10.0.0.1:9").is_ble());
    }

    #[test]
    fn test_link_addresses_sort_by_transport_then_id() {
        let mut addrs = vec![
            LinkAddress::new(TransportType::Local, "a"),
            LinkAddress::ble("z"),
            LinkAddress::new(TransportType::Internet, "b"),
            LinkAddress::ble("c"),
        ];
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                LinkAddress::ble("c"),
                LinkAddress::ble("z"),
                LinkAddress::new(TransportType::Internet, "b"),
                LinkAddress::new(TransportType::Local, "a"),
            ]
        );
        assert!(TransportType::BLE < TransportType::Local);
    }

    #[test]
    fn test_transport_event_display() {
        let event = TransportEvent::DataReceived {
            address: LinkAddress::ble("dev-1"),
            data: vec![1, 2, 3],
        };
        let display = event.to_string();
        assert!(display.contains("DataReceived"));
        assert!(display.contains("data_len: 3"));
    }

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::NotConnected("dev-1".to_string());
        assert!(error.to_string().contains("Not connected"));
    }

    #[test]
    fn test_link_address_serde() {
        let addr = LinkAddress::ble("dev-9");
        let json = serde_json::to_string(&addr).unwrap();
        let back: LinkAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
