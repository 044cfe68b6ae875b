//! Hardware seams for the two BLE roles
//!
//! Platform adapters (CoreBluetooth, Android, BlueZ via btleplug, the
//! in-process loopback air) implement these traits. The coordinator never
//! touches a platform API directly.

use super::gatt::{GattCharacteristic, GattService};
use crate::transport::abstraction::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Events a platform adapter reports, across both roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Scan result
    DeviceDiscovered { device: String, rssi: Option<i16> },
    /// A link we opened as central dropped
    CentralDisconnected { device: String },
    /// A peripheral we subscribed to notified us
    Notification { device: String, data: Vec<u8> },
    /// A remote central subscribed to our data characteristic
    PeripheralSubscribed { device: String },
    /// A remote central went away
    PeripheralDisconnected { device: String },
    /// A remote central wrote to our data characteristic
    PeripheralWrite { device: String, data: Vec<u8> },
}

pub type RadioEventSender = mpsc::Sender<RadioEvent>;
pub type RadioEventReceiver = mpsc::Receiver<RadioEvent>;

/// Scanner / connector role
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Scan for every advertising device
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, device: &str) -> Result<(), TransportError>;

    /// Discover services on a connected device and return its characteristic
    /// carrying the data UUID, if it has one
    async fn discover_characteristic(
        &self,
        device: &str,
    ) -> Result<Option<GattCharacteristic>, TransportError>;

    /// Enable notifications on the data characteristic
    async fn subscribe(&self, device: &str) -> Result<(), TransportError>;

    /// Write one frame to the data characteristic
    async fn write(&self, device: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &str) -> Result<(), TransportError>;
}

/// Advertiser / acceptor role
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Host `service` and advertise it
    async fn start_advertising(
        &self,
        service: &GattService,
        local_name: &str,
    ) -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Notify one subscribed central
    async fn notify(&self, device: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Drop a remote central
    async fn disconnect(&self, device: &str) -> Result<(), TransportError>;
}
