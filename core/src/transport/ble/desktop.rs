//! Central role on desktop Bluetooth stacks via btleplug
//!
//! btleplug only implements the central role, so this adapter pairs with
//! `CentralOnlyPeripheral`: the node scans and connects out, but cannot be
//! connected to.

use super::gatt::{CharacteristicProperties, GattCharacteristic, GattService, DATA_CHARACTERISTIC_UUID};
use super::radio::{CentralRadio, PeripheralRadio, RadioEvent, RadioEventReceiver, RadioEventSender};
use crate::transport::abstraction::TransportError;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const RADIO_EVENT_CAPACITY: usize = 1024;

fn radio_err(e: btleplug::Error) -> TransportError {
    TransportError::Radio(e.to_string())
}

struct Known {
    peripheral: Peripheral,
    data_characteristic: Option<Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

/// btleplug-backed `CentralRadio`
pub struct BtleplugCentral {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Known>>>,
    events: RadioEventSender,
    pump: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Open the first Bluetooth adapter and start forwarding its events
    pub async fn first_adapter() -> Result<(Self, RadioEventReceiver), TransportError> {
        let manager = Manager::new().await.map_err(radio_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::TransportNotAvailable("no Bluetooth adapter".to_string()))?;

        let (tx, rx) = mpsc::channel(RADIO_EVENT_CAPACITY);
        let devices: Arc<Mutex<HashMap<String, Known>>> = Arc::new(Mutex::new(HashMap::new()));

        let mut stream = adapter.events().await.map_err(radio_err)?;
        let pump_adapter = adapter.clone();
        let pump_devices = Arc::clone(&devices);
        let pump_tx = tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) => {
                        let Ok(peripheral) = pump_adapter.peripheral(&id).await else {
                            continue;
                        };
                        let rssi = match peripheral.properties().await {
                            Ok(Some(props)) => props.rssi,
                            _ => None,
                        };
                        let device = id.to_string();
                        pump_devices.lock().entry(device.clone()).or_insert(Known {
                            peripheral,
                            data_characteristic: None,
                            notifications: None,
                        });
                        let _ = pump_tx.send(RadioEvent::DeviceDiscovered { device, rssi }).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let device = id.to_string();
                        if let Some(known) = pump_devices.lock().get_mut(&device) {
                            if let Some(task) = known.notifications.take() {
                                task.abort();
                            }
                        }
                        let _ = pump_tx.send(RadioEvent::CentralDisconnected { device }).await;
                    }
                    _ => {}
                }
            }
            debug!("btleplug event stream ended");
        });

        Ok((
            Self {
                adapter,
                devices,
                events: tx,
                pump,
            },
            rx,
        ))
    }

    fn peripheral(&self, device: &str) -> Result<Peripheral, TransportError> {
        self.devices
            .lock()
            .get(device)
            .map(|known| known.peripheral.clone())
            .ok_or_else(|| TransportError::NotConnected(device.to_string()))
    }

    fn data_characteristic(&self, device: &str) -> Result<(Peripheral, Characteristic), TransportError> {
        let devices = self.devices.lock();
        let known = devices
            .get(device)
            .ok_or_else(|| TransportError::NotConnected(device.to_string()))?;
        let characteristic = known
            .data_characteristic
            .clone()
            .ok_or_else(|| TransportError::GattMismatch(device.to_string()))?;
        Ok((known.peripheral.clone(), characteristic))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.pump.abort();
        for known in self.devices.lock().values_mut() {
            if let Some(task) = known.notifications.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl CentralRadio for BtleplugCentral {
    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(radio_err)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await.map_err(radio_err)
    }

    async fn connect(&self, device: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    async fn discover_characteristic(
        &self,
        device: &str,
    ) -> Result<Option<GattCharacteristic>, TransportError> {
        let peripheral = self.peripheral(device)?;
        peripheral.discover_services().await.map_err(radio_err)?;

        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == DATA_CHARACTERISTIC_UUID);
        let Some(characteristic) = found else {
            return Ok(None);
        };

        let flags = characteristic.properties;
        let discovered = GattCharacteristic {
            uuid: characteristic.uuid,
            properties: CharacteristicProperties {
                read: flags.contains(CharPropFlags::READ),
                write: flags.contains(CharPropFlags::WRITE),
                write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                notify: flags.contains(CharPropFlags::NOTIFY),
            },
        };
        if let Some(known) = self.devices.lock().get_mut(device) {
            known.data_characteristic = Some(characteristic);
        }
        Ok(Some(discovered))
    }

    async fn subscribe(&self, device: &str) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.data_characteristic(device)?;
        peripheral.subscribe(&characteristic).await.map_err(radio_err)?;

        let mut notifications = peripheral.notifications().await.map_err(radio_err)?;
        let events = self.events.clone();
        let name = device.to_string();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != DATA_CHARACTERISTIC_UUID {
                    continue;
                }
                let event = RadioEvent::Notification {
                    device: name.clone(),
                    data: notification.value,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
        if let Some(known) = self.devices.lock().get_mut(device) {
            if let Some(previous) = known.notifications.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn write(&self, device: &str, data: &[u8]) -> Result<(), TransportError> {
        let (peripheral, characteristic) = self.data_characteristic(device)?;
        let write_type = if characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        if let Some(known) = self.devices.lock().get_mut(device) {
            if let Some(task) = known.notifications.take() {
                task.abort();
            }
        }
        peripheral.disconnect().await.map_err(radio_err)
    }
}

/// Peripheral role stand-in for stacks without GATT server support
#[derive(Debug, Default, Clone, Copy)]
pub struct CentralOnlyPeripheral;

#[async_trait]
impl PeripheralRadio for CentralOnlyPeripheral {
    async fn start_advertising(
        &self,
        service: &GattService,
        _local_name: &str,
    ) -> Result<(), TransportError> {
        warn!(
            "Peripheral role unavailable; not advertising {}",
            service.service_uuid
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn notify(&self, device: &str, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotConnected(device.to_string()))
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        Err(TransportError::NotConnected(device.to_string()))
    }
}
