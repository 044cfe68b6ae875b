//! GATT service definition for BLE messaging
//!
//! Every device exposes one primary service whose UUID is derived from its
//! public key, containing a single data characteristic. Centrals write
//! packets into the characteristic; peripherals push packets back as
//! notifications on the same characteristic.

use crate::identity::ble_service_uuid;
use crate::protocol::PeerKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Data characteristic UUID (0xFF01, Bluetooth base UUID)
pub const DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_FF01_0000_1000_8000_0080_5F9B_34FB);

/// GATT characteristic property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Properties of the mesh data characteristic
    pub const DATA: Self = Self {
        read: true,
        write: true,
        write_without_response: true,
        notify: true,
    };

    /// Whether a central can push packets through this characteristic
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A characteristic as advertised or discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl GattCharacteristic {
    /// The mesh data characteristic
    pub const fn data() -> Self {
        Self {
            uuid: DATA_CHARACTERISTIC_UUID,
            properties: CharacteristicProperties::DATA,
        }
    }

    /// True if this is a usable mesh data characteristic
    pub fn is_mesh_data(&self) -> bool {
        self.uuid == DATA_CHARACTERISTIC_UUID
            && self.properties.is_writable()
            && self.properties.notify
    }
}

/// The service a device hosts in the peripheral role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub service_uuid: Uuid,
    pub characteristic: GattCharacteristic,
}

impl GattService {
    /// Service for the device owning `public_key`
    pub fn for_identity(public_key: &PeerKey) -> Self {
        Self {
            service_uuid: ble_service_uuid(public_key),
            characteristic: GattCharacteristic::data(),
        }
    }
}
