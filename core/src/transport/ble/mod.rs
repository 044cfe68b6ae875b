//! BLE transport
//!
//! Dual-role link management over pluggable radio adapters:
//!
//! - **gatt**: the mesh service/characteristic layout
//! - **radio**: central and peripheral adapter seams
//! - **scanner**: scan cycle state machine
//! - **coordinator**: links, retries and the `TransportChannel` impl
//! - **loopback**: in-process radio for tests and simulation
//! - **desktop**: btleplug central adapter (feature `btleplug`)

pub mod coordinator;
#[cfg(feature = "btleplug")]
pub mod desktop;
pub mod gatt;
pub mod loopback;
pub mod radio;
pub mod scanner;

pub use coordinator::BleCoordinator;
pub use gatt::{
    CharacteristicProperties, GattCharacteristic, GattService, DATA_CHARACTERISTIC_UUID,
};
pub use loopback::{LoopbackAir, LoopbackCentral, LoopbackPeripheral, LOOPBACK_RSSI};
pub use radio::{CentralRadio, PeripheralRadio, RadioEvent, RadioEventReceiver, RadioEventSender};
pub use scanner::{BleScanner, ScanSchedule, ScannerError, ScannerState};
