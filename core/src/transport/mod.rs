// Transport module - link layer beneath the protocol engine

pub mod abstraction;
pub mod ble;
pub mod manager;

pub use abstraction::{
    LinkAddress, LocalAdvertisement, TransportChannel, TransportError, TransportEvent,
    TransportEventSender, TransportType, EVENT_CHANNEL_CAPACITY,
};
pub use manager::TransportManager;
