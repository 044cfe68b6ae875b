//! In-process simulated BLE air
//!
//! Every node that joins gets a Central and a Peripheral adapter plus the
//! radio event stream a real platform adapter would produce. Links are
//! instantaneous and lossless. Tests and the CLI simulator use it to run
//! several engines in one process; it can also inject devices that are not
//! mesh peers, devices that never answer a connect, and link teardown.

use super::gatt::{GattCharacteristic, GattService};
use super::radio::{
    CentralRadio, PeripheralRadio, RadioEvent, RadioEventReceiver, RadioEventSender,
};
use crate::transport::abstraction::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const RADIO_EVENT_CAPACITY: usize = 1024;

/// RSSI reported for every simulated scan result
pub const LOOPBACK_RSSI: i16 = -50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    /// Full mesh node driven by a coordinator
    Mesh,
    /// Advertises something else; connectable but not a peer
    Foreign(GattCharacteristic),
    /// Advertises but never completes a connect
    Unresponsive,
}

struct Node {
    kind: NodeKind,
    events: Option<RadioEventSender>,
    powered: bool,
    advertising: Option<GattService>,
    scanning: bool,
    /// Devices this node is connected to as central
    central_links: HashSet<String>,
    /// Centrals subscribed to this node's characteristic
    subscribers: HashSet<String>,
    connect_attempts: u32,
}

impl Node {
    fn new(kind: NodeKind, events: Option<RadioEventSender>) -> Self {
        Self {
            kind,
            events,
            powered: true,
            advertising: None,
            scanning: false,
            central_links: HashSet::new(),
            subscribers: HashSet::new(),
            connect_attempts: 0,
        }
    }

    fn is_visible(&self) -> bool {
        self.powered && (self.advertising.is_some() || self.kind != NodeKind::Mesh)
    }

    fn characteristic(&self) -> Option<GattCharacteristic> {
        match self.kind {
            NodeKind::Mesh => self.advertising.map(|service| service.characteristic),
            NodeKind::Foreign(characteristic) => Some(characteristic),
            NodeKind::Unresponsive => None,
        }
    }

    fn deliver(&self, event: RadioEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                debug!("Loopback radio event dropped: {}", e);
            }
        }
    }
}

#[derive(Default)]
struct Air {
    nodes: HashMap<String, Node>,
}

impl Air {
    fn node(&self, name: &str) -> Result<&Node, TransportError> {
        self.nodes
            .get(name)
            .ok_or_else(|| TransportError::Radio(format!("unknown device {name}")))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node, TransportError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| TransportError::Radio(format!("unknown device {name}")))
    }

    fn announce_to_scanners(&self, advertiser: &str) {
        for (name, node) in &self.nodes {
            if name != advertiser && node.powered && node.scanning {
                node.deliver(RadioEvent::DeviceDiscovered {
                    device: advertiser.to_string(),
                    rssi: Some(LOOPBACK_RSSI),
                });
            }
        }
    }

    /// Tear down `central`'s link to `peripheral`, telling both ends
    fn drop_central_link(&mut self, central: &str, peripheral: &str) {
        let had_link = self
            .nodes
            .get_mut(central)
            .map(|node| node.central_links.remove(peripheral))
            .unwrap_or(false);
        let was_subscribed = self
            .nodes
            .get_mut(peripheral)
            .map(|node| node.subscribers.remove(central))
            .unwrap_or(false);

        if had_link {
            if let Some(node) = self.nodes.get(central) {
                node.deliver(RadioEvent::CentralDisconnected {
                    device: peripheral.to_string(),
                });
            }
        }
        if was_subscribed {
            if let Some(node) = self.nodes.get(peripheral) {
                node.deliver(RadioEvent::PeripheralDisconnected {
                    device: central.to_string(),
                });
            }
        }
    }

    fn links_of(&self, name: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(node) = self.nodes.get(name) {
            for peer in &node.central_links {
                pairs.push((name.to_string(), peer.clone()));
            }
        }
        for (other, node) in &self.nodes {
            if other != name && node.central_links.contains(name) {
                pairs.push((other.clone(), name.to_string()));
            }
        }
        pairs
    }
}

/// Shared simulated radio medium
#[derive(Clone, Default)]
pub struct LoopbackAir {
    air: Arc<Mutex<Air>>,
}

impl LoopbackAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mesh node named `name`; returns its role adapters and event stream
    pub fn join(&self, name: &str) -> (LoopbackCentral, LoopbackPeripheral, RadioEventReceiver) {
        let (tx, rx) = mpsc::channel(RADIO_EVENT_CAPACITY);
        self.air
            .lock()
            .nodes
            .insert(name.to_string(), Node::new(NodeKind::Mesh, Some(tx)));
        debug!("Loopback node {} joined", name);
        (
            LoopbackCentral {
                air: self.clone(),
                name: name.to_string(),
            },
            LoopbackPeripheral {
                air: self.clone(),
                name: name.to_string(),
            },
            rx,
        )
    }

    /// Add a connectable device that exposes `characteristic` instead of the mesh one
    pub fn add_foreign_device(&self, name: &str, characteristic: GattCharacteristic) {
        let mut air = self.air.lock();
        air.nodes
            .insert(name.to_string(), Node::new(NodeKind::Foreign(characteristic), None));
        air.announce_to_scanners(name);
    }

    /// Add a device whose connect attempts never complete
    pub fn add_unresponsive_device(&self, name: &str) {
        let mut air = self.air.lock();
        air.nodes
            .insert(name.to_string(), Node::new(NodeKind::Unresponsive, None));
        air.announce_to_scanners(name);
    }

    /// Tear down every link between `a` and `b`, in both roles
    pub fn sever(&self, a: &str, b: &str) {
        let mut air = self.air.lock();
        air.drop_central_link(a, b);
        air.drop_central_link(b, a);
    }

    /// Power a node off: all its links drop and it stops advertising
    pub fn power_off(&self, name: &str) {
        let mut air = self.air.lock();
        for (central, peripheral) in air.links_of(name) {
            air.drop_central_link(&central, &peripheral);
        }
        if let Some(node) = air.nodes.get_mut(name) {
            node.powered = false;
            node.scanning = false;
        }
    }

    /// Power a node back on; it resumes advertising what it advertised before
    pub fn power_on(&self, name: &str) {
        let mut air = self.air.lock();
        let visible = match air.nodes.get_mut(name) {
            Some(node) => {
                node.powered = true;
                node.is_visible()
            }
            None => false,
        };
        if visible {
            air.announce_to_scanners(name);
        }
    }

    /// Number of connect calls made towards `name`
    pub fn connection_attempts(&self, name: &str) -> u32 {
        self.air
            .lock()
            .nodes
            .get(name)
            .map(|node| node.connect_attempts)
            .unwrap_or(0)
    }

    /// Names of every node currently on the air
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.air.lock().nodes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Central role adapter for one loopback node
pub struct LoopbackCentral {
    air: LoopbackAir,
    name: String,
}

#[async_trait]
impl CentralRadio for LoopbackCentral {
    async fn start_scan(&self) -> Result<(), TransportError> {
        let mut air = self.air.air.lock();
        let me = air.node_mut(&self.name)?;
        if !me.powered {
            return Err(TransportError::Radio("powered off".to_string()));
        }
        me.scanning = true;

        let me = air.node(&self.name)?;
        for (name, node) in &air.nodes {
            if name != &self.name && node.is_visible() {
                me.deliver(RadioEvent::DeviceDiscovered {
                    device: name.clone(),
                    rssi: Some(LOOPBACK_RSSI),
                });
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.air.air.lock().node_mut(&self.name)?.scanning = false;
        Ok(())
    }

    async fn connect(&self, device: &str) -> Result<(), TransportError> {
        let unresponsive = {
            let mut air = self.air.air.lock();
            if !air.node(&self.name)?.powered {
                return Err(TransportError::Radio("powered off".to_string()));
            }
            let target = air
                .node_mut(device)
                .map_err(|_| TransportError::ConnectionFailed(device.to_string()))?;
            target.connect_attempts += 1;
            if !target.is_visible() {
                return Err(TransportError::ConnectionFailed(format!("{device} out of range")));
            }
            let unresponsive = target.kind == NodeKind::Unresponsive;
            if !unresponsive {
                air.node_mut(&self.name)?
                    .central_links
                    .insert(device.to_string());
            }
            unresponsive
        };

        if unresponsive {
            trace!("{} connecting to unresponsive {}", self.name, device);
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn discover_characteristic(
        &self,
        device: &str,
    ) -> Result<Option<GattCharacteristic>, TransportError> {
        let air = self.air.air.lock();
        if !air.node(&self.name)?.central_links.contains(device) {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        Ok(air.node(device)?.characteristic())
    }

    async fn subscribe(&self, device: &str) -> Result<(), TransportError> {
        let mut air = self.air.air.lock();
        if !air.node(&self.name)?.central_links.contains(device) {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        let target = air.node_mut(device)?;
        if target.subscribers.insert(self.name.clone()) {
            target.deliver(RadioEvent::PeripheralSubscribed {
                device: self.name.clone(),
            });
        }
        Ok(())
    }

    async fn write(&self, device: &str, data: &[u8]) -> Result<(), TransportError> {
        let air = self.air.air.lock();
        if !air.node(&self.name)?.central_links.contains(device) {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        let target = air.node(device)?;
        if !target.powered {
            return Err(TransportError::WriteFailed(format!("{device} powered off")));
        }
        target.deliver(RadioEvent::PeripheralWrite {
            device: self.name.clone(),
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let mut air = self.air.air.lock();
        let had_link = air.node_mut(&self.name)?.central_links.remove(device);
        if let Some(target) = air.nodes.get_mut(device) {
            if target.subscribers.remove(&self.name) {
                target.deliver(RadioEvent::PeripheralDisconnected {
                    device: self.name.clone(),
                });
            }
        }
        if !had_link {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        Ok(())
    }
}

/// Peripheral role adapter for one loopback node
pub struct LoopbackPeripheral {
    air: LoopbackAir,
    name: String,
}

#[async_trait]
impl PeripheralRadio for LoopbackPeripheral {
    async fn start_advertising(
        &self,
        service: &GattService,
        local_name: &str,
    ) -> Result<(), TransportError> {
        let mut air = self.air.air.lock();
        let me = air.node_mut(&self.name)?;
        me.advertising = Some(*service);
        let visible = me.is_visible();
        debug!("{} advertising {} as {:?}", self.name, service.service_uuid, local_name);
        if visible {
            air.announce_to_scanners(&self.name);
        }
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.air.air.lock().node_mut(&self.name)?.advertising = None;
        Ok(())
    }

    async fn notify(&self, device: &str, data: &[u8]) -> Result<(), TransportError> {
        let air = self.air.air.lock();
        if !air.node(&self.name)?.subscribers.contains(device) {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        air.node(device)?.deliver(RadioEvent::Notification {
            device: self.name.clone(),
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let mut air = self.air.air.lock();
        if !air.node(&self.name)?.subscribers.contains(device) {
            return Err(TransportError::NotConnected(device.to_string()));
        }
        air.drop_central_link(device, &self.name);
        Ok(())
    }
}
