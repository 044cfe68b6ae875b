//! BLE coordinator: runs the Central and Peripheral roles side by side
//!
//! Central: scans in bounded cycles, connects to every newly discovered
//! device, checks for the mesh data characteristic and subscribes to it.
//! Peripheral: advertises the identity-derived service and accepts
//! subscriptions and writes from remote centrals.
//!
//! A device can be linked in one or both roles. `Connected` is reported when
//! the first link to a device comes up, `Disconnected` when the last one
//! goes away. Sends prefer the central link (write) and fall back to the
//! peripheral link (notify).

use super::gatt::GattService;
use super::radio::{CentralRadio, PeripheralRadio, RadioEvent, RadioEventReceiver};
use super::scanner::{BleScanner, ScanSchedule, ScannerState};
use crate::config::BleConfig;
use crate::protocol::PeerKey;
use crate::transport::abstraction::{
    LinkAddress, LocalAdvertisement, TransportChannel, TransportError, TransportEvent,
    TransportEventSender, TransportType,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LinkTable {
    /// Devices we connected to and subscribed on
    central: HashSet<String>,
    /// Remote centrals subscribed to us
    peripheral: HashSet<String>,
    /// Connect attempts in flight
    attempting: HashSet<String>,
    /// Devices without the mesh characteristic; never retried this session
    non_peers: HashSet<String>,
    /// Devices whose connect attempt failed; never retried this session
    failed: HashSet<String>,
    device_to_key: HashMap<String, PeerKey>,
    key_to_device: HashMap<PeerKey, String>,
}

impl LinkTable {
    fn is_linked(&self, device: &str) -> bool {
        self.central.contains(device) || self.peripheral.contains(device)
    }

    fn should_connect(&self, device: &str) -> bool {
        !self.central.contains(device)
            && !self.attempting.contains(device)
            && !self.non_peers.contains(device)
            && !self.failed.contains(device)
    }

    fn forget_association(&mut self, device: &str) {
        if let Some(key) = self.device_to_key.remove(device) {
            self.key_to_device.remove(&key);
        }
    }
}

struct Shared {
    config: BleConfig,
    central: Arc<dyn CentralRadio>,
    peripheral: Arc<dyn PeripheralRadio>,
    links: Mutex<LinkTable>,
    scanner: Mutex<BleScanner>,
    connect_permits: Semaphore,
    events: Mutex<Option<TransportEventSender>>,
    connect_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    async fn emit(&self, event: TransportEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            if sender.send(event).await.is_err() {
                debug!("Transport event dropped: receiver closed");
            }
        }
    }

    async fn handle_radio_event(self: &Arc<Self>, event: RadioEvent) {
        match event {
            RadioEvent::DeviceDiscovered { device, rssi } => {
                self.emit(TransportEvent::Discovered {
                    address: LinkAddress::ble(device.clone()),
                    rssi,
                })
                .await;

                let should_connect = {
                    let mut links = self.links.lock();
                    let go = links.should_connect(&device);
                    if go {
                        links.attempting.insert(device.clone());
                    }
                    go
                };
                if should_connect {
                    self.spawn_connect(device);
                }
            }
            RadioEvent::CentralDisconnected { device } => {
                let lost = {
                    let mut links = self.links.lock();
                    links.central.remove(&device) && !links.peripheral.contains(&device)
                };
                if lost {
                    self.link_lost(device).await;
                }
            }
            RadioEvent::PeripheralSubscribed { device } => {
                let fresh = {
                    let mut links = self.links.lock();
                    let was_linked = links.is_linked(&device);
                    links.peripheral.insert(device.clone());
                    !was_linked
                };
                debug!("Central {} subscribed", device);
                if fresh {
                    self.emit(TransportEvent::Connected {
                        address: LinkAddress::ble(device),
                    })
                    .await;
                }
            }
            RadioEvent::PeripheralDisconnected { device } => {
                let lost = {
                    let mut links = self.links.lock();
                    links.peripheral.remove(&device) && !links.central.contains(&device)
                };
                if lost {
                    self.link_lost(device).await;
                }
            }
            RadioEvent::Notification { device, data }
            | RadioEvent::PeripheralWrite { device, data } => {
                self.emit(TransportEvent::DataReceived {
                    address: LinkAddress::ble(device),
                    data,
                })
                .await;
            }
        }
    }

    async fn link_lost(&self, device: String) {
        self.links.lock().forget_association(&device);
        info!("BLE link to {} lost", device);
        self.emit(TransportEvent::Disconnected {
            address: LinkAddress::ble(device),
        })
        .await;
    }

    fn spawn_connect(self: &Arc<Self>, device: String) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shared.connect_device(device).await;
        });
        let mut tasks = self.connect_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// One bounded connect attempt. Permits serialise attempts because the
    /// radio is shared between both roles.
    async fn connect_device(self: Arc<Self>, device: String) {
        let Ok(_permit) = self.connect_permits.acquire().await else {
            return;
        };

        debug!("Connecting to {}", device);
        let result = tokio::time::timeout(self.config.connect_timeout(), self.establish(&device))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::ConnectTimeout(format!(
                    "{} after {:?}",
                    device,
                    self.config.connect_timeout()
                )))
            });

        match result {
            Ok(()) => {
                let fresh = {
                    let mut links = self.links.lock();
                    links.attempting.remove(&device);
                    let was_linked = links.is_linked(&device);
                    links.central.insert(device.clone());
                    !was_linked
                };
                info!("BLE central link to {} established", device);
                if fresh {
                    self.emit(TransportEvent::Connected {
                        address: LinkAddress::ble(device),
                    })
                    .await;
                }
            }
            Err(TransportError::GattMismatch(reason)) => {
                {
                    let mut links = self.links.lock();
                    links.attempting.remove(&device);
                    links.non_peers.insert(device.clone());
                }
                debug!("{} is not a mesh peer: {}", device, reason);
                if let Err(e) = self.central.disconnect(&device).await {
                    debug!("Disconnect from {} failed: {}", device, e);
                }
            }
            Err(e) => {
                {
                    let mut links = self.links.lock();
                    links.attempting.remove(&device);
                    links.failed.insert(device.clone());
                }
                warn!("Connect to {} failed: {}", device, e);
                if let Err(e) = self.central.disconnect(&device).await {
                    debug!("Disconnect from {} failed: {}", device, e);
                }
                self.emit(TransportEvent::Error {
                    transport: TransportType::BLE,
                    error: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn establish(&self, device: &str) -> Result<(), TransportError> {
        self.central.connect(device).await?;
        match self.central.discover_characteristic(device).await? {
            Some(characteristic) if characteristic.is_mesh_data() => {
                self.central.subscribe(device).await
            }
            Some(characteristic) => Err(TransportError::GattMismatch(format!(
                "unusable characteristic {}",
                characteristic.uuid
            ))),
            None => Err(TransportError::GattMismatch(
                "no data characteristic".to_string(),
            )),
        }
    }

    async fn send_to_device(&self, device: &str, data: &[u8]) -> Result<(), TransportError> {
        let (central, peripheral) = {
            let links = self.links.lock();
            (
                links.central.contains(device),
                links.peripheral.contains(device),
            )
        };

        if central {
            match self.central.write(device, data).await {
                Ok(()) => return Ok(()),
                Err(e) if peripheral => {
                    debug!("Central write to {} failed ({}), trying notify", device, e);
                }
                Err(e) => return Err(e),
            }
        }
        if peripheral {
            return self.peripheral.notify(device, data).await;
        }
        Err(TransportError::NotConnected(device.to_string()))
    }

    async fn run_scan_cycles(self: Arc<Self>) {
        let schedule = self.scanner.lock().schedule();
        loop {
            let _ = self.scanner.lock().start_scanning();
            if let Err(e) = self.central.start_scan().await {
                warn!("Scan start failed: {}", e);
                self.emit(TransportEvent::Error {
                    transport: TransportType::BLE,
                    error: e.to_string(),
                })
                .await;
            }
            tokio::time::sleep(schedule.scan_window).await;

            if let Err(e) = self.central.stop_scan().await {
                debug!("Scan stop failed: {}", e);
            }
            let _ = self.scanner.lock().pause_scanning();
            tokio::time::sleep(schedule.rescan_pause).await;
        }
    }
}

struct RunningTasks {
    radio: JoinHandle<()>,
    scan: JoinHandle<()>,
}

/// `TransportChannel` over a pair of BLE role adapters
pub struct BleCoordinator {
    shared: Arc<Shared>,
    radio_events: Arc<tokio::sync::Mutex<RadioEventReceiver>>,
    running: Mutex<Option<RunningTasks>>,
}

impl BleCoordinator {
    pub fn new(
        config: BleConfig,
        central: Arc<dyn CentralRadio>,
        peripheral: Arc<dyn PeripheralRadio>,
        radio_events: RadioEventReceiver,
    ) -> Self {
        let permits = config.max_concurrent_connects.max(1);
        let schedule = ScanSchedule::from(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                central,
                peripheral,
                links: Mutex::new(LinkTable::default()),
                scanner: Mutex::new(BleScanner::new(schedule)),
                connect_permits: Semaphore::new(permits),
                events: Mutex::new(None),
                connect_tasks: Mutex::new(Vec::new()),
            }),
            radio_events: Arc::new(tokio::sync::Mutex::new(radio_events)),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Abort the current scan cycle and begin a fresh one
    pub fn restart_scan(&self) {
        let mut running = self.running.lock();
        if let Some(tasks) = running.as_mut() {
            tasks.scan.abort();
            self.shared.scanner.lock().stop_scanning();
            tasks.scan = tokio::spawn(Arc::clone(&self.shared).run_scan_cycles());
            debug!("Scan cycle restarted");
        }
    }

    pub fn scanner_state(&self) -> ScannerState {
        self.shared.scanner.lock().state()
    }

    pub fn scan_cycles(&self) -> u64 {
        self.shared.scanner.lock().cycles()
    }

    /// Devices linked in the central role
    pub fn central_links(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.shared.links.lock().central.iter().cloned().collect();
        devices.sort();
        devices
    }

    /// Devices linked in the peripheral role
    pub fn peripheral_links(&self) -> Vec<String> {
        let mut devices: Vec<String> =
            self.shared.links.lock().peripheral.iter().cloned().collect();
        devices.sort();
        devices
    }

    /// Device was rejected for lacking the mesh characteristic
    pub fn is_non_peer(&self, device: &str) -> bool {
        self.shared.links.lock().non_peers.contains(device)
    }

    /// Device's connect attempt failed this session
    pub fn has_failed(&self, device: &str) -> bool {
        self.shared.links.lock().failed.contains(device)
    }

    /// Device currently bound to `peer`, if associated
    pub fn device_for(&self, peer: &PeerKey) -> Option<String> {
        self.shared.links.lock().key_to_device.get(peer).cloned()
    }
}

#[async_trait]
impl TransportChannel for BleCoordinator {
    fn transport_type(&self) -> TransportType {
        TransportType::BLE
    }

    async fn start(
        &self,
        advertisement: &LocalAdvertisement,
        events: TransportEventSender,
    ) -> Result<(), TransportError> {
        if self.is_running() {
            debug!("BLE coordinator already running");
            return Ok(());
        }

        {
            let mut links = self.shared.links.lock();
            links.non_peers.clear();
            links.failed.clear();
        }
        *self.shared.events.lock() = Some(events);

        let service = GattService {
            service_uuid: advertisement.service_uuid,
            ..GattService::for_identity(&advertisement.public_key)
        };
        if let Err(e) = self
            .shared
            .peripheral
            .start_advertising(&service, &advertisement.nickname)
            .await
        {
            *self.shared.events.lock() = None;
            return Err(e);
        }
        info!("📡 Advertising service {}", service.service_uuid);

        let shared = Arc::clone(&self.shared);
        let receiver = Arc::clone(&self.radio_events);
        let radio = tokio::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(event) = receiver.recv().await {
                shared.handle_radio_event(event).await;
            }
            debug!("Radio event stream closed");
        });
        let scan = tokio::spawn(Arc::clone(&self.shared).run_scan_cycles());

        *self.running.lock() = Some(RunningTasks { radio, scan });
        Ok(())
    }

    async fn stop(&self) {
        let Some(tasks) = self.running.lock().take() else {
            return;
        };
        tasks.scan.abort();
        tasks.radio.abort();
        for task in self.shared.connect_tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.scanner.lock().stop_scanning();
        *self.shared.events.lock() = None;

        if let Err(e) = self.shared.central.stop_scan().await {
            debug!("Scan stop failed: {}", e);
        }
        if let Err(e) = self.shared.peripheral.stop_advertising().await {
            debug!("Advertising stop failed: {}", e);
        }

        let (central, peripheral) = {
            let mut links = self.shared.links.lock();
            let central: Vec<String> = links.central.drain().collect();
            let peripheral: Vec<String> = links.peripheral.drain().collect();
            links.attempting.clear();
            links.device_to_key.clear();
            links.key_to_device.clear();
            (central, peripheral)
        };
        for device in central {
            if let Err(e) = self.shared.central.disconnect(&device).await {
                debug!("Central disconnect from {} failed: {}", device, e);
            }
        }
        for device in peripheral {
            if let Err(e) = self.shared.peripheral.disconnect(&device).await {
                debug!("Peripheral disconnect from {} failed: {}", device, e);
            }
        }
        info!("BLE coordinator stopped");
    }

    async fn send(&self, peer: &PeerKey, data: &[u8]) -> Result<(), TransportError> {
        let device = self
            .device_for(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.short()))?;
        self.shared.send_to_device(&device, data).await
    }

    async fn send_to_address(
        &self,
        address: &LinkAddress,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !address.is_ble() {
            return Err(TransportError::TransportNotAvailable(address.to_string()));
        }
        self.shared.send_to_device(&address.id, data).await
    }

    async fn broadcast(&self, data: &[u8]) -> Result<usize, TransportError> {
        let devices: Vec<String> = {
            let links = self.shared.links.lock();
            links.central.union(&links.peripheral).cloned().collect()
        };

        let mut delivered = 0;
        for device in devices {
            match self.shared.send_to_device(&device, data).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", device, e),
            }
        }
        Ok(delivered)
    }

    fn is_reachable(&self, peer: &PeerKey) -> bool {
        let links = self.shared.links.lock();
        links
            .key_to_device
            .get(peer)
            .map(|device| links.is_linked(device))
            .unwrap_or(false)
    }

    fn associate(&self, address: &LinkAddress, peer: PeerKey) {
        if !address.is_ble() {
            return;
        }
        let mut links = self.shared.links.lock();
        links.forget_association(&address.id);
        if let Some(previous) = links.key_to_device.remove(&peer) {
            links.device_to_key.remove(&previous);
        }
        links.device_to_key.insert(address.id.clone(), peer);
        links.key_to_device.insert(peer, address.id.clone());
    }
}

impl Drop for BleCoordinator {
    fn drop(&mut self) {
        if let Some(tasks) = self.running.get_mut().take() {
            tasks.scan.abort();
            tasks.radio.abort();
        }
        for task in self.shared.connect_tasks.lock().drain(..) {
            task.abort();
        }
    }
}
