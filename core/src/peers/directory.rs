//! Peer directory
//!
//! One arena of peer records addressed by stable handles, with lookup maps
//! by public key, BLE device id and alternate address. Every map stores only
//! handles, so a record is never duplicated. A record can exist before its
//! identity is known (a device that connected but has not announced yet);
//! such anonymous records are never exposed as `Peer`.
//!
//! All state sits behind one `RwLock` and every critical section is short
//! and free of `.await`.

use super::peer::{AnnounceOutcome, ConnectionState, Peer, PeerAddresses, SweptPeer};
use crate::protocol::PeerKey;
use crate::transport::LinkAddress;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PeerHandle(usize);

#[derive(Debug, Clone)]
struct PeerRecord {
    public_key: Option<PeerKey>,
    nickname: String,
    state: ConnectionState,
    addresses: PeerAddresses,
    rssi: Option<i16>,
    protocol_version: u8,
    last_seen: Instant,
    persistent: bool,
}

impl PeerRecord {
    fn anonymous(state: ConnectionState) -> Self {
        Self {
            public_key: None,
            nickname: String::new(),
            state,
            addresses: PeerAddresses::default(),
            rssi: None,
            protocol_version: 0,
            last_seen: Instant::now(),
            persistent: false,
        }
    }

    fn snapshot(&self) -> Option<Peer> {
        Some(Peer {
            public_key: self.public_key?,
            nickname: self.nickname.clone(),
            connection_state: self.state,
            addresses: self.addresses.clone(),
            rssi: self.rssi,
            protocol_version: self.protocol_version,
            last_seen: self.last_seen,
            persistent: self.persistent,
        })
    }

    fn has_address(&self, address: &LinkAddress) -> bool {
        if address.is_ble() {
            self.addresses.ble_device_id.as_deref() == Some(address.id.as_str())
        } else {
            self.addresses.alt_address.as_ref() == Some(address)
        }
    }
}

#[derive(Default)]
struct DirectoryInner {
    records: Vec<Option<PeerRecord>>,
    free: Vec<usize>,
    by_key: HashMap<PeerKey, PeerHandle>,
    by_device: HashMap<String, PeerHandle>,
    by_alt: HashMap<LinkAddress, PeerHandle>,
}

impl DirectoryInner {
    fn record(&self, handle: PeerHandle) -> Option<&PeerRecord> {
        self.records.get(handle.0).and_then(Option::as_ref)
    }

    fn record_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerRecord> {
        self.records.get_mut(handle.0).and_then(Option::as_mut)
    }

    fn insert(&mut self, record: PeerRecord) -> PeerHandle {
        match self.free.pop() {
            Some(slot) => {
                self.records[slot] = Some(record);
                PeerHandle(slot)
            }
            None => {
                self.records.push(Some(record));
                PeerHandle(self.records.len() - 1)
            }
        }
    }

    /// Remove a record and every map entry pointing at it
    fn remove(&mut self, handle: PeerHandle) -> Option<PeerRecord> {
        let record = self.records.get_mut(handle.0)?.take()?;
        self.free.push(handle.0);
        if let Some(key) = record.public_key {
            self.by_key.remove(&key);
        }
        if let Some(device) = &record.addresses.ble_device_id {
            self.by_device.remove(device);
        }
        if let Some(alt) = &record.addresses.alt_address {
            self.by_alt.remove(alt);
        }
        Some(record)
    }

    fn lookup_address(&self, address: &LinkAddress) -> Option<PeerHandle> {
        if address.is_ble() {
            self.by_device.get(&address.id).copied()
        } else {
            self.by_alt.get(address).copied()
        }
    }

    fn bind_address(&mut self, handle: PeerHandle, address: &LinkAddress) {
        let previous = match self.record_mut(handle) {
            Some(record) if address.is_ble() => {
                record.addresses.ble_device_id.replace(address.id.clone()).map(LinkAddress::ble)
            }
            Some(record) => record.addresses.alt_address.replace(address.clone()),
            None => return,
        };
        if let Some(previous) = previous.filter(|prev| prev != address) {
            self.unmap_address(&previous);
        }
        if address.is_ble() {
            self.by_device.insert(address.id.clone(), handle);
        } else {
            self.by_alt.insert(address.clone(), handle);
        }
    }

    /// Detach `address` from whichever record holds it; returns that record
    fn unbind_address(&mut self, address: &LinkAddress) -> Option<PeerHandle> {
        let handle = self.lookup_address(address)?;
        self.unmap_address(address);
        if let Some(record) = self.record_mut(handle) {
            if address.is_ble() {
                record.addresses.ble_device_id = None;
            } else {
                record.addresses.alt_address = None;
            }
        }
        Some(handle)
    }

    fn unmap_address(&mut self, address: &LinkAddress) {
        if address.is_ble() {
            self.by_device.remove(&address.id);
        } else {
            self.by_alt.remove(address);
        }
    }

    fn find_or_create(&mut self, address: &LinkAddress, state: ConnectionState) -> PeerHandle {
        if let Some(handle) = self.lookup_address(address) {
            return handle;
        }
        let handle = self.insert(PeerRecord::anonymous(state));
        self.bind_address(handle, address);
        handle
    }

    fn identified(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records
            .iter()
            .flatten()
            .filter(|record| record.public_key.is_some())
    }
}

/// Registry of every device the engine knows about
pub struct PeerDirectory {
    inner: RwLock<DirectoryInner>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DirectoryInner::default()),
        }
    }

    /// A scan result. Creates an anonymous record for unknown addresses.
    pub fn on_discovered(&self, address: &LinkAddress, rssi: Option<i16>) {
        let mut inner = self.inner.write();
        let handle = inner.find_or_create(address, ConnectionState::Discovered);
        if let Some(record) = inner.record_mut(handle) {
            if rssi.is_some() {
                record.rssi = rssi;
            }
        }
    }

    /// A link came up. Identity is still unknown until the device announces.
    pub fn on_transport_connected(&self, address: &LinkAddress) {
        let mut inner = self.inner.write();
        let handle = inner.find_or_create(address, ConnectionState::Connecting);
        if let Some(record) = inner.record_mut(handle) {
            if record.public_key.is_none() || record.state != ConnectionState::Connected {
                record.state = ConnectionState::Connecting;
            }
            record.last_seen = Instant::now();
        }
    }

    /// Apply an ANNOUNCE received over `address`
    pub fn on_announce(
        &self,
        public_key: PeerKey,
        nickname: &str,
        protocol_version: u8,
        address: &LinkAddress,
    ) -> AnnounceOutcome {
        let mut inner = self.inner.write();

        let known = inner.by_key.get(&public_key).copied();
        let via_address = inner.lookup_address(address);

        // The address may belong to another record: an anonymous link record
        // (merged away) or a different identity (the device rekeyed).
        if let Some(other) = via_address.filter(|h| Some(*h) != known) {
            let other_is_anonymous = inner
                .record(other)
                .map(|r| r.public_key.is_none())
                .unwrap_or(false);
            if other_is_anonymous && known.is_some() {
                inner.remove(other);
            } else if !other_is_anonymous {
                inner.unbind_address(address);
                if let Some(record) = inner.record_mut(other) {
                    if record.addresses.is_empty() {
                        record.state = ConnectionState::Disconnected;
                    }
                }
            }
        }

        let now = Instant::now();
        let outcome_handle;
        let kind;
        match known {
            Some(handle) => {
                let had_address = inner
                    .record(handle)
                    .map(|r| r.has_address(address))
                    .unwrap_or(false);
                inner.bind_address(handle, address);
                let Some(record) = inner.record_mut(handle) else {
                    return AnnounceOutcome::Refreshed(placeholder(public_key));
                };
                let changed = record.nickname != nickname
                    || record.protocol_version != protocol_version
                    || !had_address;
                kind = if record.state != ConnectionState::Connected {
                    OutcomeKind::Reconnected
                } else if changed {
                    OutcomeKind::Updated
                } else {
                    OutcomeKind::Refreshed
                };
                record.nickname = nickname.to_string();
                record.protocol_version = protocol_version;
                record.state = ConnectionState::Connected;
                record.last_seen = now;
                outcome_handle = handle;
            }
            None => {
                // Promote the anonymous link record if there is one
                let handle = match inner.lookup_address(address) {
                    Some(handle) => handle,
                    None => {
                        let handle = inner.insert(PeerRecord::anonymous(ConnectionState::Connected));
                        inner.bind_address(handle, address);
                        handle
                    }
                };
                if let Some(record) = inner.record_mut(handle) {
                    record.public_key = Some(public_key);
                    record.nickname = nickname.to_string();
                    record.protocol_version = protocol_version;
                    record.state = ConnectionState::Connected;
                    record.last_seen = now;
                }
                inner.by_key.insert(public_key, handle);
                kind = OutcomeKind::New;
                outcome_handle = handle;
            }
        }

        let peer = inner
            .record(outcome_handle)
            .and_then(PeerRecord::snapshot)
            .unwrap_or_else(|| placeholder(public_key));

        match kind {
            OutcomeKind::New => {
                info!("New peer {} ({}) via {}", peer.display_name(), public_key.short(), address);
                AnnounceOutcome::New(peer)
            }
            OutcomeKind::Reconnected => {
                info!("Peer {} reconnected via {}", peer.display_name(), address);
                AnnounceOutcome::Reconnected(peer)
            }
            OutcomeKind::Updated => {
                debug!("Peer {} updated", peer.display_name());
                AnnounceOutcome::Updated(peer)
            }
            OutcomeKind::Refreshed => AnnounceOutcome::Refreshed(peer),
        }
    }

    /// A link went away. Returns the peer if it just lost its last address.
    pub fn on_transport_disconnected(&self, address: &LinkAddress) -> Option<Peer> {
        let mut inner = self.inner.write();
        let handle = inner.unbind_address(address)?;

        let record = inner.record_mut(handle)?;
        if record.public_key.is_none() {
            inner.remove(handle);
            debug!("Dropped unidentified link {}", address);
            return None;
        }
        if !record.addresses.is_empty() {
            return None;
        }
        record.state = ConnectionState::Disconnected;
        let peer = record.snapshot();
        if let Some(peer) = &peer {
            info!("Peer {} disconnected", peer.display_name());
        }
        peer
    }

    /// Drop records not seen within `threshold`. Persistent peers are kept
    /// but demoted to Disconnected and lose their BLE address.
    pub fn sweep_stale(&self, threshold: Duration) -> Vec<SweptPeer> {
        let now = Instant::now();
        let mut inner = self.inner.write();

        let stale: Vec<PeerHandle> = inner
            .records
            .iter()
            .enumerate()
            .filter_map(|(slot, record)| {
                let record = record.as_ref()?;
                (now.duration_since(record.last_seen) > threshold).then_some(PeerHandle(slot))
            })
            .collect();

        let mut swept = Vec::new();
        for handle in stale {
            let Some(record) = inner.record(handle) else {
                continue;
            };
            let was_connected = record.state == ConnectionState::Connected;

            if record.public_key.is_none() {
                inner.remove(handle);
            } else if record.persistent {
                if record.state == ConnectionState::Disconnected
                    && record.addresses.ble_device_id.is_none()
                {
                    continue;
                }
                if let Some(device) = record.addresses.ble_device_id.clone() {
                    inner.unbind_address(&LinkAddress::ble(device));
                }
                if let Some(record) = inner.record_mut(handle) {
                    record.state = ConnectionState::Disconnected;
                    if let Some(peer) = record.snapshot() {
                        swept.push(SweptPeer {
                            peer,
                            removed: false,
                            was_connected,
                        });
                    }
                }
            } else if let Some(peer) = inner.remove(handle).and_then(|r| r.snapshot()) {
                swept.push(SweptPeer {
                    peer,
                    removed: true,
                    was_connected,
                });
            }
        }

        if !swept.is_empty() {
            debug!("Stale sweep affected {} peers", swept.len());
        }
        swept
    }

    /// Refresh a peer's last-seen time; false if unknown
    pub fn touch(&self, public_key: &PeerKey) -> bool {
        let mut inner = self.inner.write();
        let Some(handle) = inner.by_key.get(public_key).copied() else {
            return false;
        };
        match inner.record_mut(handle) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Mark a peer as surviving stale sweeps; false if unknown
    pub fn set_persistent(&self, public_key: &PeerKey, persistent: bool) -> bool {
        let mut inner = self.inner.write();
        let Some(handle) = inner.by_key.get(public_key).copied() else {
            return false;
        };
        match inner.record_mut(handle) {
            Some(record) => {
                record.persistent = persistent;
                true
            }
            None => false,
        }
    }

    /// All identified peers
    pub fn peers(&self) -> Vec<Peer> {
        let inner = self.inner.read();
        let mut peers: Vec<Peer> = inner.identified().filter_map(PeerRecord::snapshot).collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        peers
    }

    /// Identified peers currently in the Connected state
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.peers()
            .into_iter()
            .filter(Peer::is_connected)
            .collect()
    }

    pub fn get(&self, public_key: &PeerKey) -> Option<Peer> {
        let inner = self.inner.read();
        let handle = inner.by_key.get(public_key)?;
        inner.record(*handle).and_then(PeerRecord::snapshot)
    }

    pub fn is_connected(&self, public_key: &PeerKey) -> bool {
        self.get(public_key)
            .map(|peer| peer.is_connected())
            .unwrap_or(false)
    }

    /// Preferred link address for a peer
    pub fn address_for(&self, public_key: &PeerKey) -> Option<LinkAddress> {
        let inner = self.inner.read();
        let handle = inner.by_key.get(public_key)?;
        inner.record(*handle)?.addresses.primary()
    }

    /// Identity bound to a link address, if it has announced
    pub fn key_for_address(&self, address: &LinkAddress) -> Option<PeerKey> {
        let inner = self.inner.read();
        let handle = inner.lookup_address(address)?;
        inner.record(handle)?.public_key
    }

    /// Linked addresses whose device has not announced yet
    pub fn pending_addresses(&self) -> Vec<LinkAddress> {
        let inner = self.inner.read();
        let mut pending: Vec<LinkAddress> = inner
            .records
            .iter()
            .flatten()
            .filter(|r| r.public_key.is_none() && r.state == ConnectionState::Connecting)
            .filter_map(|r| r.addresses.primary())
            .collect();
        pending.sort();
        pending
    }

    /// Number of records, identified or not
    pub fn len(&self) -> usize {
        self.inner.read().records.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

enum OutcomeKind {
    New,
    Reconnected,
    Updated,
    Refreshed,
}

fn placeholder(public_key: PeerKey) -> Peer {
    Peer {
        public_key,
        nickname: String::new(),
        connection_state: ConnectionState::Connected,
        addresses: PeerAddresses::default(),
        rssi: None,
        protocol_version: 0,
        last_seen: Instant::now(),
        persistent: false,
    }
}
