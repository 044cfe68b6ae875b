//! Protocol engine: the facade hosts talk to
//!
//! Wires identity, the dedup filter, the fragment assembler and the peer
//! directory to one `TransportChannel`. All transport events flow through a
//! single dispatcher task; two tickers run the periodic ANNOUNCE/stale sweep
//! and the fragment session reaper.
//!
//! Delivery is direct only. `send` to a peer that is not currently
//! reachable fails immediately; nothing is queued or retried.

mod events;
mod inbound;
mod tasks;

pub use events::{ChannelDelegate, EngineStatus, MeshDelegate, MeshEvent};

use crate::config::{ConfigError, EngineConfig};
use crate::dedup::BloomFilter;
use crate::identity::IdentityManager;
use crate::peers::{Peer, PeerDirectory};
use crate::platform::{AlwaysGranted, PermissionsProvider};
use crate::protocol::announce::MAX_NICKNAME_LEN;
use crate::protocol::{
    AnnouncePayload, FragmentAssembler, FragmentHeader, Packet, PacketType, PeerKey,
    ProtocolError,
};
use crate::transport::{
    LinkAddress, LocalAdvertisement, TransportChannel, TransportError, EVENT_CHANNEL_CAPACITY,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Engine not running")]
    NotRunning,

    #[error("Radio permissions denied")]
    PermissionDenied,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Point-in-time counters for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub status: EngineStatus,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub fragment_sessions: usize,
    pub seen_packet_ids: usize,
    pub dedup_rotations: u64,
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared between the facade and the engine tasks
struct EngineInner {
    config: EngineConfig,
    identity: Arc<IdentityManager>,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn TransportChannel>,
    seen: Mutex<BloomFilter>,
    assembler: Mutex<FragmentAssembler>,
    delegate: RwLock<Option<Arc<dyn MeshDelegate>>>,
    status: RwLock<EngineStatus>,
}

impl EngineInner {
    fn local_key(&self) -> PeerKey {
        self.identity.public_key()
    }

    fn notify(&self, callback: impl FnOnce(&dyn MeshDelegate)) {
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            callback(delegate.as_ref());
        }
    }

    fn set_status(&self, status: EngineStatus) {
        let changed = {
            let mut current = self.status.write();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            debug!("Engine status -> {}", status);
            self.notify(|d| d.on_status_changed(status));
        }
    }

    fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// Build and sign a packet from this device
    fn signed_packet(
        &self,
        packet_type: PacketType,
        ttl: u8,
        recipient: Option<PeerKey>,
        payload: Vec<u8>,
    ) -> Result<Packet, ProtocolError> {
        let mut packet = Packet::new(packet_type, ttl, self.local_key(), recipient, payload)?;
        self.identity.sign(&mut packet)?;
        Ok(packet)
    }

    /// ANNOUNCE for this device. Never relayed, so ttl is 0.
    fn announce_packet(&self) -> Result<Packet, ProtocolError> {
        let payload = AnnouncePayload::new(
            self.local_key(),
            self.config.protocol_version,
            self.identity.nickname(),
        )
        .encode();
        let packet = self.signed_packet(PacketType::Announce, 0, None, payload)?;
        self.seen.lock().add(packet.packet_id.as_bytes());
        Ok(packet)
    }

    /// Handshake on a fresh link, before the remote identity is known
    async fn send_announce_to(&self, address: &LinkAddress) {
        let packet = match self.announce_packet() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to build ANNOUNCE: {}", e);
                return;
            }
        };
        match self
            .transport
            .send_to_address(address, &packet.serialize())
            .await
        {
            Ok(()) => debug!("ANNOUNCE sent to {}", address),
            Err(e) => warn!("ANNOUNCE to {} failed: {}", address, e),
        }
    }

    async fn broadcast_announce(&self) -> usize {
        let packet = match self.announce_packet() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to build ANNOUNCE: {}", e);
                return 0;
            }
        };
        match self.transport.broadcast(&packet.serialize()).await {
            Ok(count) => {
                debug!("ANNOUNCE broadcast to {} link(s)", count);
                count
            }
            Err(e) => {
                warn!("ANNOUNCE broadcast failed: {}", e);
                0
            }
        }
    }

    /// Signed packets for one application payload, in transmission order.
    /// Returns the id receipts refer to: the packet id of a single Message,
    /// or the fragment message id.
    fn outbound_packets(
        &self,
        recipient: Option<PeerKey>,
        payload: &[u8],
    ) -> Result<(Uuid, Vec<Packet>), MeshError> {
        let ttl = self.config.message_ttl;
        let fragmented = {
            let assembler = self.assembler.lock();
            if assembler.needs_fragmentation(payload) {
                Some(assembler.fragment(payload, self.local_key(), recipient, ttl)?)
            } else {
                None
            }
        };

        match fragmented {
            Some(mut packets) => {
                let first = packets.first().ok_or_else(|| {
                    ProtocolError::InvalidState("fragmentation produced no packets".to_string())
                })?;
                let header = FragmentHeader::from_bytes(&first.payload)?;
                for packet in packets.iter_mut() {
                    self.identity.sign(packet)?;
                }
                Ok((Uuid::from_bytes(header.message_id), packets))
            }
            None => {
                let packet =
                    self.signed_packet(PacketType::Message, ttl, recipient, payload.to_vec())?;
                Ok((packet.packet_id, vec![packet]))
            }
        }
    }

    /// Send a receipt (ACK / NACK) straight to `recipient`
    async fn send_receipt(&self, packet_type: PacketType, recipient: PeerKey, payload: Vec<u8>) {
        let packet = match self.signed_packet(packet_type, 0, Some(recipient), payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to build {:?}: {}", packet_type, e);
                return;
            }
        };
        self.seen.lock().add(packet.packet_id.as_bytes());
        if let Err(e) = self.transport.send(&recipient, &packet.serialize()).await {
            debug!("{:?} to {} failed: {}", packet_type, recipient.short(), e);
        }
    }

    fn is_reachable(&self, peer: &PeerKey) -> bool {
        self.directory.is_connected(peer) && self.transport.is_reachable(peer)
    }

    fn sweep_stale(&self) {
        for swept in self.directory.sweep_stale(self.config.stale_threshold()) {
            if swept.removed {
                debug!("Swept stale peer {}", swept.peer.public_key.short());
            } else {
                debug!("Demoted stale persistent peer {}", swept.peer.public_key.short());
            }
            if swept.was_connected {
                info!("Peer {} went stale", swept.peer.display_name());
                self.notify(|d| d.on_peer_disconnected(swept.peer));
            }
        }
    }
}

// ============================================================================
// PROTOCOL ENGINE
// ============================================================================

struct EngineTasks {
    dispatcher: JoinHandle<()>,
    announcer: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl EngineTasks {
    fn abort(&self) {
        self.dispatcher.abort();
        self.announcer.abort();
        self.reaper.abort();
    }
}

pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
    permissions: Arc<dyn PermissionsProvider>,
    tasks: Mutex<Option<EngineTasks>>,
    /// Serialises start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl ProtocolEngine {
    /// Create an engine over `transport`. A non-empty `config.nickname`
    /// replaces the identity's nickname.
    pub fn new(
        config: EngineConfig,
        identity: Arc<IdentityManager>,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn TransportChannel>,
    ) -> Self {
        if !config.nickname.is_empty() {
            identity.set_nickname(config.nickname.clone());
        }
        Self {
            inner: Arc::new(EngineInner {
                config,
                identity,
                directory,
                transport,
                seen: Mutex::new(BloomFilter::new()),
                assembler: Mutex::new(FragmentAssembler::new()),
                delegate: RwLock::new(None),
                status: RwLock::new(EngineStatus::Uninitialized),
            }),
            permissions: Arc::new(AlwaysGranted),
            tasks: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Use `permissions` instead of assuming the radio is available
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionsProvider>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn MeshDelegate>>) {
        *self.inner.delegate.write() = delegate;
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Validate configuration and acquire radio permissions
    pub fn initialize(&self) -> bool {
        match self.try_initialize() {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine initialization failed: {}", e);
                false
            }
        }
    }

    pub fn try_initialize(&self) -> Result<(), MeshError> {
        if self.inner.status() == EngineStatus::Running {
            return Err(MeshError::AlreadyRunning);
        }

        let config = &self.inner.config;
        config.validate()?;

        if !self.permissions.has_permissions() && !self.permissions.request() {
            self.inner.set_status(EngineStatus::PermissionDenied);
            return Err(MeshError::PermissionDenied);
        }

        *self.inner.assembler.lock() = FragmentAssembler::with_limits(
            config.fragment_threshold,
            config.fragment_chunk_size,
            config.reassembly_timeout(),
        )?;
        *self.inner.seen.lock() = BloomFilter::with_params(
            config.bloom_capacity,
            config.bloom_false_positive_rate,
            config.bloom_rotation_interval(),
        );

        self.inner.set_status(EngineStatus::Ready);
        Ok(())
    }

    /// Bring the transport up and start the engine tasks
    pub async fn start(&self) -> Result<(), MeshError> {
        let _guard = self.lifecycle.lock().await;
        match self.inner.status() {
            EngineStatus::Ready | EngineStatus::Stopped => {}
            EngineStatus::Running => return Err(MeshError::AlreadyRunning),
            EngineStatus::Uninitialized | EngineStatus::PermissionDenied => {
                return Err(MeshError::NotInitialized)
            }
        }

        info!("Protocol engine starting...");
        let identity = &self.inner.identity;
        let advertisement = LocalAdvertisement {
            public_key: identity.public_key(),
            service_uuid: identity.ble_service_uuid(),
            nickname: identity.nickname(),
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.transport.start(&advertisement, tx).await?;

        let tasks = EngineTasks {
            dispatcher: tokio::spawn(Arc::clone(&self.inner).run_dispatcher(rx)),
            announcer: tokio::spawn(tasks::run_announcer(Arc::clone(&self.inner))),
            reaper: tokio::spawn(tasks::run_fragment_reaper(Arc::clone(&self.inner))),
        };
        *self.tasks.lock() = Some(tasks);

        self.inner.set_status(EngineStatus::Running);
        info!(
            "Protocol engine started as {} ({})",
            identity.public_key().short(),
            advertisement.service_uuid
        );
        Ok(())
    }

    /// Stop the engine tasks and the transport. Writes already handed to
    /// the radio are not recalled.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        info!("Protocol engine stopping...");
        tasks.abort();
        self.inner.transport.stop().await;

        // Every link is gone with the transport
        let directory = &self.inner.directory;
        let mut addresses: Vec<LinkAddress> = directory.pending_addresses();
        for peer in directory.connected_peers() {
            addresses.extend(peer.addresses.ble_device_id.clone().map(LinkAddress::ble));
            addresses.extend(peer.addresses.alt_address.clone());
        }
        for address in addresses {
            if let Some(peer) = directory.on_transport_disconnected(&address) {
                self.inner.notify(|d| d.on_peer_disconnected(peer));
            }
        }

        self.inner.set_status(EngineStatus::Stopped);
        info!("Protocol engine stopped");
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status()
    }

    pub fn is_running(&self) -> bool {
        self.status() == EngineStatus::Running
    }

    pub fn stats(&self) -> EngineStats {
        let (seen_packet_ids, dedup_rotations) = {
            let seen = self.inner.seen.lock();
            (seen.len(), seen.rotations())
        };
        EngineStats {
            status: self.status(),
            known_peers: self.inner.directory.len(),
            connected_peers: self.inner.directory.connected_peers().len(),
            fragment_sessions: self.inner.assembler.lock().active_sessions(),
            seen_packet_ids,
            dedup_rotations,
        }
    }

    // ------------------------------------------------------------------------
    // MESSAGING
    // ------------------------------------------------------------------------

    /// Send `payload` to `recipient`; false when the peer is unreachable or
    /// the transport rejected a write
    pub async fn send(&self, recipient: &PeerKey, payload: &[u8]) -> bool {
        match self.try_send(recipient, payload).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Send to {} failed: {}", recipient.short(), e);
                false
            }
        }
    }

    /// Send `payload` to `recipient`, returning the id a delivery receipt
    /// will carry
    pub async fn try_send(&self, recipient: &PeerKey, payload: &[u8]) -> Result<Uuid, MeshError> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }
        if !self.inner.is_reachable(recipient) {
            return Err(MeshError::Unreachable(recipient.short()));
        }

        let (message_id, packets) = self.inner.outbound_packets(Some(*recipient), payload)?;
        let fragment_count = packets.len();
        for (index, packet) in packets.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.config.fragment_delay()).await;
            }
            self.inner.seen.lock().add(packet.packet_id.as_bytes());
            self.inner
                .transport
                .send(recipient, &packet.serialize())
                .await?;
        }

        debug!(
            "Sent {} bytes to {} in {} packet(s)",
            payload.len(),
            recipient.short(),
            fragment_count
        );
        Ok(message_id)
    }

    /// Send `payload` to every connected peer; returns how many received
    /// every packet
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        if !self.is_running() {
            return 0;
        }
        let recipients: Vec<PeerKey> = self
            .inner
            .directory
            .connected_peers()
            .into_iter()
            .map(|peer| peer.public_key)
            .filter(|key| self.inner.transport.is_reachable(key))
            .collect();
        if recipients.is_empty() {
            return 0;
        }

        let packets = match self.inner.outbound_packets(None, payload) {
            Ok((_, packets)) => packets,
            Err(e) => {
                warn!("Broadcast failed: {}", e);
                return 0;
            }
        };

        let mut failed: HashSet<PeerKey> = HashSet::new();
        for (index, packet) in packets.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.config.fragment_delay()).await;
            }
            self.inner.seen.lock().add(packet.packet_id.as_bytes());
            let bytes = packet.serialize();
            for recipient in &recipients {
                if failed.contains(recipient) {
                    continue;
                }
                if let Err(e) = self.inner.transport.send(recipient, &bytes).await {
                    debug!("Broadcast to {} failed: {}", recipient.short(), e);
                    failed.insert(*recipient);
                }
            }
        }
        recipients.len() - failed.len()
    }

    // ------------------------------------------------------------------------
    // PEERS & IDENTITY
    // ------------------------------------------------------------------------

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.directory.peers()
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.inner.directory.connected_peers()
    }

    pub fn peer(&self, key: &PeerKey) -> Option<Peer> {
        self.inner.directory.get(key)
    }

    /// Connected through the handshake and a live link
    pub fn is_reachable(&self, key: &PeerKey) -> bool {
        self.inner.is_reachable(key)
    }

    /// Flag a peer as persistent (a "friend"): stale sweeps demote it
    /// instead of forgetting it
    pub fn set_persistent(&self, key: &PeerKey, persistent: bool) -> bool {
        self.inner.directory.set_persistent(key, persistent)
    }

    /// Change the display nickname; a running engine re-announces at once
    pub async fn set_nickname(&self, nickname: &str) -> Result<(), MeshError> {
        if nickname.len() > MAX_NICKNAME_LEN {
            return Err(ConfigError::NicknameTooLong(nickname.len()).into());
        }
        self.inner.identity.set_nickname(nickname);
        if self.is_running() {
            self.inner.broadcast_announce().await;
        }
        Ok(())
    }

    pub fn nickname(&self) -> String {
        self.inner.identity.nickname()
    }

    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.inner.identity
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.inner.directory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.abort();
        }
    }
}
