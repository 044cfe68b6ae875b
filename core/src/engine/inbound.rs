// Inbound pipeline - one dispatcher task consumes every transport event
//
// Frame handling order:
//   decode → own loopback → dedup → signature → recipient → type dispatch
//
// Every drop is silent on the network side; nothing is relayed.

use super::EngineInner;
use crate::identity::IdentityKeys;
use crate::peers::AnnounceOutcome;
use crate::protocol::{
    AckPayload, AnnouncePayload, FragmentHeader, NackPayload, Packet, PacketType, PeerKey,
};
use crate::transport::{LinkAddress, TransportEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

impl EngineInner {
    pub(super) async fn run_dispatcher(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Transport event stream closed");
    }

    pub(super) async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered { address, rssi } => {
                trace!("Discovered {} (rssi {:?})", address, rssi);
                self.directory.on_discovered(&address, rssi);
            }
            TransportEvent::Connected { address } => {
                debug!("Link up: {}", address);
                self.directory.on_transport_connected(&address);
                self.send_announce_to(&address).await;
            }
            TransportEvent::Disconnected { address } => {
                debug!("Link down: {}", address);
                if let Some(peer) = self.directory.on_transport_disconnected(&address) {
                    info!("Peer {} disconnected", peer.display_name());
                    self.notify(|d| d.on_peer_disconnected(peer));
                }
            }
            TransportEvent::DataReceived { address, data } => {
                self.handle_frame(&address, &data).await;
            }
            TransportEvent::Error { transport, error } => {
                warn!("{} transport error: {}", transport, error);
            }
        }
    }

    async fn handle_frame(&self, address: &LinkAddress, data: &[u8]) {
        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping {} byte frame from {}: {}", data.len(), address, e);
                return;
            }
        };

        let local = self.local_key();
        if packet.sender == local {
            trace!("Dropping own packet echoed by {}", address);
            return;
        }

        let id = *packet.packet_id.as_bytes();
        if self.seen.lock().might_contain(id) {
            trace!("Duplicate packet {}", packet.packet_id);
            return;
        }
        if !IdentityKeys::verify(&packet) {
            trace!("Bad signature from {}", address);
            return;
        }
        self.seen.lock().add(id);

        if !packet.is_addressed_to(&local) {
            debug!(
                "Dropping {:?} for {} (not relayed)",
                packet.packet_type,
                packet.recipient.short()
            );
            return;
        }

        match packet.packet_type {
            PacketType::Announce => self.handle_announce(address, &packet),
            PacketType::Message => self.handle_message(packet).await,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => {
                self.handle_fragment(packet).await
            }
            PacketType::Ack => match AckPayload::decode(&packet.payload) {
                Ok(ack) => {
                    debug!("ACK {} from {}", ack.message_id, packet.sender.short());
                    self.notify(|d| d.on_delivery_ack(packet.sender, ack.message_id));
                }
                Err(e) => debug!("Malformed ACK from {}: {}", address, e),
            },
            PacketType::Nack => match NackPayload::decode(&packet.payload) {
                Ok(nack) => {
                    debug!(
                        "NACK {} from {}: {}",
                        nack.message_id,
                        packet.sender.short(),
                        nack.reason
                    );
                    self.notify(|d| d.on_delivery_failed(packet.sender, nack.message_id, nack.reason));
                }
                Err(e) => debug!("Malformed NACK from {}: {}", address, e),
            },
        }
    }

    fn handle_announce(&self, address: &LinkAddress, packet: &Packet) {
        // Announces describe the direct link only and are never relayed
        if packet.ttl() != 0 {
            debug!("Dropping ANNOUNCE with ttl {} from {}", packet.ttl(), address);
            return;
        }
        let announce = match AnnouncePayload::decode(&packet.payload) {
            Ok(announce) => announce,
            Err(e) => {
                debug!("Malformed ANNOUNCE from {}: {}", address, e);
                return;
            }
        };
        if announce.public_key != packet.sender {
            debug!("ANNOUNCE key does not match sender on {}", address);
            return;
        }

        let outcome = self.directory.on_announce(
            packet.sender,
            &announce.nickname,
            announce.protocol_version,
            address,
        );
        self.transport.associate(address, packet.sender);

        match outcome {
            AnnounceOutcome::New(peer) | AnnounceOutcome::Reconnected(peer) => {
                info!("🤝 Peer {} connected via {}", peer.display_name(), address);
                self.notify(|d| d.on_peer_connected(peer));
            }
            AnnounceOutcome::Updated(peer) => {
                debug!("Peer {} updated", peer.display_name());
                self.notify(|d| d.on_peer_updated(peer));
            }
            AnnounceOutcome::Refreshed(peer) => {
                trace!("Peer {} refreshed", peer.public_key.short());
            }
        }
    }

    /// Application data is only accepted from identified, connected peers
    fn accept_data_from(&self, packet: &Packet) -> bool {
        if !self.directory.is_connected(&packet.sender) {
            debug!(
                "Dropping {:?} from unannounced sender {}",
                packet.packet_type,
                packet.sender.short()
            );
            return false;
        }
        self.directory.touch(&packet.sender);
        true
    }

    async fn handle_message(&self, packet: Packet) {
        if !self.accept_data_from(&packet) {
            return;
        }
        let sender = packet.sender;
        let broadcast = packet.is_broadcast();
        let message_id = packet.packet_id;

        debug!("Message of {} bytes from {}", packet.payload.len(), sender.short());
        self.notify(|d| d.on_message_received(sender, packet.payload));

        if self.config.delivery_acks && !broadcast {
            self.acknowledge(sender, message_id).await;
        }
    }

    async fn handle_fragment(&self, packet: Packet) {
        if !self.accept_data_from(&packet) {
            return;
        }
        let Some(payload) = self.assembler.lock().process_fragment(&packet) else {
            return;
        };

        let sender = packet.sender;
        debug!("Reassembled {} bytes from {}", payload.len(), sender.short());
        self.notify(|d| d.on_message_received(sender, payload));

        if self.config.delivery_acks && !packet.is_broadcast() {
            if let Ok(header) = FragmentHeader::from_bytes(&packet.payload) {
                self.acknowledge(sender, Uuid::from_bytes(header.message_id))
                    .await;
            }
        }
    }

    async fn acknowledge(&self, sender: PeerKey, message_id: Uuid) {
        let payload = AckPayload { message_id }.encode();
        self.send_receipt(PacketType::Ack, sender, payload).await;
    }
}
