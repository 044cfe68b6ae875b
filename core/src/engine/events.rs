//! Engine → host callbacks
//!
//! Hosts either implement `MeshDelegate` directly (mobile bindings) or use
//! `ChannelDelegate` and consume a `MeshEvent` stream (CLI, tests, async
//! applications).

use crate::peers::Peer;
use crate::protocol::{NackReason, PeerKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Constructed; `initialize()` not yet successful
    Uninitialized,
    /// Host refused the radio permissions
    PermissionDenied,
    /// Initialized and ready to start
    Ready,
    /// Transport up, dispatcher running
    Running,
    /// Stopped after running; can be started again
    Stopped,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::PermissionDenied => write!(f, "PermissionDenied"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Callback interface for engine events
pub trait MeshDelegate: Send + Sync {
    /// A complete application payload arrived from an identified peer
    fn on_message_received(&self, sender: PeerKey, payload: Vec<u8>);
    /// A peer completed the ANNOUNCE handshake (first time or after a loss)
    fn on_peer_connected(&self, peer: Peer);
    /// A connected peer changed nickname, version or address
    fn on_peer_updated(&self, peer: Peer);
    /// A peer lost its last link or went stale
    fn on_peer_disconnected(&self, peer: Peer);
    fn on_status_changed(&self, status: EngineStatus);

    /// The recipient acknowledged `message_id`
    fn on_delivery_ack(&self, _peer: PeerKey, _message_id: Uuid) {}

    /// The recipient reported `message_id` as undeliverable
    fn on_delivery_failed(&self, _peer: PeerKey, _message_id: Uuid, _reason: NackReason) {}
}

/// Delegate callbacks as values
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MessageReceived { sender: PeerKey, payload: Vec<u8> },
    PeerConnected(Peer),
    PeerUpdated(Peer),
    PeerDisconnected(Peer),
    StatusChanged(EngineStatus),
    DeliveryAck { peer: PeerKey, message_id: Uuid },
    DeliveryFailed { peer: PeerKey, message_id: Uuid, reason: NackReason },
}

/// `MeshDelegate` that forwards every callback into an unbounded channel
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: MeshEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Mesh event dropped: receiver closed");
        }
    }
}

impl MeshDelegate for ChannelDelegate {
    fn on_message_received(&self, sender: PeerKey, payload: Vec<u8>) {
        self.forward(MeshEvent::MessageReceived { sender, payload });
    }

    fn on_peer_connected(&self, peer: Peer) {
        self.forward(MeshEvent::PeerConnected(peer));
    }

    fn on_peer_updated(&self, peer: Peer) {
        self.forward(MeshEvent::PeerUpdated(peer));
    }

    fn on_peer_disconnected(&self, peer: Peer) {
        self.forward(MeshEvent::PeerDisconnected(peer));
    }

    fn on_status_changed(&self, status: EngineStatus) {
        self.forward(MeshEvent::StatusChanged(status));
    }

    fn on_delivery_ack(&self, peer: PeerKey, message_id: Uuid) {
        self.forward(MeshEvent::DeliveryAck { peer, message_id });
    }

    fn on_delivery_failed(&self, peer: PeerKey, message_id: Uuid, reason: NackReason) {
        self.forward(MeshEvent::DeliveryFailed {
            peer,
            message_id,
            reason,
        });
    }
}
